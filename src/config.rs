//! 搜索配置和数据结构定义

use byteorder::{ByteOrder, LittleEndian};
use std::path::PathBuf;

use crate::mnemonic::WORD_COUNT;

/// 助记词派生模式
///
/// 唯一的模式选择器: 候选空间上限、内核编译宏和主机端校验都从这里读取。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedMode {
    /// 标准 BIP39 (m/84'/0'/0'/0/0)
    #[default]
    Bip39,
    /// Electrum v2 (m/0'/0/0)，不校验 BIP39 校验和
    Electrum,
}

impl SeedMode {
    pub fn from_flag(electrum: bool) -> Self {
        if electrum {
            SeedMode::Electrum
        } else {
            SeedMode::Bip39
        }
    }

    /// 第 12 个位置最多贡献的候选数
    pub fn checksum_cap(self) -> u32 {
        match self {
            SeedMode::Bip39 => 128,
            SeedMode::Electrum => 128 * 16,
        }
    }

    pub fn is_electrum(self) -> bool {
        self == SeedMode::Electrum
    }

    pub fn label(self) -> &'static str {
        match self {
            SeedMode::Bip39 => "BIP39",
            SeedMode::Electrum => "Electrum",
        }
    }
}

/// 索引选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// 顺序游标，支持检查点续跑
    #[default]
    Sequential,
    /// 区间内随机取不重复索引，不写检查点
    Random,
}

/// 遍历对象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BruteTarget {
    /// 遍历助记词
    #[default]
    Seed,
    /// 助记词固定，遍历密码 (候选词缓冲区不上传)
    Password,
}

/// 运行时配置 (由命令行 / 环境变量 / .env 组装)
#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// 12 词模板，`?` 或 `?前缀` 为通配
    pub seed: String,
    /// BIP39 密码 (passphrase)
    pub password: String,
    pub brute_target: BruteTarget,
    pub seed_mode: SeedMode,
    pub strategy: Strategy,
    /// 每次 dispatch 的工作项数量 (64 的倍数)
    pub batch_width: usize,
    /// 本地工作组大小，None 由驱动选择
    pub work_group_size: Option<usize>,
    /// 单个 slot 的大小
    pub chunk_size: u64,
    pub total_slots: u64,
    /// 协调与上报服务地址，空字符串表示禁用 (上报只写日志)
    pub slot_api_url: String,
    pub max_hits: usize,
    pub targets_path: PathBuf,
    pub kernel_dir: PathBuf,
    pub env_file: PathBuf,
    /// 在编译选项中加入时间戳宏，使每次运行都重新编译
    pub cache_bust: bool,
    pub wnaf_window: u32,
    pub bloom_bits: u64,
    /// 实例标识 (云主机容器 ID)，参与设备 ID 计算
    pub instance_id: String,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            seed: String::new(),
            password: String::new(),
            brute_target: BruteTarget::Seed,
            seed_mode: SeedMode::Bip39,
            strategy: Strategy::Sequential,
            batch_width: 32_000 - 32_000 % 64,
            work_group_size: None,
            chunk_size: 1_000_000_000_000,
            total_slots: 2225,
            slot_api_url: String::new(),
            max_hits: 5,
            targets_path: PathBuf::from("addresses.txt"),
            kernel_dir: PathBuf::from("kernel"),
            env_file: PathBuf::from(".env"),
            cache_bust: false,
            wnaf_window: 2,
            bloom_bits: 1 << 27,
            instance_id: String::new(),
        }
    }
}

/// 将线程数向下取整为 64 的倍数
pub fn round_batch_width(threads: usize) -> usize {
    threads - threads % 64
}

/// 命中记录 (从 GPU 传回)
/// 注意：必须与 OpenCL 端 hit_t 结构体完全匹配
/// OpenCL 布局: widx[12] (ushort) @0, tag64 (ulong) @24, 总大小 32 bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HitRecord {
    /// 12 个单词索引 (0 起)
    pub widx: [u16; WORD_COUNT],
    /// 命中的 64 位标签
    pub tag64: u64,
}

impl HitRecord {
    pub const SIZE: usize = 32;

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut widx = [0u16; WORD_COUNT];
        LittleEndian::read_u16_into(&bytes[..WORD_COUNT * 2], &mut widx);
        Self {
            widx,
            tag64: LittleEndian::read_u64(&bytes[24..32]),
        }
    }

    /// 清零返回的单词索引
    pub fn wipe(&mut self) {
        self.widx.fill(0);
    }
}

/// 每次 dispatch 必定写入的一条校验样本
/// OpenCL 布局: mnemo[128] @0, address[92] @128, 总大小 220 bytes
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VerifySample {
    /// 以 0 结尾的助记词文本
    pub mnemo: [u8; 128],
    /// 以 0 结尾的 bech32 地址
    pub address: [u8; 92],
}

impl Default for VerifySample {
    fn default() -> Self {
        Self {
            mnemo: [0u8; 128],
            address: [0u8; 92],
        }
    }
}

impl VerifySample {
    pub const SIZE: usize = 220;

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut sample = Self::default();
        sample.mnemo.copy_from_slice(&bytes[..128]);
        sample.address.copy_from_slice(&bytes[128..220]);
        sample
    }

    pub fn mnemonic(&self) -> String {
        c_string(&self.mnemo)
    }

    pub fn address(&self) -> String {
        c_string(&self.address)
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        // 验证结构体大小与 OpenCL 端匹配
        assert_eq!(std::mem::size_of::<HitRecord>(), HitRecord::SIZE);
        assert_eq!(std::mem::size_of::<VerifySample>(), VerifySample::SIZE);
    }

    #[test]
    fn test_checksum_cap() {
        assert_eq!(SeedMode::Bip39.checksum_cap(), 128);
        assert_eq!(SeedMode::Electrum.checksum_cap(), 2048);
        assert_eq!(SeedMode::from_flag(true), SeedMode::Electrum);
    }

    #[test]
    fn test_round_batch_width() {
        assert_eq!(round_batch_width(32_000), 31_936);
        assert_eq!(round_batch_width(64), 64);
        assert_eq!(round_batch_width(63), 0);
        assert_eq!(SearchSettings::default().batch_width, 31_936);
    }

    #[test]
    fn test_hit_record_decode() {
        let mut bytes = vec![0u8; HitRecord::SIZE];
        bytes[0] = 0x01;
        bytes[1] = 0x02;
        bytes[22] = 0xFF;
        bytes[23] = 0x07;
        bytes[24..32].copy_from_slice(&0x1122334455667788u64.to_le_bytes());

        let mut hit = HitRecord::from_bytes(&bytes);
        assert_eq!(hit.widx[0], 0x0201);
        assert_eq!(hit.widx[11], 0x07FF);
        assert_eq!(hit.tag64, 0x1122334455667788);

        hit.wipe();
        assert_eq!(hit.widx, [0u16; 12]);
    }

    #[test]
    fn test_verify_sample_strings() {
        let mut bytes = vec![0u8; VerifySample::SIZE];
        bytes[..5].copy_from_slice(b"zoo  ");
        bytes[128..132].copy_from_slice(b"bc1q");
        let sample = VerifySample::from_bytes(&bytes);
        assert_eq!(sample.mnemonic(), "zoo");
        assert_eq!(sample.address(), "bc1q");
    }
}
