//! GPU 助记词恢复系统 - 主程序
//!
//! 所有参数都可以通过环境变量或 `.env` 文件提供，例如:
//!   SEED="abandon ? ? ... about" TARGETS=addresses.txt cargo run --release
//!   cargo run --release -- --seed "..." --electrum-seed --random

use clap::ArgAction;
use clap::Parser;
use clap::builder::FalseyValueParser;
use log::info;
use std::path::PathBuf;

use seed_recovery_cl::config::round_batch_width;
use seed_recovery_cl::{BruteTarget, SearchRequest, SearchSettings, SeedMode, Strategy, search};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "seed-recovery-cl")]
#[command(about = "GPU 助记词恢复系统")]
#[command(version = "0.1.0")]
struct Args {
    /// 12 词模板，`?` 为通配，`?ab` 为带前缀的通配
    #[arg(long, env = "SEED", default_value = "", hide_env_values = true)]
    seed: String,

    /// BIP39 密码 (passphrase)
    #[arg(long, env = "PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// 固定助记词，遍历密码
    #[arg(long, env = "BRUTE_PASSWORD_NOT_SEED", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    brute_password_not_seed: bool,

    /// 使用 Electrum v2 派生
    #[arg(long, env = "ELECTRUM_SEED", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    electrum_seed: bool,

    /// 随机取样而不是顺序遍历
    #[arg(long, env = "RANDOM", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    random: bool,

    /// 每次 dispatch 的 GPU 线程数 (向下取整为 64 的倍数)
    #[arg(long, env = "GPU_THREADS", default_value = "32000")]
    gpu_threads: usize,

    /// 本地工作组大小，0 表示由驱动决定
    #[arg(long, env = "WORKERS", default_value = "0")]
    workers: usize,

    /// 单个 slot 的大小
    #[arg(long, env = "CHUNK_SIZE", default_value = "1000000000000")]
    chunk_size: u64,

    /// 全局 slot 数量
    #[arg(long, env = "TOTAL_SLOTS", default_value = "2225")]
    total_slots: u64,

    /// 协调与上报服务地址
    #[arg(long, env = "SLOT_API_URL", default_value = "")]
    slot_api_url: String,

    /// 每次 dispatch 最多读取的命中数
    #[arg(long, env = "MAX_HITS", default_value = "5")]
    max_hits: usize,

    /// 目标地址文件 (可为 .gz)
    #[arg(long, env = "TARGETS", default_value = "addresses.txt")]
    targets: PathBuf,

    /// 内核源码目录
    #[arg(long, env = "KERNEL_DIR", default_value = "kernel")]
    kernel_dir: PathBuf,

    /// 参与内核缓存哈希的配置文件
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// 每次运行都重新编译内核
    #[arg(long, env = "CACHE_BUST", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    cache_bust: bool,

    /// 窗口宽度
    #[arg(long, default_value = "2")]
    wnaf_window: u32,

    /// 布隆过滤器位数 (2 的幂)
    #[arg(long, default_value = "134217728")]
    bloom_bits: u64,

    /// SEED 为空时的熵高 64 位
    #[arg(long = "high", env = "H", hide_env_values = true)]
    h: Option<u64>,

    /// SEED 为空时的熵低 64 位
    #[arg(long = "low", env = "L", hide_env_values = true)]
    l: Option<u64>,

    /// 还原的模板末尾替换为通配的单词数
    #[arg(long, env = "MISSING_WORDS")]
    missing_words: Option<usize>,

    /// 实例标识，参与设备 ID
    #[arg(long, env = "CONTAINER_ID", default_value = "")]
    container_id: String,
}

impl Args {
    fn into_request(self) -> anyhow::Result<SearchRequest> {
        let entropy_pair = match (self.h, self.l) {
            (Some(h), Some(l)) => Some((h, l)),
            (None, None) => None,
            _ => anyhow::bail!("H and L must be given together"),
        };
        let settings = SearchSettings {
            seed: self.seed,
            password: self.password,
            brute_target: if self.brute_password_not_seed {
                BruteTarget::Password
            } else {
                BruteTarget::Seed
            },
            seed_mode: SeedMode::from_flag(self.electrum_seed),
            strategy: if self.random {
                Strategy::Random
            } else {
                Strategy::Sequential
            },
            batch_width: round_batch_width(self.gpu_threads),
            work_group_size: (self.workers > 0).then_some(self.workers),
            chunk_size: self.chunk_size,
            total_slots: self.total_slots,
            slot_api_url: self.slot_api_url,
            max_hits: self.max_hits,
            targets_path: self.targets,
            kernel_dir: self.kernel_dir,
            env_file: self.env_file,
            cache_bust: self.cache_bust,
            wnaf_window: self.wnaf_window,
            bloom_bits: self.bloom_bits,
            instance_id: self.container_id,
        };
        Ok(SearchRequest {
            settings,
            entropy_pair,
            missing_words: self.missing_words,
        })
    }
}

/// 主函数
fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("启动 GPU 助记词恢复系统");

    let request = args.into_request()?;
    let s = &request.settings;
    info!(
        "模式: {} | 策略: {:?} | 线程: {} | 工作组: {:?} | 目标: {}",
        s.seed_mode.label(),
        s.strategy,
        s.batch_width,
        s.work_group_size,
        s.targets_path.display()
    );

    let response = search(request)?;

    println!();
    println!("========================================");
    println!("Slot: {} | 检查点: {}", response.plan.job_id, response.plan.checkpoint_pos);
    println!(
        "完成设备: {} | 失败设备: {}",
        response.completed_devices, response.failed_devices
    );
    let secs = response.elapsed.as_secs_f64();
    let speed = if secs > 0.0 {
        response.total_scanned as f64 / secs
    } else {
        0.0
    };
    println!("搜索时间: {:.2} 秒", secs);
    println!(
        "检查数: {} | 平均速度: {:.0} 个/秒",
        response.total_scanned, speed
    );
    println!("========================================");

    if response.failed_devices > 0 && response.completed_devices == 0 {
        anyhow::bail!("all devices failed");
    }
    Ok(())
}
