//! 搜索空间划分与跨进程检查点
//!
//! 全局空间按 slot (job) 切块，每个进程从协调服务领取一个 slot，
//! 再把 slot 内剩余部分平均分给本机的 GPU。检查点在单个锁内读改写后上报。

use log::{info, warn};
use parking_lot::Mutex;
use rand::Rng;
use reqwest::blocking::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{SeedMode, Strategy};
use crate::error::{Error, Result};
use crate::mnemonic::WORD_COUNT;

/// 协调服务不可用时随机 job 的上限
pub const FALLBACK_MAX_JOB: i64 = 2048;
/// 协调服务不可用时的 slot 大小
pub const FALLBACK_CHUNK_SIZE: u64 = 10_000_000;

/// 内核索引上限 (`low` 为 64 位)
pub const KERNEL_INDEX_LIMIT: u128 = 1 << 64;

/// 总搜索空间: 各位置候选数之积，第 12 位受校验和上限约束
///
/// 全部通配时 (2048^11 × 128 = 2^128) 超出 u128，返回 `SpaceTooLarge`。
pub fn compute_total_space(lens: &[u32; WORD_COUNT], mode: SeedMode) -> Result<u128> {
    let cap = mode.checksum_cap();
    lens.iter().enumerate().try_fold(1u128, |acc, (i, &len)| {
        let len = if i == WORD_COUNT - 1 { len.min(cap) } else { len };
        acc.checked_mul(len as u128).ok_or(Error::SpaceTooLarge)
    })
}

/// 平均划分，余数分给前面的 GPU，返回 (offsets, sizes)
pub fn partition(total: u128, n_gpus: usize) -> Result<(Vec<u128>, Vec<u128>)> {
    if n_gpus == 0 {
        return Err(Error::NoDevices);
    }
    let n = n_gpus as u128;
    let base = total / n;
    let remainder = total % n;

    let mut offsets = Vec::with_capacity(n_gpus);
    let mut sizes = Vec::with_capacity(n_gpus);
    let mut current = 0u128;
    for i in 0..n {
        let size = base + u128::from(i < remainder);
        offsets.push(current);
        sizes.push(size);
        current += size;
    }
    Ok((offsets, sizes))
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 上报给协调服务的 slot 字段，未设置的字段不序列化
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkSlot {
    pub job_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_pos: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_pos: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_pos: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

/// `GET /api/slot` 的响应
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SlotInfo {
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default, deserialize_with = "de_position")]
    pub checkpoint_pos: Option<u64>,
}

/// 位置可能是整数、浮点数或数字字符串
fn de_position<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let parsed = match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f.round().max(0.0) as u64)),
        Some(serde_json::Value::String(s)) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.round().max(0.0) as u64))
        }
        Some(other) => {
            return Err(serde::de::Error::custom(format!("invalid checkpoint_pos: {}", other)));
        }
    };
    Ok(parsed)
}

/// 协调服务客户端，地址为空时所有调用都是空操作
pub struct SlotClient {
    base_url: String,
    total_slots: u64,
    client: Option<Client>,
}

impl SlotClient {
    pub fn new(base_url: &str, total_slots: u64) -> anyhow::Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        let client = if base_url.is_empty() {
            None
        } else {
            Some(Client::builder().timeout(Duration::from_secs(10)).build()?)
        };
        Ok(Self {
            base_url,
            total_slots,
            client,
        })
    }

    pub fn disabled() -> Self {
        Self {
            base_url: String::new(),
            total_slots: 0,
            client: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// 领取一个 slot，失败返回 None
    pub fn pick_slot(&self) -> Option<SlotInfo> {
        let client = self.client.as_ref()?;
        let url = format!("{}/api/slot", self.base_url);
        let total = self.total_slots.to_string();
        let result = client
            .get(&url)
            .query(&[("total", total.as_str()), ("prefer_active", "1")])
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json::<SlotInfo>());
        match result {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Slot pick failed: {}", e);
                None
            }
        }
    }

    /// 写入 slot 状态，失败返回 None
    pub fn upsert_slot(&self, update: &WorkSlot) -> Option<serde_json::Value> {
        let client = self.client.as_ref()?;
        let url = format!("{}/api/slot/upsert", self.base_url);
        let result = client
            .post(&url)
            .json(update)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json::<serde_json::Value>());
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Slot upsert for job {} failed: {}", update.job_id, e);
                None
            }
        }
    }
}

/// 启动时确定的 slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotClaim {
    pub job_id: i64,
    pub checkpoint_pos: u64,
    pub chunk_size: u64,
    pub strategy: Strategy,
}

/// 根据协调服务的响应决定本次运行的 slot
///
/// - 服务禁用或随机模式: job 0，从头开始
/// - 领取成功: 使用服务给出的 job 与检查点
/// - 领取失败: 随机 job，slot 缩小为 `FALLBACK_CHUNK_SIZE`
/// - job 为负: 没有可用 slot，切换到随机模式
pub fn resolve_claim<R: Rng>(
    enabled: bool,
    picked: Option<SlotInfo>,
    strategy: Strategy,
    chunk_size: u64,
    rng: &mut R,
) -> SlotClaim {
    let mut claim = SlotClaim {
        job_id: 0,
        checkpoint_pos: 0,
        chunk_size,
        strategy,
    };
    if !enabled || strategy == Strategy::Random {
        return claim;
    }
    match picked {
        Some(SlotInfo {
            job_id: Some(job_id),
            checkpoint_pos,
        }) => {
            claim.job_id = job_id;
            claim.checkpoint_pos = checkpoint_pos.unwrap_or(0);
        }
        _ => {
            claim.job_id = rng.gen_range(0..=FALLBACK_MAX_JOB);
            claim.chunk_size = FALLBACK_CHUNK_SIZE;
        }
    }
    if claim.job_id < 0 {
        claim.strategy = Strategy::Random;
    }
    claim
}

/// 本次运行的划分结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub job_id: i64,
    pub strategy: Strategy,
    /// 裁剪后的 slot 大小
    pub chunk_size: u64,
    /// 加到基准熵低位上的 slot 起点 (job × chunk)
    pub slot_base: u64,
    pub checkpoint_pos: u64,
    /// 本次运行需要覆盖的数量
    pub run_total: u128,
    pub offsets: Vec<u128>,
    pub sizes: Vec<u128>,
}

impl RunPlan {
    /// 本次运行已完成的比例 (%)
    pub fn percent_done(&self) -> f64 {
        if self.chunk_size == 0 {
            return 0.0;
        }
        100.0 - (self.run_total as f64 / self.chunk_size as f64) * 100.0
    }
}

/// 计算 slot 裁剪、剩余量与每个 GPU 的区间
///
/// 顺序模式: slot 不超过总空间，剩余 = slot − 检查点，GPU 区间从检查点之后开始；
/// slot 末尾超出 64 位内核计数器时返回 `IndexOverflow`。
/// 随机模式: 覆盖整个空间 (最多 2^64 个索引)，不使用检查点。
pub fn plan_run(space: u128, claim: &SlotClaim, n_gpus: usize) -> Result<RunPlan> {
    if space == 0 {
        return Err(Error::EmptySpace);
    }
    let random = claim.strategy == Strategy::Random;
    let chunk_size = if random {
        claim.chunk_size
    } else {
        (claim.chunk_size as u128).min(space) as u64
    };
    let slot_base = if random {
        0
    } else {
        let base = claim.job_id.max(0) as u128 * chunk_size as u128;
        let end = base + chunk_size as u128;
        if end > KERNEL_INDEX_LIMIT {
            return Err(Error::IndexOverflow(end - 1));
        }
        base as u64
    };
    let (checkpoint_pos, run_total) = if random {
        if space > KERNEL_INDEX_LIMIT {
            warn!(
                "Search space {} exceeds the 64-bit kernel counter, random picks limited to the first 2^64 indices",
                space
            );
        }
        (0, space.min(KERNEL_INDEX_LIMIT))
    } else {
        let cp = claim.checkpoint_pos.min(chunk_size);
        (cp, (chunk_size - cp) as u128)
    };
    let (mut offsets, sizes) = partition(run_total, n_gpus)?;
    for offset in offsets.iter_mut() {
        *offset += checkpoint_pos as u128;
    }
    Ok(RunPlan {
        job_id: claim.job_id,
        strategy: claim.strategy,
        chunk_size,
        slot_base,
        checkpoint_pos,
        run_total,
        offsets,
        sizes,
    })
}

/// 各设备区间按顺序首尾相接，只有从头开始连续完成的部分才算检查点
///
/// 某个设备未完成时，其后设备的进度不计入 (恢复时会重扫)。
pub fn completed_prefix(sizes: &[u128], done: &[u128]) -> u128 {
    let mut prefix = 0u128;
    for (&size, &finished) in sizes.iter().zip(done) {
        let finished = finished.min(size);
        prefix += finished;
        if finished < size {
            break;
        }
    }
    prefix
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SlotState {
    job_id: i64,
    /// 本次运行开始时的检查点
    base: u64,
    checkpoint_pos: u64,
    /// 每个设备的区间大小
    sizes: Vec<u128>,
    /// 每个设备从区间起点起已完成的数量
    done: Vec<u128>,
}

/// 进程内共享的协调状态，通过 `Arc` 传给每个设备线程
pub struct Coordinator {
    slots: SlotClient,
    state: Mutex<SlotState>,
    rates: Mutex<HashMap<String, f64>>,
}

impl Coordinator {
    /// `sizes` 为各设备区间大小，顺序与 `RunPlan::sizes` 一致
    pub fn new(slots: SlotClient, job_id: i64, checkpoint_pos: u64, sizes: Vec<u128>) -> Self {
        let done = vec![0; sizes.len()];
        Self {
            slots,
            state: Mutex::new(SlotState {
                job_id,
                base: checkpoint_pos,
                checkpoint_pos,
                sizes,
                done,
            }),
            rates: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_plan(slots: SlotClient, plan: &RunPlan) -> Self {
        Self::new(slots, plan.job_id, plan.checkpoint_pos, plan.sizes.clone())
    }

    /// 启动时领取 slot，领取成功后立即标记为 running
    pub fn claim(slots: &SlotClient, strategy: Strategy, chunk_size: u64) -> SlotClaim {
        let picked = if slots.is_enabled() && strategy == Strategy::Sequential {
            slots.pick_slot()
        } else {
            None
        };
        let from_service = picked.as_ref().is_some_and(|p| p.job_id.is_some());
        let claim = resolve_claim(slots.is_enabled(), picked, strategy, chunk_size, &mut rand::thread_rng());

        if slots.is_enabled() && strategy == Strategy::Sequential {
            info!("Stride ID: chunk {}", claim.job_id);
            info!("Checkpoint position: {}", claim.checkpoint_pos);
        }
        if from_service && claim.job_id >= 0 {
            let start = claim.job_id as u64 * claim.chunk_size;
            slots.upsert_slot(&WorkSlot {
                job_id: claim.job_id,
                start_pos: Some(start),
                end_pos: Some(start + claim.chunk_size),
                chunk_size: Some(claim.chunk_size),
                checkpoint_pos: Some(claim.checkpoint_pos),
                state: Some(String::from("running")),
                updated_at: Some(unix_now()),
            });
        }
        if !slots.is_enabled() {
            warn!("SLOT_API_URL is not set, checkpoints and reports are disabled");
        }
        if claim.job_id < 0 {
            warn!("No slot available, switching to random mode");
        }
        claim
    }

    pub fn job_id(&self) -> i64 {
        self.state.lock().job_id
    }

    pub fn checkpoint_pos(&self) -> u64 {
        self.state.lock().checkpoint_pos
    }

    /// 记录设备 `device` 已完成 `done` 个索引，上报连续完成前缀，返回新的检查点
    pub fn checkpoint(&self, device: usize, done: u128) -> u64 {
        let mut state = self.state.lock();
        if let Some(slot) = state.done.get_mut(device) {
            *slot = (*slot).max(done);
        }
        let prefix = completed_prefix(&state.sizes, &state.done);
        let pos = state
            .base
            .saturating_add(u64::try_from(prefix).unwrap_or(u64::MAX));
        state.checkpoint_pos = state.checkpoint_pos.max(pos);
        self.slots.upsert_slot(&WorkSlot {
            job_id: state.job_id,
            checkpoint_pos: Some(state.checkpoint_pos),
            state: Some(String::from("running")),
            updated_at: Some(unix_now()),
            ..WorkSlot::default()
        });
        state.checkpoint_pos
    }

    /// 设备覆盖自己的算力条目
    pub fn set_rate(&self, device_id: &str, rate: f64) {
        self.rates.lock().insert(device_id.to_string(), rate);
    }

    /// 取出并清空算力表
    pub fn take_rates(&self) -> HashMap<String, f64> {
        std::mem::take(&mut *self.rates.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_partition_remainder_first() {
        let (offsets, sizes) = partition(101, 4).unwrap();
        assert_eq!(sizes, vec![26, 25, 25, 25]);
        assert_eq!(offsets, vec![0, 26, 51, 76]);
    }

    #[test]
    fn test_partition_zero_gpus() {
        assert!(matches!(partition(10, 0), Err(Error::NoDevices)));
    }

    #[test]
    fn test_total_space_caps_last_position() {
        let mut lens = [1u32; WORD_COUNT];
        lens[10] = 2048;
        lens[11] = 2048;
        assert_eq!(compute_total_space(&lens, SeedMode::Bip39).unwrap(), 2048 * 128);
        assert_eq!(compute_total_space(&lens, SeedMode::Electrum).unwrap(), 2048 * 2048);
    }

    #[test]
    fn test_total_space_overflow_rejected() {
        let lens = [2048u32; WORD_COUNT];
        assert!(matches!(compute_total_space(&lens, SeedMode::Bip39), Err(Error::SpaceTooLarge)));
        assert!(matches!(compute_total_space(&lens, SeedMode::Electrum), Err(Error::SpaceTooLarge)));

        let mut lens = lens;
        lens[0] = 1;
        // 2048^10 × 128 = 2^117
        assert_eq!(compute_total_space(&lens, SeedMode::Bip39).unwrap(), 1u128 << 117);
    }

    #[test]
    fn test_completed_prefix_stops_at_first_gap() {
        let sizes = [25u128, 25, 25, 25];
        assert_eq!(completed_prefix(&sizes, &[10, 10, 10, 10]), 10);
        assert_eq!(completed_prefix(&sizes, &[25, 5, 25, 0]), 30);
        assert_eq!(completed_prefix(&sizes, &[40, 25, 25, 25]), 100);
        assert_eq!(completed_prefix(&sizes, &[0, 25, 25, 25]), 0);
    }

    #[test]
    fn test_slot_info_checkpoint_forms() {
        let a: SlotInfo = serde_json::from_str(r#"{"job_id": 7, "checkpoint_pos": 1200}"#).unwrap();
        let b: SlotInfo = serde_json::from_str(r#"{"job_id": 7, "checkpoint_pos": "1200"}"#).unwrap();
        let c: SlotInfo = serde_json::from_str(r#"{"job_id": 7, "checkpoint_pos": 1199.6}"#).unwrap();
        let d: SlotInfo = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(a.checkpoint_pos, Some(1200));
        assert_eq!(b, a);
        assert_eq!(c, a);
        assert_eq!(d, SlotInfo::default());
    }

    #[test]
    fn test_work_slot_omits_unset_fields() {
        let slot = WorkSlot {
            job_id: 3,
            checkpoint_pos: Some(10),
            ..WorkSlot::default()
        };
        assert_eq!(
            serde_json::to_string(&slot).unwrap(),
            r#"{"job_id":3,"checkpoint_pos":10}"#
        );
    }

    #[test]
    fn test_resolve_claim() {
        let mut rng = StdRng::seed_from_u64(1);

        let off = resolve_claim(false, None, Strategy::Sequential, 500, &mut rng);
        assert_eq!((off.job_id, off.checkpoint_pos, off.chunk_size), (0, 0, 500));

        let picked = SlotInfo {
            job_id: Some(4),
            checkpoint_pos: Some(42),
        };
        let ok = resolve_claim(true, Some(picked), Strategy::Sequential, 500, &mut rng);
        assert_eq!((ok.job_id, ok.checkpoint_pos, ok.chunk_size), (4, 42, 500));

        let failed = resolve_claim(true, None, Strategy::Sequential, 500, &mut rng);
        assert!((0..=FALLBACK_MAX_JOB).contains(&failed.job_id));
        assert_eq!(failed.chunk_size, FALLBACK_CHUNK_SIZE);

        let negative = SlotInfo {
            job_id: Some(-1),
            checkpoint_pos: None,
        };
        let exhausted = resolve_claim(true, Some(negative), Strategy::Sequential, 500, &mut rng);
        assert_eq!(exhausted.strategy, Strategy::Random);
    }

    #[test]
    fn test_plan_run_resumes_after_checkpoint() {
        let claim = SlotClaim {
            job_id: 2,
            checkpoint_pos: 20,
            chunk_size: 1_000,
            strategy: Strategy::Sequential,
        };
        // 空间小于 slot 时 slot 被裁剪
        let plan = plan_run(121, &claim, 4).unwrap();
        assert_eq!(plan.chunk_size, 121);
        assert_eq!(plan.run_total, 101);
        assert_eq!(plan.offsets, vec![20, 46, 71, 96]);
        assert_eq!(plan.sizes, vec![26, 25, 25, 25]);
        assert_eq!(plan.slot_base, 242);
    }

    #[test]
    fn test_plan_run_rejects_slot_beyond_kernel_counter() {
        let claim = SlotClaim {
            job_id: 2,
            checkpoint_pos: 0,
            chunk_size: 1 << 63,
            strategy: Strategy::Sequential,
        };
        // slot 2 结束于 3 × 2^63 > 2^64
        assert!(matches!(
            plan_run(1 << 70, &claim, 2),
            Err(Error::IndexOverflow(_))
        ));

        let last_fitting = SlotClaim { job_id: 1, ..claim };
        let plan = plan_run(1 << 70, &last_fitting, 2).unwrap();
        assert_eq!(plan.slot_base, 1 << 63);
    }

    #[test]
    fn test_plan_run_random_limited_to_kernel_counter() {
        let claim = SlotClaim {
            job_id: 0,
            checkpoint_pos: 0,
            chunk_size: 10,
            strategy: Strategy::Random,
        };
        let plan = plan_run(1 << 80, &claim, 3).unwrap();
        assert_eq!(plan.run_total, KERNEL_INDEX_LIMIT);
        assert_eq!(plan.slot_base, 0);
        let end = plan.offsets[2] + plan.sizes[2];
        assert_eq!(end, KERNEL_INDEX_LIMIT);
    }

    #[test]
    fn test_plan_run_random_covers_space() {
        let claim = SlotClaim {
            job_id: 0,
            checkpoint_pos: 99,
            chunk_size: 10,
            strategy: Strategy::Random,
        };
        let plan = plan_run(1 << 40, &claim, 2).unwrap();
        assert_eq!(plan.run_total, 1 << 40);
        assert_eq!(plan.checkpoint_pos, 0);
        assert!(matches!(plan_run(0, &claim, 2), Err(Error::EmptySpace)));
    }

    #[test]
    fn test_coordinator_checkpoint_and_rates() {
        let coord = Coordinator::new(SlotClient::disabled(), 5, 100, vec![50, 50]);
        // 第二个设备的进度在第一个完成前不计入
        assert_eq!(coord.checkpoint(1, 30), 100);
        assert_eq!(coord.checkpoint(0, 20), 120);
        assert_eq!(coord.checkpoint(0, 50), 180);
        // 进度不会倒退
        assert_eq!(coord.checkpoint(0, 10), 180);
        assert_eq!(coord.checkpoint(1, 50), 200);
        assert_eq!(coord.checkpoint_pos(), 200);
        assert_eq!(coord.job_id(), 5);

        coord.set_rate("a", 1.0);
        coord.set_rate("a", 2.0);
        let rates = coord.take_rates();
        assert_eq!(rates.get("a"), Some(&2.0));
        assert!(coord.take_rates().is_empty());
    }
}
