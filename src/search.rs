//! 单个 GPU 的搜索循环
//!
//! 状态机: Dispatching → AwaitingDevice → Draining → (Dispatching | Completed)。
//! 内核输出交给固定数量的校验线程 (有界队列)，主机重新派生样本地址，
//! 不一致即视为该设备故障并停止循环。命中交给单独的上报线程，
//! 上报重试不会占用校验线程。

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{error, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::bloom::{BloomIndex, mix64};
use crate::config::{BruteTarget, SearchSettings, SeedMode, Strategy};
use crate::coordinator::{Coordinator, compute_total_space};
use crate::ec_table::{EcTable, build_table};
use crate::mnemonic::{CandidateSpace, SeedTemplate, expand_template, indices_to_phrase};
use crate::opencl::{DispatchOutput, KernelInputs, OpenCLContext, SearchKernel};
use crate::report::Reporter;
use crate::targets::{TargetFilter, TargetTagSet, load_targets};
use crate::verify::check_sample;

/// 每个设备的校验线程数
pub const VERIFY_WORKERS: usize = 2;
/// 等待校验的 dispatch 输出上限
pub const VERIFY_QUEUE_DEPTH: usize = 4;
/// 每多少次校验打印一次成功日志
pub const VERIFY_LOG_EVERY: u64 = 100;
/// 随机模式重复检测的位数
pub const RANDOM_SEEN_BITS: u64 = 1 << 27;
/// 随机取样的最大重试次数，超过后接受重复
const RANDOM_MAX_TRIES: usize = 64;

const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);
const FIRST_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(20);

/// 所有设备线程共享的只读输入
pub struct SharedInputs {
    pub template: SeedTemplate,
    /// 密码模式下不上传
    pub space: Option<CandidateSpace>,
    pub combinational: bool,
    pub missing_count: usize,
    /// 考虑校验和上限后的搜索空间
    pub search_space: u128,
    pub high: u64,
    pub low: u64,
    pub ec_table: EcTable,
    pub targets: TargetTagSet,
    pub bloom: BloomIndex,
    pub seed_mode: SeedMode,
    pub password: String,
    pub max_hits: usize,
}

impl SharedInputs {
    /// 展开模板、构建点表、加载目标并构建布隆过滤器
    pub fn build(settings: &SearchSettings, template: SeedTemplate) -> anyhow::Result<Self> {
        let (space, combinational) = expand_template(&template)?;
        let (missing_count, _) = template.count_placeholders();
        let search_space = compute_total_space(&space.lens, settings.seed_mode)?;
        let (high, low) = template.baseline_entropy_pair()?;

        let ec_table = build_table(settings.wnaf_window)?;
        let (targets, _) = load_targets(&settings.targets_path, &TargetFilter::default())?;
        let bloom = BloomIndex::build(&targets.tags, settings.bloom_bits, crate::bloom::DEFAULT_K)?;
        info!(
            "Bloom filter: {} bits, {} tags, fill {:.4}%",
            bloom.nbits(),
            targets.len(),
            bloom.fill_ratio() * 100.0
        );

        let space = match settings.brute_target {
            BruteTarget::Seed => Some(space),
            BruteTarget::Password => None,
        };
        Ok(Self {
            template,
            space,
            combinational,
            missing_count,
            search_space,
            high,
            low,
            ec_table,
            targets,
            bloom,
            seed_mode: settings.seed_mode,
            password: settings.password.clone(),
            max_hits: settings.max_hits,
        })
    }

    pub fn kernel_inputs(&self) -> KernelInputs<'_> {
        KernelInputs {
            ec_table: &self.ec_table.words,
            candidates: self.space.as_ref().map(|s| s.words.as_slice()),
            lens: self.space.as_ref().map(|s| s.lens.as_slice()),
            targets: &self.targets.tags,
            bloom: &self.bloom,
            high: self.high,
        }
    }
}

/// 随机模式的索引选择器，已尝试的索引记录在共享布隆过滤器中
pub struct RandomPicker {
    seen: Mutex<BloomIndex>,
}

fn index_key(index: u128) -> u64 {
    mix64(index as u64) ^ ((index >> 64) as u64)
}

impl RandomPicker {
    pub fn new(nbits: u64) -> anyhow::Result<Self> {
        Ok(Self {
            seen: Mutex::new(BloomIndex::build(&[], nbits, crate::bloom::DEFAULT_K)?),
        })
    }

    /// 在 `[start, end]` 中均匀取一个未尝试过的索引 (尽力而为)
    pub fn pick<R: Rng>(&self, start: u128, end: u128, rng: &mut R) -> u128 {
        let mut seen = self.seen.lock();
        let mut candidate = rng.gen_range(start..=end);
        for _ in 0..RANDOM_MAX_TRIES {
            if !seen.contains(index_key(candidate)) {
                break;
            }
            candidate = rng.gen_range(start..=end);
        }
        seen.insert(index_key(candidate));
        candidate
    }
}

/// 顺序游标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequentialCursor {
    pub next: u128,
    /// 最后一个索引 (含)
    pub last: u128,
}

impl SequentialCursor {
    /// 区间为空时返回 None
    pub fn new(offset: u128, size: u128) -> Option<Self> {
        if size == 0 {
            return None;
        }
        Some(Self {
            next: offset,
            last: offset + size - 1,
        })
    }

    /// 前进一个批次，越过区间末尾时返回 false
    pub fn advance(&mut self, width: u128) -> bool {
        self.next += width;
        self.next <= self.last
    }
}

/// 检查点节奏: 第一次 20 秒，之后每 60 秒
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    last: Instant,
    first_done: bool,
}

impl Cadence {
    pub fn new(now: Instant) -> Self {
        Self {
            last: now,
            first_done: false,
        }
    }

    pub fn due(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last);
        let interval = if self.first_done {
            CHECKPOINT_INTERVAL
        } else {
            FIRST_CHECKPOINT_INTERVAL
        };
        if elapsed > interval {
            self.last = now;
            self.first_done = true;
            true
        } else {
            false
        }
    }
}

/// 内核 `low` 参数，索引超出 64 位时报错而不是截断
pub fn kernel_low(base_low: u64, slot_base: u64, index: u128) -> crate::error::Result<u64> {
    let index = u64::try_from(index).map_err(|_| crate::error::Error::IndexOverflow(index))?;
    Ok(base_low.wrapping_add(slot_base).wrapping_add(index))
}

/// 搜索循环状态
enum SearchState {
    Dispatching,
    AwaitingDevice { index: u128 },
    Draining { output: DispatchOutput },
    Completed,
}

/// 设备标识
#[derive(Debug, Clone)]
pub struct DeviceLabel {
    /// 日志用标签 `GPU#i name`
    pub tag: String,
    /// 上报用设备 ID
    pub id: String,
}

/// 分配给单个设备的区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRange {
    /// 在 `RunPlan` 中的序号，用于检查点
    pub slot: usize,
    pub offset: u128,
    pub size: u128,
}

/// 设备运行结束时的统计
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceSummary {
    pub scanned: u128,
    pub dispatches: u64,
    pub completed: bool,
}

/// 等待上报的命中
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundHit {
    pub tag: u64,
    pub mnemonic: String,
}

/// 逐条上报命中直到通道关闭，失败只记录日志
pub fn forward_hits(rx: Receiver<FoundHit>, reporter: &dyn Reporter, device: &DeviceLabel) {
    for hit in rx.iter() {
        if !reporter.report_hit(&device.id, hit.tag, &hit.mnemonic) {
            error!("Failed to report hit {:#x} from {}", hit.tag, device.tag);
        }
    }
}

struct Verifier<'a> {
    device: &'a DeviceLabel,
    inputs: &'a SharedInputs,
    verified: &'a AtomicU64,
}

impl Verifier<'_> {
    fn verify(&self, output: DispatchOutput, hits: &Sender<FoundHit>) -> anyhow::Result<()> {
        let count = output.read_count()?;
        let sample = output.read_sample()?;
        let address = check_sample(&sample, &self.inputs.password, self.inputs.seed_mode, &self.device.tag)?;
        if self.verified.fetch_add(1, Ordering::Relaxed) % VERIFY_LOG_EVERY == 0 {
            let mnemonic = sample.mnemonic();
            let first = mnemonic.split_whitespace().next().unwrap_or_default();
            info!(
                "Address match OK: {}. First word: {} | {}",
                address, first, self.device.tag
            );
        }

        for mut hit in output.read_hits(count)? {
            if !self.inputs.targets.contains(hit.tag64) {
                warn!("{} returned tag {:#x} outside the target set, skipped", self.device.tag, hit.tag64);
                hit.wipe();
                continue;
            }
            let full = indices_to_phrase(&hit.widx);
            let display = self.inputs.template.redact(&hit.widx);
            info!("Found! → {} ({})", display, self.device.tag);
            hit.wipe();
            if hits
                .send(FoundHit {
                    tag: hit.tag64,
                    mnemonic: full,
                })
                .is_err()
            {
                error!("Hit reporter for {} is gone, hit {:#x} dropped", self.device.tag, hit.tag64);
            }
        }
        Ok(())
    }

    fn run(&self, rx: Receiver<DispatchOutput>, hits: Sender<FoundHit>, fault: &Mutex<Option<anyhow::Error>>) {
        for output in rx.iter() {
            if let Err(e) = self.verify(output, &hits) {
                error!("{} verification failed: {:#}", self.device.tag, e);
                fault.lock().get_or_insert(e);
                break;
            }
        }
    }
}

/// 单个 GPU 的搜索循环
pub struct SearchLoop {
    pub device: DeviceLabel,
    kernel: SearchKernel,
    inputs: Arc<SharedInputs>,
    coordinator: Arc<Coordinator>,
    reporter: Arc<dyn Reporter>,
    picker: Option<Arc<RandomPicker>>,
    range: DeviceRange,
    /// slot 起点，加到基准熵低位
    slot_base: u64,
    verified: AtomicU64,
}

impl SearchLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &OpenCLContext,
        device: DeviceLabel,
        kernel: SearchKernel,
        inputs: Arc<SharedInputs>,
        coordinator: Arc<Coordinator>,
        reporter: Arc<dyn Reporter>,
        picker: Option<Arc<RandomPicker>>,
        range: DeviceRange,
        slot_base: u64,
    ) -> Self {
        info!(
            "GPU {}# {} → Range [{} to {}] = {} combinations",
            ctx.index,
            ctx.device_name(),
            range.offset,
            (range.offset + range.size).saturating_sub(1),
            range.size
        );
        Self {
            device,
            kernel,
            inputs,
            coordinator,
            reporter,
            picker,
            range,
            slot_base,
            verified: AtomicU64::new(0),
        }
    }

    fn strategy(&self) -> Strategy {
        if self.picker.is_some() {
            Strategy::Random
        } else {
            Strategy::Sequential
        }
    }

    /// 内核 `low` 参数: 基准熵低位 + slot 起点 + 索引 (64 位回绕)
    fn kernel_low(&self, index: u128) -> crate::error::Result<u64> {
        kernel_low(self.inputs.low, self.slot_base, index)
    }

    /// 运行到区间结束 (随机模式不会结束) 或设备故障
    ///
    /// 返回前等待上报线程发完已找到的命中。
    pub fn run(&self) -> anyhow::Result<DeviceSummary> {
        let (tx, rx) = bounded::<DispatchOutput>(VERIFY_QUEUE_DEPTH);
        let (hit_tx, hit_rx) = unbounded::<FoundHit>();
        let fault: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        let verifier = Verifier {
            device: &self.device,
            inputs: self.inputs.as_ref(),
            verified: &self.verified,
        };

        let result = thread::scope(|s| {
            let verifier = &verifier;
            let fault = &fault;
            let reporter = self.reporter.as_ref();
            let device = &self.device;
            s.spawn(move || forward_hits(hit_rx, reporter, device));
            for _ in 0..VERIFY_WORKERS {
                let rx = rx.clone();
                let hits = hit_tx.clone();
                s.spawn(move || verifier.run(rx, hits, fault));
            }
            drop(rx);
            drop(hit_tx);
            let result = self.drive(&tx, fault);
            drop(tx);
            result
        });

        if let Some(e) = fault.into_inner() {
            return Err(e);
        }
        result
    }

    fn drive(&self, tx: &Sender<DispatchOutput>, fault: &Mutex<Option<anyhow::Error>>) -> anyhow::Result<DeviceSummary> {
        let width = self.kernel.batch_width() as u128;
        let mut summary = DeviceSummary::default();
        let mut cursor = SequentialCursor::new(self.range.offset, self.range.size);
        let strategy = self.strategy();
        if strategy == Strategy::Sequential && cursor.is_none() {
            warn!("{} has an empty range, nothing to do", self.device.tag);
            summary.completed = true;
            return Ok(summary);
        }

        let mut rng = rand::thread_rng();
        let started = Instant::now();
        let mut cadence = Cadence::new(started);
        let mut state = SearchState::Dispatching;

        loop {
            if fault.lock().is_some() {
                break;
            }
            state = match state {
                SearchState::Dispatching => {
                    let index = match (&self.picker, cursor) {
                        (Some(picker), _) => {
                            let last = (self.range.offset + self.range.size).saturating_sub(1);
                            picker.pick(self.range.offset, last.max(self.range.offset), &mut rng)
                        }
                        (None, Some(c)) => c.next,
                        (None, None) => break,
                    };
                    SearchState::AwaitingDevice { index }
                }
                SearchState::AwaitingDevice { index } => {
                    let output = self.kernel.dispatch(self.kernel_low(index)?)?;
                    summary.dispatches += 1;
                    summary.scanned += width;
                    SearchState::Draining { output }
                }
                SearchState::Draining { output } => {
                    if tx.send(output).is_err() {
                        // 所有校验线程都已退出
                        break;
                    }

                    let elapsed = started.elapsed().as_secs_f64();
                    let rate = if elapsed > 0.0 {
                        summary.scanned as f64 / elapsed
                    } else {
                        0.0
                    };
                    self.coordinator.set_rate(&self.device.id, rate);

                    if cadence.due(Instant::now()) {
                        info!(
                            "{} → Current speed: {:.2} seeds/s | Total: {} seeds",
                            self.device.tag, rate, summary.scanned
                        );
                        if strategy == Strategy::Sequential {
                            self.coordinator
                                .checkpoint(self.range.slot, summary.scanned.min(self.range.size));
                        }
                    }

                    match cursor.as_mut() {
                        Some(c) if strategy == Strategy::Sequential => {
                            if c.advance(width) {
                                SearchState::Dispatching
                            } else {
                                SearchState::Completed
                            }
                        }
                        _ => SearchState::Dispatching,
                    }
                }
                SearchState::Completed => {
                    self.coordinator.checkpoint(self.range.slot, self.range.size);
                    info!("{} completed its range ({} processed)", self.device.tag, summary.scanned);
                    summary.completed = true;
                    break;
                }
            };
        }
        Ok(summary)
    }
}
