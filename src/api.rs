//! 对外提供的 Rust 调用接口

use anyhow::{Context, bail};
use crossbeam_channel::{bounded, select, tick};
use log::{error, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{BruteTarget, SearchSettings, Strategy};
use crate::coordinator::{Coordinator, RunPlan, SlotClient, plan_run};
use crate::kernel_loader::{BuildOptions, KernelCache};
use crate::mnemonic::{PLACEHOLDER, SeedTemplate, entropy_pair_to_phrase};
use crate::opencl::{OpenCLContext, SearchKernel};
use crate::report::{Reporter, reporter_for};
use crate::search::{
    DeviceLabel, DeviceRange, DeviceSummary, RANDOM_SEEN_BITS, RandomPicker, SearchLoop, SharedInputs,
};

/// 算力上报间隔
pub const RATE_REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub settings: SearchSettings,
    /// `SEED` 为空时用 (H, L) 还原模板
    pub entropy_pair: Option<(u64, u64)>,
    /// 还原的模板末尾替换为通配的单词数
    pub missing_words: Option<usize>,
}

impl SearchRequest {
    pub fn new(settings: SearchSettings) -> Self {
        Self {
            settings,
            entropy_pair: None,
            missing_words: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub plan: RunPlan,
    pub completed_devices: usize,
    pub failed_devices: usize,
    pub total_scanned: u128,
    pub elapsed: Duration,
}

/// 确定模板文本: 优先 `SEED`，否则由 (H, L) 还原并把末尾若干词替换为 `?`
pub fn resolve_template(seed: &str, entropy_pair: Option<(u64, u64)>, missing_words: Option<usize>) -> anyhow::Result<String> {
    if !seed.trim().is_empty() {
        return Ok(seed.trim().to_string());
    }
    let Some((high, low)) = entropy_pair else {
        bail!("SEED is empty and no H/L entropy pair was given");
    };
    let phrase = entropy_pair_to_phrase(high, low);
    let Some(n) = missing_words.filter(|&n| n > 0) else {
        return Ok(phrase);
    };
    let mut words: Vec<String> = phrase.split_whitespace().map(String::from).collect();
    let keep = words.len().saturating_sub(n);
    for w in words.iter_mut().skip(keep) {
        *w = PLACEHOLDER.to_string();
    }
    Ok(words.join(" "))
}

fn mode_label(settings: &SearchSettings, strategy: Strategy, combinational: bool) -> &'static str {
    if settings.brute_target == BruteTarget::Password {
        "Wordlist"
    } else if strategy == Strategy::Random {
        "Random"
    } else if combinational {
        "Combinational"
    } else {
        "Sequential"
    }
}

/// 运行整个搜索: 领取 slot，准备共享输入，每个 GPU 一个线程
pub fn search(request: SearchRequest) -> anyhow::Result<SearchResponse> {
    let settings = &request.settings;
    if settings.batch_width == 0 {
        bail!("GPU_THREADS must be at least 64");
    }

    let slots = SlotClient::new(&settings.slot_api_url, settings.total_slots)?;
    let claim = Coordinator::claim(&slots, settings.strategy, settings.chunk_size);

    let template_text = resolve_template(&settings.seed, request.entropy_pair, request.missing_words)?;
    let template = SeedTemplate::parse(&template_text).context("invalid seed template")?;
    let inputs = Arc::new(SharedInputs::build(settings, template)?);

    let contexts = OpenCLContext::all_gpu_contexts()?;
    if contexts.is_empty() {
        bail!("no usable GPU context");
    }
    let plan = plan_run(inputs.search_space, &claim, contexts.len())?;

    info!("Loaded → {} possible combinations", inputs.search_space);
    info!("Percentage: {:.2}% (this run stride)", plan.percent_done());
    info!(
        "Random: {} | GPUs: {} | Space: {} | Combinational: {} | Missing: {} words | Electrum: {}",
        plan.strategy == Strategy::Random,
        contexts.len(),
        inputs.search_space,
        inputs.combinational,
        inputs.missing_count,
        settings.seed_mode.is_electrum()
    );
    info!(
        "Mode: {} | Build: {}",
        mode_label(settings, plan.strategy, inputs.combinational),
        settings.seed_mode.label()
    );
    if inputs.combinational && inputs.missing_count > 3 {
        info!("Tip: sequential search without middle wildcards is much faster!");
    }

    let cache = KernelCache::new(&settings.kernel_dir, &settings.env_file, &settings.password)?;
    let options = BuildOptions {
        wnaf_window: settings.wnaf_window,
        seed_mode: settings.seed_mode,
        combinational: inputs.combinational,
        brute_target: settings.brute_target,
        cache_bust: settings.cache_bust,
    };
    let reporter: Arc<dyn Reporter> = Arc::from(reporter_for(&settings.slot_api_url)?);
    let coordinator = Arc::new(Coordinator::for_plan(slots, &plan));
    let picker = match plan.strategy {
        Strategy::Random => Some(Arc::new(RandomPicker::new(RANDOM_SEEN_BITS)?)),
        Strategy::Sequential => None,
    };

    let start = Instant::now();
    let outcomes: Vec<(String, anyhow::Result<DeviceSummary>)> = thread::scope(|s| {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        {
            let coordinator = Arc::clone(&coordinator);
            let reporter = Arc::clone(&reporter);
            s.spawn(move || report_rates(coordinator.as_ref(), reporter.as_ref(), stop_rx));
        }

        let handles: Vec<_> = contexts
            .into_iter()
            .enumerate()
            .map(|(i, ctx)| {
                let range = DeviceRange {
                    slot: i,
                    offset: plan.offsets[i],
                    size: plan.sizes[i],
                };
                let tag = format!("GPU#{} {}", ctx.index, ctx.device_name());
                let device = DeviceWork {
                    settings,
                    cache: &cache,
                    options: &options,
                    inputs: Arc::clone(&inputs),
                    coordinator: Arc::clone(&coordinator),
                    reporter: Arc::clone(&reporter),
                    picker: picker.clone(),
                    range,
                    slot_base: plan.slot_base,
                };
                (tag, s.spawn(move || device.run(ctx)))
            })
            .collect();

        let outcomes = handles
            .into_iter()
            .map(|(tag, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("device thread panicked")));
                (tag, result)
            })
            .collect();
        drop(stop_tx);
        outcomes
    });

    let mut response = SearchResponse {
        plan,
        completed_devices: 0,
        failed_devices: 0,
        total_scanned: 0,
        elapsed: start.elapsed(),
    };
    for (tag, outcome) in outcomes {
        match outcome {
            Ok(summary) => {
                response.total_scanned += summary.scanned;
                if summary.completed {
                    response.completed_devices += 1;
                }
            }
            Err(e) => {
                error!("Error on {}: {:#}", tag, e);
                response.failed_devices += 1;
            }
        }
    }
    if response.plan.strategy == Strategy::Sequential {
        info!(
            "Job {} checkpoint at {} of {}",
            coordinator.job_id(),
            coordinator.checkpoint_pos(),
            response.plan.chunk_size
        );
    }
    info!("Processing finished.");
    Ok(response)
}

/// 每 5 秒把各设备算力发给上报服务，直到停止信号通道关闭
fn report_rates(coordinator: &Coordinator, reporter: &dyn Reporter, stop: crossbeam_channel::Receiver<()>) {
    let ticker = tick(RATE_REPORT_INTERVAL);
    loop {
        select! {
            recv(ticker) -> _ => {
                let rates = coordinator.take_rates();
                if !rates.is_empty() && !reporter.update_hashrates(&rates) {
                    warn!("Hashrate update failed");
                }
            }
            recv(stop) -> _ => break,
        }
    }
}

/// 单个设备线程需要的全部输入
struct DeviceWork<'a> {
    settings: &'a SearchSettings,
    cache: &'a KernelCache,
    options: &'a BuildOptions,
    inputs: Arc<SharedInputs>,
    coordinator: Arc<Coordinator>,
    reporter: Arc<dyn Reporter>,
    picker: Option<Arc<RandomPicker>>,
    range: DeviceRange,
    slot_base: u64,
}

impl DeviceWork<'_> {
    fn run(self, ctx: OpenCLContext) -> anyhow::Result<DeviceSummary> {
        let identity = ctx.identity();
        info!("Starting GPU {}: {}", identity.vendor, identity.name);
        let label = DeviceLabel {
            tag: identity.tag(),
            id: identity.device_id(&self.settings.instance_id),
        };
        if !self
            .reporter
            .register_device(&label.id, &identity.name, &identity.vendor, &identity.driver_version)
        {
            warn!("{} registration failed", label.tag);
        }

        let program = self.cache.build_or_load(&ctx, self.options)?;
        let kernel = SearchKernel::new(
            &ctx,
            program,
            &self.inputs.kernel_inputs(),
            self.settings.batch_width,
            self.settings.work_group_size,
            self.settings.max_hits,
        )?;
        info!("GPU {} → Kernel compiled successfully!", ctx.index);

        let search = SearchLoop::new(
            &ctx,
            label,
            kernel,
            self.inputs,
            self.coordinator,
            self.reporter,
            self.picker,
            self.range,
            self.slot_base,
        );
        search.run()
    }
}
