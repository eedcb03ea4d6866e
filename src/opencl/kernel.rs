//! OpenCL 内核加载与执行

use log::debug;
use ocl::enums::{KernelInfo, KernelInfoResult};
use ocl::{Buffer, Kernel, Program, Queue, SpatialDims};

use super::context::OpenCLContext;
use crate::bloom::BloomIndex;
use crate::config::{HitRecord, VerifySample};

/// 内核入口函数名
pub const KERNEL_NAME: &str = "verify";

/// 内核参数槽位
///
/// 声明顺序即 OpenCL 签名中的参数顺序，构建内核时按 `ORDER` 逐个绑定，
/// 参数个数在加载时与驱动报告的 NumArgs 校验一次。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    /// __global test_t* (校验样本)
    Sample,
    /// ulong low + index
    Low,
    /// ulong high
    High,
    /// __global const ulong* (排序后的目标标签)
    Targets,
    /// uint 目标数量
    TargetCount,
    /// __global const uint* (预计算点表)
    EcTable,
    /// __global const uint* (12 × 2048 候选词)
    Candidates,
    /// __global const uint* (每个位置的候选数)
    Lens,
    /// __global const uchar* (密码字典，未使用时为占位缓冲区)
    Wordlist,
    /// uint
    WordlistSize,
    /// __global hit_t*
    Hits,
    /// __global uint* (命中计数)
    HitCount,
    /// __global const uint* (布隆过滤器)
    Bloom,
    /// uint
    BloomMask,
    /// uint
    BloomWordsMask,
}

impl KernelArg {
    pub const ORDER: [KernelArg; 15] = [
        KernelArg::Sample,
        KernelArg::Low,
        KernelArg::High,
        KernelArg::Targets,
        KernelArg::TargetCount,
        KernelArg::EcTable,
        KernelArg::Candidates,
        KernelArg::Lens,
        KernelArg::Wordlist,
        KernelArg::WordlistSize,
        KernelArg::Hits,
        KernelArg::HitCount,
        KernelArg::Bloom,
        KernelArg::BloomMask,
        KernelArg::BloomWordsMask,
    ];

    pub fn name(self) -> &'static str {
        match self {
            KernelArg::Sample => "sample",
            KernelArg::Low => "low",
            KernelArg::High => "high",
            KernelArg::Targets => "targets",
            KernelArg::TargetCount => "target_count",
            KernelArg::EcTable => "ec_table",
            KernelArg::Candidates => "candidates",
            KernelArg::Lens => "lens",
            KernelArg::Wordlist => "wordlist",
            KernelArg::WordlistSize => "wordlist_size",
            KernelArg::Hits => "hits",
            KernelArg::HitCount => "hit_count",
            KernelArg::Bloom => "bloom",
            KernelArg::BloomMask => "bloom_mask",
            KernelArg::BloomWordsMask => "bloom_words_mask",
        }
    }

    pub fn position(self) -> usize {
        self as usize
    }
}

/// 上传到设备的只读输入 (主机端切片)
pub struct KernelInputs<'a> {
    pub ec_table: &'a [u32],
    /// 密码模式下为 None，绑定占位缓冲区
    pub candidates: Option<&'a [u32]>,
    pub lens: Option<&'a [u32]>,
    pub targets: &'a [u64],
    pub bloom: &'a BloomIndex,
    pub high: u64,
}

/// 单次 dispatch 的输出缓冲区
pub struct DispatchOutput {
    pub sample: Buffer<u8>,
    pub hits: Buffer<u8>,
    pub hit_count: Buffer<u32>,
    pub max_hits: usize,
}

impl DispatchOutput {
    fn new(queue: &Queue, max_hits: usize) -> anyhow::Result<Self> {
        let sample = Buffer::<u8>::builder()
            .queue(queue.clone())
            .flags(ocl::flags::MEM_READ_WRITE)
            .len(VerifySample::SIZE)
            .build()?;
        let hits = Buffer::<u8>::builder()
            .queue(queue.clone())
            .flags(ocl::flags::MEM_READ_WRITE)
            .len(HitRecord::SIZE * max_hits.max(1))
            .build()?;
        let hit_count = Buffer::<u32>::builder()
            .queue(queue.clone())
            .flags(ocl::flags::MEM_READ_WRITE)
            .len(1)
            .copy_host_slice(&[0u32])
            .build()?;
        Ok(Self {
            sample,
            hits,
            hit_count,
            max_hits,
        })
    }

    /// 读取命中计数
    pub fn read_count(&self) -> anyhow::Result<u32> {
        let mut count = vec![0u32; 1];
        self.hit_count.read(&mut count).enq()?;
        Ok(count[0])
    }

    /// 读取校验样本
    pub fn read_sample(&self) -> anyhow::Result<VerifySample> {
        let mut bytes = vec![0u8; VerifySample::SIZE];
        self.sample.read(&mut bytes).enq()?;
        Ok(VerifySample::from_bytes(&bytes))
    }

    /// 读取前 `count` 条命中 (不超过 max_hits)
    pub fn read_hits(&self, count: u32) -> anyhow::Result<Vec<HitRecord>> {
        let n = (count as usize).min(self.max_hits);
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut bytes = vec![0u8; HitRecord::SIZE * n];
        self.hits.read(&mut bytes).enq()?;
        let hits = bytes.chunks_exact(HitRecord::SIZE).map(HitRecord::from_bytes).collect();
        bytes.fill(0);
        Ok(hits)
    }
}

/// 搜索内核封装
pub struct SearchKernel {
    /// OpenCL 程序 (必须保持存活以确保内核正常工作)
    #[allow(dead_code)]
    program: Program,
    kernel: Kernel,
    queue: Queue,
    // 只读输入缓冲区，生命周期与内核一致
    _ec_table: Buffer<u32>,
    _candidates: Buffer<u32>,
    _lens: Buffer<u32>,
    _wordlist: Buffer<u32>,
    _targets: Buffer<u64>,
    _bloom: Buffer<u32>,
    batch_width: usize,
    work_group_size: Option<usize>,
    max_hits: usize,
}

fn read_only<T: ocl::OclPrm>(queue: &Queue, data: &[T]) -> anyhow::Result<Buffer<T>> {
    Ok(Buffer::<T>::builder()
        .queue(queue.clone())
        .flags(ocl::flags::MEM_READ_ONLY)
        .len(data.len())
        .copy_host_slice(data)
        .build()?)
}

impl SearchKernel {
    /// 上传只读输入并按参数描述符构建内核
    pub fn new(
        ctx: &OpenCLContext,
        program: Program,
        inputs: &KernelInputs<'_>,
        batch_width: usize,
        work_group_size: Option<usize>,
        max_hits: usize,
    ) -> anyhow::Result<Self> {
        let queue = ctx.queue.clone();
        // 8 字节占位缓冲区，替代未使用的输入
        let dummy = [0u32; 2];
        let ec_table = read_only(&queue, inputs.ec_table)?;
        let candidates = read_only(&queue, inputs.candidates.unwrap_or(&dummy))?;
        let lens = read_only(&queue, inputs.lens.unwrap_or(&dummy))?;
        let wordlist = read_only(&queue, &dummy)?;
        let targets = if inputs.targets.is_empty() {
            read_only(&queue, &[0u64])?
        } else {
            read_only(&queue, inputs.targets)?
        };
        let bloom = read_only(&queue, &inputs.bloom.bits)?;
        let output = DispatchOutput::new(&queue, max_hits)?;

        let kernel = {
            let mut builder = Kernel::builder();
            builder
                .program(&program)
                .name(KERNEL_NAME)
                .queue(queue.clone())
                .global_work_size(SpatialDims::One(batch_width));
            for slot in KernelArg::ORDER {
                let name = slot.name();
                match slot {
                    KernelArg::Sample => builder.arg_named(name, &output.sample),
                    KernelArg::Low => builder.arg_named(name, 0u64),
                    KernelArg::High => builder.arg_named(name, inputs.high),
                    KernelArg::Targets => builder.arg_named(name, &targets),
                    KernelArg::TargetCount => builder.arg_named(name, inputs.targets.len() as u32),
                    KernelArg::EcTable => builder.arg_named(name, &ec_table),
                    KernelArg::Candidates => builder.arg_named(name, &candidates),
                    KernelArg::Lens => builder.arg_named(name, &lens),
                    KernelArg::Wordlist => builder.arg_named(name, &wordlist),
                    KernelArg::WordlistSize => builder.arg_named(name, 0u32),
                    KernelArg::Hits => builder.arg_named(name, &output.hits),
                    KernelArg::HitCount => builder.arg_named(name, &output.hit_count),
                    KernelArg::Bloom => builder.arg_named(name, &bloom),
                    KernelArg::BloomMask => builder.arg_named(name, inputs.bloom.mask),
                    KernelArg::BloomWordsMask => builder.arg_named(name, inputs.bloom.words_mask),
                };
            }
            builder.build()?
        };

        let num_args = match kernel.info(KernelInfo::NumArgs) {
            Ok(KernelInfoResult::NumArgs(n)) => n as usize,
            _ => KernelArg::ORDER.len(),
        };
        if num_args != KernelArg::ORDER.len() {
            anyhow::bail!(
                "kernel '{}' takes {} arguments, expected {}",
                KERNEL_NAME,
                num_args,
                KernelArg::ORDER.len()
            );
        }
        debug!("Kernel '{}' bound with {} arguments", KERNEL_NAME, num_args);

        Ok(Self {
            program,
            kernel,
            queue,
            _ec_table: ec_table,
            _candidates: candidates,
            _lens: lens,
            _wordlist: wordlist,
            _targets: targets,
            _bloom: bloom,
            batch_width,
            work_group_size,
            max_hits,
        })
    }

    pub fn batch_width(&self) -> usize {
        self.batch_width
    }

    /// 启动内核并阻塞直到设备完成
    ///
    /// 每次 dispatch 分配独立的输出缓冲区，读取可以在后台线程进行。
    pub fn dispatch(&self, low: u64) -> anyhow::Result<DispatchOutput> {
        let output = DispatchOutput::new(&self.queue, self.max_hits)?;
        self.kernel.set_arg(KernelArg::Sample.name(), &output.sample)?;
        self.kernel.set_arg(KernelArg::Low.name(), low)?;
        self.kernel.set_arg(KernelArg::Hits.name(), &output.hits)?;
        self.kernel.set_arg(KernelArg::HitCount.name(), &output.hit_count)?;

        let gws = SpatialDims::One(self.batch_width);
        unsafe {
            match self.work_group_size {
                Some(lws) => self
                    .kernel
                    .cmd()
                    .global_work_size(gws)
                    .local_work_size(SpatialDims::One(lws))
                    .enq()?,
                None => self.kernel.cmd().global_work_size(gws).enq()?,
            }
        }
        self.queue.finish()?;
        Ok(output)
    }
}
