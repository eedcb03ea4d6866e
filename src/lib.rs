//! GPU 助记词恢复系统 - Rust + OpenCL 实现
//!
//! 在带通配位置的 12 词助记词模板所限定的空间内，用 OpenCL 在 GPU 上
//! 批量派生 P2WPKH 地址，并与已知目标地址集合比对。
//! 搜索空间通过协调服务在多进程、多 GPU 之间划分并定期写检查点。

pub mod api;
pub mod bloom;
pub mod config;
pub mod coordinator;
pub mod ec_table;
pub mod error;
pub mod kernel_loader;
pub mod mnemonic;
pub mod opencl;
pub mod report;
pub mod search;
pub mod targets;
pub mod verify;

pub use api::{SearchRequest, SearchResponse, resolve_template, search};
pub use bloom::BloomIndex;
pub use config::{BruteTarget, HitRecord, SearchSettings, SeedMode, Strategy, VerifySample};
pub use coordinator::{Coordinator, SlotClient, compute_total_space, partition};
pub use ec_table::{EcTable, build_table};
pub use error::Error;
pub use kernel_loader::{BuildOptions, KernelCache, compute_content_hash};
pub use mnemonic::{SeedTemplate, expand_template};
pub use opencl::{OpenCLContext, SearchKernel};
pub use report::{HttpReporter, LogReporter, Reporter};
pub use targets::{TargetFilter, TargetTagSet, load_targets};
