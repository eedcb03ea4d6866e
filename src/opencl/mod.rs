//! OpenCL GPU 计算模块

pub mod context;
pub mod kernel;

pub use context::{DeviceIdentity, OpenCLContext};
pub use kernel::{DispatchOutput, KernelArg, KernelInputs, SearchKernel};
