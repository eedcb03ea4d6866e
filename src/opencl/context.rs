//! OpenCL 上下文管理

use log::{info, warn};
use ocl::enums::DeviceInfo;
use ocl::{Context, Device, Platform, Queue};

/// 单个 GPU 的 OpenCL 上下文
pub struct OpenCLContext {
    /// 设备序号 (在所有 GPU 中的位置)
    pub index: usize,
    /// 选择的平台
    pub platform: Platform,
    /// 设备 (GPU)
    pub device: Device,
    /// OpenCL 上下文
    pub context: Context,
    /// 命令队列
    pub queue: Queue,
}

/// 设备信息 (上报注册用)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub index: usize,
    pub name: String,
    pub vendor: String,
    pub vendor_id: String,
    pub driver_version: String,
}

impl DeviceIdentity {
    /// 日志中使用的设备标签
    pub fn tag(&self) -> String {
        format!("GPU#{} {}", self.index, self.name)
    }

    /// 稳定的设备 ID: 实例标识 + 序号 + 名称 + 厂商 + 厂商 ID + 驱动版本
    pub fn device_id(&self, instance_id: &str) -> String {
        format!(
            "{}{}{}{}{}{}",
            instance_id, self.index, self.name, self.vendor, self.vendor_id, self.driver_version
        )
    }
}

/// 查询设备类型 (优先使用 API 查询，回退到名称判断)
fn is_gpu(device: &Device) -> bool {
    let device_type = device
        .info(DeviceInfo::Type)
        .ok()
        .map(|t| t.to_string().to_uppercase());
    if let Some(t) = device_type {
        if t.contains("GPU") {
            return true;
        }
        if t.contains("CPU") || t.contains("ACCELERATOR") {
            return false;
        }
    }
    let name_lower = device.name().unwrap_or_default().to_lowercase();
    name_lower.contains("gpu")
        || name_lower.contains("graphics")
        || name_lower.contains("nvidia")
        || name_lower.contains("amd")
        || name_lower.contains("radeon")
}

impl OpenCLContext {
    fn with_device(index: usize, platform: Platform, device: Device) -> anyhow::Result<Self> {
        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()?;
        let queue = Queue::new(&context, device, None)?;
        Ok(Self {
            index,
            platform,
            device,
            context,
            queue,
        })
    }

    /// 第一个平台上的所有 GPU，每个 GPU 一个独立上下文
    pub fn all_gpu_contexts() -> anyhow::Result<Vec<Self>> {
        // Platform::list() 在没有平台时会 panic，这里直接走 core 接口
        let platforms: Vec<Platform> = ocl::core::get_platform_ids()
            .map_err(|e| anyhow::anyhow!("No OpenCL platforms found: {}", e))?
            .into_iter()
            .map(Platform::new)
            .collect();
        let Some(platform) = platforms.first().copied() else {
            anyhow::bail!("No OpenCL platforms found");
        };
        info!("Found {} OpenCL platform(s), using {:?}", platforms.len(), platform.name());

        let devices: Vec<Device> = Device::list_all(platform)?
            .into_iter()
            .filter(is_gpu)
            .collect();
        if devices.is_empty() {
            anyhow::bail!("No OpenCL device found.");
        }

        let mut contexts = Vec::with_capacity(devices.len());
        for (index, device) in devices.into_iter().enumerate() {
            match Self::with_device(index, platform, device) {
                Ok(ctx) => {
                    info!("  GPU#{}: {}", index, ctx.device_name());
                    contexts.push(ctx);
                }
                Err(e) => warn!("  GPU#{}: context creation failed: {}", index, e),
            }
        }
        Ok(contexts)
    }

    pub fn device_name(&self) -> String {
        self.device
            .name()
            .map(|n| n.trim().to_string())
            .unwrap_or_else(|_| String::from("<unknown>"))
    }

    /// 获取设备信息
    pub fn identity(&self) -> DeviceIdentity {
        let info = |kind: DeviceInfo| {
            self.device
                .info(kind)
                .map(|r| r.to_string().trim().to_string())
                .unwrap_or_else(|_| String::from("Unknown"))
        };
        DeviceIdentity {
            index: self.index,
            name: self.device_name(),
            vendor: self
                .device
                .vendor()
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|_| String::from("Unknown")),
            vendor_id: info(DeviceInfo::VendorId),
            driver_version: info(DeviceInfo::DriverVersion),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_identity() {
        let id = DeviceIdentity {
            index: 1,
            name: String::from("RTX"),
            vendor: String::from("NVIDIA"),
            vendor_id: String::from("4318"),
            driver_version: String::from("550.1"),
        };
        assert_eq!(id.tag(), "GPU#1 RTX");
        assert_eq!(id.device_id("c42"), "c421RTXNVIDIA4318550.1");
    }

    #[test]
    fn test_context_creation() {
        // 没有 OpenCL 运行时的机器上只打印提示
        match OpenCLContext::all_gpu_contexts() {
            Ok(contexts) => {
                for ctx in &contexts {
                    assert!(!ctx.device_name().is_empty());
                }
            }
            Err(e) => println!("警告: 未检测到 OpenCL 设备 ({})", e),
        }
    }
}
