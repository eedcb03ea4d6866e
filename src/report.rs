//! 设备注册、算力与命中上报

use log::{info, warn};
use reqwest::blocking::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::thread::sleep;
use std::time::Duration;

/// 单次重试的最长等待
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// 上报协作方
///
/// 所有方法都不返回错误，失败只记录日志。
pub trait Reporter: Send + Sync {
    fn register_device(&self, device_id: &str, name: &str, vendor: &str, driver_version: &str) -> bool;

    /// `rates` 以设备 ID 为键
    fn update_hashrates(&self, rates: &HashMap<String, f64>) -> bool;

    fn report_hit(&self, device_id: &str, address_tag: u64, mnemonic: &str) -> bool;
}

#[derive(Debug, Serialize)]
struct RegisterPayload<'a> {
    uuid: &'a str,
    name: &'a str,
    vendor: &'a str,
    driver_version: &'a str,
    hash_rate: f64,
}

#[derive(Debug, Serialize, PartialEq)]
struct DeviceRate {
    uuid: String,
    hash_rate: f64,
}

#[derive(Debug, Serialize)]
struct HashratePayload {
    devices: Vec<DeviceRate>,
}

#[derive(Debug, Serialize)]
struct HitPayload<'a> {
    uuid: &'a str,
    address: String,
    mnemonic: &'a str,
}

fn or_unknown(s: &str) -> &str {
    if s.is_empty() { "Unknown" } else { s }
}

/// 第 `attempt` 次失败后的等待时间 (指数退避，有上限)
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(MAX_BACKOFF)
}

/// 只保留正算力的条目，按 ID 排序
fn positive_rates(rates: &HashMap<String, f64>) -> Vec<DeviceRate> {
    let mut devices: Vec<DeviceRate> = rates
        .iter()
        .filter(|(_, rate)| **rate > 0.0)
        .map(|(uuid, rate)| DeviceRate {
            uuid: uuid.clone(),
            hash_rate: *rate,
        })
        .collect();
    devices.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    devices
}

/// POST JSON 到上报服务
pub struct HttpReporter {
    base_url: String,
    client: Client,
}

impl HttpReporter {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(20)).build()?;
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn post<T: Serialize>(&self, endpoint: &str, body: &T, retries: u32, base_delay: Duration) -> bool {
        let url = format!("{}{}", self.base_url, endpoint);
        for attempt in 0..retries {
            let result = self
                .client
                .post(&url)
                .json(body)
                .send()
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => return true,
                Err(e) => {
                    warn!("{} (attempt {}/{}): {}", endpoint, attempt + 1, retries, e);
                    if attempt + 1 < retries {
                        sleep(backoff(base_delay, attempt));
                    }
                }
            }
        }
        false
    }
}

impl Reporter for HttpReporter {
    fn register_device(&self, device_id: &str, name: &str, vendor: &str, driver_version: &str) -> bool {
        let payload = RegisterPayload {
            uuid: device_id,
            name: or_unknown(name),
            vendor: or_unknown(vendor),
            driver_version: or_unknown(driver_version),
            hash_rate: 0.0,
        };
        self.post("/register-device", &payload, 3, Duration::from_secs(5))
    }

    fn update_hashrates(&self, rates: &HashMap<String, f64>) -> bool {
        let devices = positive_rates(rates);
        if devices.is_empty() {
            return true;
        }
        self.post("/update-hashrates", &HashratePayload { devices }, 2, Duration::from_secs(10))
    }

    fn report_hit(&self, device_id: &str, address_tag: u64, mnemonic: &str) -> bool {
        let payload = HitPayload {
            uuid: device_id,
            address: format!("{:#x}", address_tag),
            mnemonic,
        };
        self.post("/report-hit", &payload, 1000, Duration::from_secs(30))
    }
}

/// 未配置上报服务时使用，只写日志
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn register_device(&self, device_id: &str, name: &str, vendor: &str, driver_version: &str) -> bool {
        info!(
            "Device {} registered locally: {} / {} / {}",
            device_id,
            or_unknown(name),
            or_unknown(vendor),
            or_unknown(driver_version)
        );
        true
    }

    fn update_hashrates(&self, rates: &HashMap<String, f64>) -> bool {
        let total: f64 = positive_rates(rates).iter().map(|d| d.hash_rate).sum();
        if total > 0.0 {
            info!("Total speed: {:.2} seeds/s across {} device(s)", total, rates.len());
        }
        true
    }

    fn report_hit(&self, device_id: &str, address_tag: u64, mnemonic: &str) -> bool {
        warn!("HIT on {}: tag {:#x} mnemonic {}", device_id, address_tag, mnemonic);
        true
    }
}

/// 根据是否配置服务地址选择上报实现
pub fn reporter_for(base_url: &str) -> anyhow::Result<Box<dyn Reporter>> {
    if base_url.trim().is_empty() {
        Ok(Box::new(LogReporter))
    } else {
        Ok(Box::new(HttpReporter::new(base_url)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_backoff_caps() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff(base, 0), Duration::from_secs(30));
        assert_eq!(backoff(base, 2), Duration::from_secs(120));
        assert_eq!(backoff(base, 999), MAX_BACKOFF);
    }

    #[test]
    fn test_positive_rates_filters() {
        let mut rates = HashMap::new();
        rates.insert(String::from("b"), 2.0);
        rates.insert(String::from("a"), 1.5);
        rates.insert(String::from("c"), 0.0);
        let devices = positive_rates(&rates);
        assert_eq!(
            devices,
            vec![
                DeviceRate { uuid: String::from("a"), hash_rate: 1.5 },
                DeviceRate { uuid: String::from("b"), hash_rate: 2.0 },
            ]
        );
    }

    #[test]
    fn test_hit_payload_json() {
        let payload = HitPayload {
            uuid: "dev",
            address: format!("{:#x}", 0xabcdu64),
            mnemonic: "zoo",
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["address"], "0xabcd");
        assert_eq!(json["uuid"], "dev");
    }

    #[test]
    fn test_reporter_for_empty_url_logs_only() {
        let reporter = reporter_for("  ").unwrap();
        assert!(reporter.report_hit("dev", 1, "abandon"));
        assert!(reporter.update_hashrates(&HashMap::new()));
    }
}
