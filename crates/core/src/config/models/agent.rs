use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub gpu_type: String,
    pub driver: String,
}

/// Agent 所在节点的设备清单
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceInventoryConfig {
    pub cpu_slots: usize,
    #[serde(default)]
    pub gpus: Vec<GpuConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub enabled: bool,
    pub serial_number: String,
    pub hostname: String,
    pub ip_address: String,
    pub controller_url: String,
    pub memory_mb: u64,
    pub data_dir: String,
    pub preparing_interval_ms: u64,
    pub monitor_interval_ms: u64,
    pub upload_interval_ms: u64,
    pub report_interval_ms: u64,
    pub devices: DeviceInventoryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            serial_number: "agent-001".to_string(),
            hostname: "localhost".to_string(),
            ip_address: "127.0.0.1".to_string(),
            controller_url: "http://127.0.0.1:8082".to_string(),
            memory_mb: 16_384,
            data_dir: "/tmp/evalflow/agent".to_string(),
            preparing_interval_ms: 1_000,
            monitor_interval_ms: 1_000,
            upload_interval_ms: 1_000,
            report_interval_ms: 5_000,
            devices: DeviceInventoryConfig {
                cpu_slots: 4,
                gpus: Vec::new(),
            },
        }
    }
}

impl ConfigValidator for AgentConfig {
    fn validate(&self) -> SchedulerResult<()> {
        ValidationUtils::validate_not_empty(&self.serial_number, "agent.serial_number")?;
        ValidationUtils::validate_not_empty(&self.hostname, "agent.hostname")?;
        ValidationUtils::validate_not_empty(&self.ip_address, "agent.ip_address")?;
        ValidationUtils::validate_url(&self.controller_url, "agent.controller_url")?;
        ValidationUtils::validate_not_empty(&self.data_dir, "agent.data_dir")?;
        ValidationUtils::validate_interval_ms(self.preparing_interval_ms, "agent.preparing_interval_ms")?;
        ValidationUtils::validate_interval_ms(self.monitor_interval_ms, "agent.monitor_interval_ms")?;
        ValidationUtils::validate_interval_ms(self.upload_interval_ms, "agent.upload_interval_ms")?;
        ValidationUtils::validate_interval_ms(self.report_interval_ms, "agent.report_interval_ms")?;

        let mut ids = std::collections::HashSet::new();
        for gpu in &self.devices.gpus {
            ValidationUtils::validate_not_empty(&gpu.id, "agent.devices.gpus.id")?;
            if !ids.insert(gpu.id.as_str()) {
                return Err(SchedulerError::config_error(format!(
                    "GPU 设备 id {} 重复",
                    gpu.id
                )));
            }
        }
        Ok(())
    }
}
