use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::logging::{LogFormat, LogLevel};
use crate::SchedulerResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_bind: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_bind: "0.0.0.0:9090".to_string(),
        }
    }
}

impl ConfigValidator for ObservabilityConfig {
    fn validate(&self) -> SchedulerResult<()> {
        if self.metrics_enabled {
            ValidationUtils::validate_bind_address(&self.metrics_bind, "observability.metrics_bind")?;
        }
        Ok(())
    }
}
