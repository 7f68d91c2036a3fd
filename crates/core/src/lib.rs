pub mod config;
pub mod errors;
pub mod logging;

pub use config::{
    AgentConfig, AppConfig, ConfigValidator, ControllerConfig, DeviceInventoryConfig,
    ExecutorKind, GpuConfig, ObservabilityConfig, ResourcePoolConfig, ResourceRuleConfig,
};
pub use errors::*;
pub use logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
