pub mod agent;
pub mod app_config;
pub mod controller;
pub mod observability;

pub use agent::{AgentConfig, DeviceInventoryConfig, GpuConfig};
pub use app_config::AppConfig;
pub use controller::{ControllerConfig, ExecutorKind, ResourcePoolConfig, ResourceRuleConfig};
pub use observability::ObservabilityConfig;
