use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::{SchedulerError, SchedulerResult};

/// 控制器使用的运行执行器类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// 在控制器所在主机上以本地进程运行
    #[default]
    Process,
    /// 通过 Agent 上报通道下发
    Agent,
}

/// 资源规则配置：某类资源的取值范围与默认值
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRuleConfig {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePoolConfig {
    pub name: String,
    #[serde(default)]
    pub resources: Vec<ResourceRuleConfig>,
}

impl ConfigValidator for ResourcePoolConfig {
    fn validate(&self) -> SchedulerResult<()> {
        ValidationUtils::validate_not_empty(&self.name, "controller.resource_pools.name")?;
        let mut seen = std::collections::HashSet::new();
        for rule in &self.resources {
            ValidationUtils::validate_not_empty(
                &rule.resource_type,
                "controller.resource_pools.resources.type",
            )?;
            if !seen.insert(rule.resource_type.as_str()) {
                return Err(SchedulerError::config_error(format!(
                    "资源池 {} 中资源类型 {} 重复定义",
                    self.name, rule.resource_type
                )));
            }
            if rule.min > rule.max || rule.default < rule.min || rule.default > rule.max {
                return Err(SchedulerError::config_error(format!(
                    "资源池 {} 的 {} 规则无效: min={}, max={}, default={}",
                    self.name, rule.resource_type, rule.min, rule.max, rule.default
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub enabled: bool,
    pub bind_address: String,
    #[serde(default)]
    pub executor: ExecutorKind,
    pub log_root: String,
    pub result_root: String,
    pub default_resource_pool: String,
    pub resource_pools: Vec<ResourcePoolConfig>,
    pub max_task_retries: u32,
    pub retry_backoff_seconds: u64,
}

impl ControllerConfig {
    pub fn find_pool(&self, name: &str) -> Option<&ResourcePoolConfig> {
        self.resource_pools.iter().find(|pool| pool.name == name)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8082".to_string(),
            executor: ExecutorKind::Process,
            log_root: "/tmp/evalflow/logs".to_string(),
            result_root: "/tmp/evalflow/results".to_string(),
            default_resource_pool: "default".to_string(),
            resource_pools: vec![ResourcePoolConfig {
                name: "default".to_string(),
                resources: vec![
                    ResourceRuleConfig {
                        resource_type: "cpu".to_string(),
                        min: 0.1,
                        max: 64.0,
                        default: 1.0,
                    },
                    ResourceRuleConfig {
                        resource_type: "memory".to_string(),
                        min: 128.0,
                        max: 262_144.0,
                        default: 2048.0,
                    },
                    ResourceRuleConfig {
                        resource_type: "nvidia.com/gpu".to_string(),
                        min: 0.0,
                        max: 8.0,
                        default: 0.0,
                    },
                ],
            }],
            max_task_retries: 2,
            retry_backoff_seconds: 10,
        }
    }
}

impl ConfigValidator for ControllerConfig {
    fn validate(&self) -> SchedulerResult<()> {
        ValidationUtils::validate_bind_address(&self.bind_address, "controller.bind_address")?;
        ValidationUtils::validate_not_empty(&self.log_root, "controller.log_root")?;
        ValidationUtils::validate_not_empty(&self.result_root, "controller.result_root")?;
        for pool in &self.resource_pools {
            pool.validate()?;
        }
        if self.find_pool(&self.default_resource_pool).is_none() {
            return Err(SchedulerError::config_error(format!(
                "默认资源池 {} 未在 controller.resource_pools 中定义",
                self.default_resource_pool
            )));
        }
        Ok(())
    }
}
