use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{agent::AgentConfig, controller::ControllerConfig, observability::ObservabilityConfig};
use crate::config::validation::ConfigValidator;
use crate::SchedulerResult;

/// 环境变量前缀，例如 `EVALFLOW__AGENT__SERIAL_NUMBER=agent-7`
pub const ENV_PREFIX: &str = "EVALFLOW";

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/evalflow.toml",
    "evalflow.toml",
    "/etc/evalflow/config.toml",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    pub agent: AgentConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> SchedulerResult<()> {
        if self.controller.enabled {
            self.controller.validate()?;
        }
        if self.agent.enabled {
            self.agent.validate()?;
        }
        self.observability.validate()?;
        Ok(())
    }
}
