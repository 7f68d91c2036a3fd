use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};

use evalflow_agent::AgentService;
use evalflow_api::{serve, AppState};
use evalflow_controller::ControllerServices;
use evalflow_core::AppConfig;
use evalflow_infrastructure::init_metrics;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 控制器与 HTTP 接口
    Controller,
    /// 节点 Agent
    Agent,
    /// 同一进程内运行控制器和 Agent
    All,
}

impl AppMode {
    pub fn parse(mode: &str, config: &AppConfig) -> Result<Self> {
        let mode = match mode {
            "controller" => AppMode::Controller,
            "agent" => AppMode::Agent,
            "all" => AppMode::All,
            _ => return Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
        };
        if matches!(mode, AppMode::Controller | AppMode::All) && !config.controller.enabled {
            return Err(anyhow::anyhow!("控制器被禁用，请检查配置"));
        }
        if matches!(mode, AppMode::Agent | AppMode::All) && !config.agent.enabled {
            return Err(anyhow::anyhow!("Agent 被禁用，请检查配置"));
        }
        Ok(mode)
    }
}

pub struct Application {
    config: AppConfig,
    mode: AppMode,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Self {
        Self { config, mode }
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);
        if self.config.observability.metrics_enabled {
            init_metrics(&self.config.observability.metrics_bind)?;
        }

        match self.mode {
            AppMode::Controller => self.run_controller(shutdown_rx).await,
            AppMode::Agent => self.run_agent(shutdown_rx).await,
            AppMode::All => {
                let agent_rx = shutdown_rx.resubscribe();
                tokio::try_join!(self.run_controller(shutdown_rx), self.run_agent(agent_rx))?;
                Ok(())
            }
        }
    }

    async fn run_controller(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let services = ControllerServices::build(&self.config.controller, &self.config.agent.ip_address)
            .await
            .context("装配控制器失败")?;
        let recovered = services.recover().await?;
        info!("控制器启动，恢复 {} 个步骤", recovered);

        let retry_handle = services.start_background(shutdown_rx.resubscribe());
        serve(
            AppState::from_services(&services),
            &self.config.controller.bind_address,
            shutdown_rx,
        )
        .await?;

        if let Some(handle) = retry_handle {
            if let Err(e) = handle.await {
                warn!("重试循环异常退出: {e}");
            }
        }
        info!("控制器已停止");
        Ok(())
    }

    async fn run_agent(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let agent = AgentService::build(&self.config.agent)?;
        let handles = agent.start(&shutdown_rx).await?;

        let _ = shutdown_rx.recv().await;
        info!("Agent 收到关闭信号");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Agent 循环异常退出: {e}");
            }
        }
        info!("Agent 已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode_checks_enabled_components() {
        let mut config = AppConfig::default();
        config.agent.enabled = false;

        assert_eq!(AppMode::parse("controller", &config).unwrap(), AppMode::Controller);
        assert!(AppMode::parse("agent", &config).is_err());
        assert!(AppMode::parse("all", &config).is_err());
        assert!(AppMode::parse("worker", &config).is_err());

        config.agent.enabled = true;
        assert_eq!(AppMode::parse("all", &config).unwrap(), AppMode::All);
    }
}
