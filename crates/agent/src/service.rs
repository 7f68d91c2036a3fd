//! Agent 组件装配与生命周期

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use evalflow_core::AgentConfig;
use evalflow_infrastructure::MetricsCollector;

use crate::container::{ContainerClient, ProcessContainerClient};
use crate::controller_client::{ControllerClient, HttpControllerClient};
use crate::device_allocator::DeviceAllocator;
use crate::dispatcher::{NodeIdentity, TaskDispatcher};
use crate::scheduler::{AgentScheduler, TickIntervals};
use crate::store::{AgentTaskStore, FileTaskStore};
use crate::task::Stage;
use crate::task_pool::TaskPool;
use crate::uploader::{LocalResultUploader, ResultUploader};

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentService {
    config: AgentConfig,
    pool: Arc<TaskPool>,
    allocator: Arc<DeviceAllocator>,
    dispatcher: Arc<TaskDispatcher>,
}

impl AgentService {
    pub fn build(config: &AgentConfig) -> Result<Self> {
        let store: Arc<dyn AgentTaskStore> = Arc::new(FileTaskStore::new(&config.data_dir));
        let containers: Arc<dyn ContainerClient> =
            Arc::new(ProcessContainerClient::new(config.ip_address.clone()));
        let uploader: Arc<dyn ResultUploader> = Arc::new(LocalResultUploader);
        let client: Arc<dyn ControllerClient> = Arc::new(
            HttpControllerClient::new(&config.controller_url, REPORT_TIMEOUT)
                .context("创建控制器客户端失败")?,
        );
        Ok(Self::build_with(config, store, containers, uploader, client))
    }

    pub fn build_with(
        config: &AgentConfig,
        store: Arc<dyn AgentTaskStore>,
        containers: Arc<dyn ContainerClient>,
        uploader: Arc<dyn ResultUploader>,
        client: Arc<dyn ControllerClient>,
    ) -> Self {
        let pool = Arc::new(TaskPool::new(store));
        let allocator = Arc::new(DeviceAllocator::from_config(config));
        let node = NodeIdentity {
            serial_number: config.serial_number.clone(),
            host_address: config.ip_address.clone(),
            memory_mb: config.memory_mb,
        };
        let dispatcher = Arc::new(TaskDispatcher::new(
            pool.clone(),
            allocator.clone(),
            containers,
            uploader,
            client,
            node,
            Arc::new(MetricsCollector::new()),
        ));
        Self {
            config: config.clone(),
            pool,
            allocator,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> Arc<TaskDispatcher> {
        self.dispatcher.clone()
    }

    /// 恢复本地任务与设备占用，之后任务池和设备才进入就绪状态
    pub async fn restore(&self) -> Result<usize> {
        let tasks = self.pool.restore().await.context("恢复本地任务失败")?;
        for task in &tasks {
            if Stage::for_task(task) == Stage::Running && !task.devices.is_empty() {
                self.allocator.reserve(task.id, &task.devices).await;
            }
        }
        self.allocator.mark_ready();
        self.pool.mark_ready();
        Ok(tasks.len())
    }

    pub async fn start(&self, shutdown: &broadcast::Receiver<()>) -> Result<Vec<JoinHandle<()>>> {
        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|_| self.config.hostname.clone());
        let restored = self.restore().await?;
        info!(
            "Agent {} 在 {} ({}) 上启动，恢复 {} 个任务，设备 {} 个",
            self.config.serial_number,
            hostname,
            self.config.ip_address,
            restored,
            self.allocator.devices().await.len()
        );

        Ok(AgentScheduler::start(
            self.dispatcher.clone(),
            TickIntervals::from(&self.config),
            shutdown,
        ))
    }
}
