//! 控制器组件装配

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use evalflow_core::{ControllerConfig, ExecutorKind};
use evalflow_domain::{
    ContainerSpecificationFinder, JobRepository, ResourcePoolRegistry, RunExecutor,
    RunReportReceiver, RunRepository, StepRepository, StoragePathAllocator, TaskRepository,
};
use evalflow_infrastructure::{
    InMemoryJobRepository, InMemoryRunRepository, InMemoryStepRepository, InMemoryTaskRepository,
    JobRuntimeSpecFinder, LocalStoragePathAllocator, MetricsCollector, ProcessRunExecutor,
};

use crate::agent_executor::AgentRunExecutor;
use crate::agent_report::AgentReportService;
use crate::job_service::JobService;
use crate::report_receiver::RunReportService;
use crate::retry_service::{RetryConfig, RetryRequest, TaskRetryService};
use crate::run_scheduler::RunScheduler;
use crate::status_propagator::TaskStatusPropagator;

/// 控制器依赖的存储
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub steps: Arc<dyn StepRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub runs: Arc<dyn RunRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobRepository::new()),
            steps: Arc::new(InMemoryStepRepository::new()),
            tasks: Arc::new(InMemoryTaskRepository::new()),
            runs: Arc::new(InMemoryRunRepository::new()),
        }
    }
}

/// 执行器的选择结果
///
/// Agent 执行器除了实现 [`RunExecutor`]，还需要被上报服务直接访问。
pub enum ExecutorChoice {
    Process(Arc<ProcessRunExecutor>),
    Agent(Arc<AgentRunExecutor>),
    Custom(Arc<dyn RunExecutor>),
}

impl ExecutorChoice {
    fn from_config(config: &ControllerConfig, repos: &Repositories, host_ip: &str) -> Self {
        match config.executor {
            ExecutorKind::Process => Self::Process(Arc::new(ProcessRunExecutor::new(host_ip))),
            ExecutorKind::Agent => Self::Agent(Arc::new(AgentRunExecutor::new(
                repos.tasks.clone(),
                repos.jobs.clone(),
            ))),
        }
    }

    fn as_executor(&self) -> Arc<dyn RunExecutor> {
        match self {
            Self::Process(executor) => executor.clone(),
            Self::Agent(executor) => executor.clone(),
            Self::Custom(executor) => executor.clone(),
        }
    }
}

/// 装配完成的控制器服务
pub struct ControllerServices {
    pub repositories: Repositories,
    pub receiver: Arc<RunReportService>,
    pub scheduler: Arc<RunScheduler>,
    pub job_service: Arc<JobService>,
    pub agent_reports: Option<Arc<AgentReportService>>,
    pub metrics: Arc<MetricsCollector>,
    retry_service: Arc<TaskRetryService>,
    retry_rx: std::sync::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<RetryRequest>>>,
}

impl ControllerServices {
    /// 按配置装配，资源池配置无效属于致命错误
    pub async fn build(config: &ControllerConfig, host_ip: &str) -> Result<Self> {
        let repositories = Repositories::in_memory();
        let executor = ExecutorChoice::from_config(config, &repositories, host_ip);
        Self::build_with(config, repositories, executor).await
    }

    pub async fn build_with(
        config: &ControllerConfig,
        repositories: Repositories,
        executor: ExecutorChoice,
    ) -> Result<Self> {
        let pools = Arc::new(
            ResourcePoolRegistry::from_config(config).context("加载资源池配置失败")?,
        );
        let metrics = Arc::new(MetricsCollector::new());

        let path_allocator: Arc<dyn StoragePathAllocator> = Arc::new(
            LocalStoragePathAllocator::new(config.result_root.clone(), config.log_root.clone()),
        );
        let spec_finder: Arc<dyn ContainerSpecificationFinder> = Arc::new(
            JobRuntimeSpecFinder::new(repositories.jobs.clone(), repositories.steps.clone()),
        );

        let receiver = Arc::new(RunReportService::new(
            repositories.runs.clone(),
            metrics.clone(),
        ));
        let receiver_port: Arc<dyn RunReportReceiver> = receiver.clone();

        let scheduler = Arc::new(RunScheduler::new(
            repositories.tasks.clone(),
            repositories.runs.clone(),
            repositories.steps.clone(),
            spec_finder,
            path_allocator.clone(),
            pools.clone(),
            executor.as_executor(),
            receiver_port.clone(),
            metrics.clone(),
        ));

        let job_service = Arc::new(JobService::new(
            repositories.jobs.clone(),
            repositories.steps.clone(),
            repositories.tasks.clone(),
            pools,
            path_allocator,
            scheduler.clone(),
        ));

        let (retry_tx, retry_rx) = TaskRetryService::channel();
        let retry_service = Arc::new(TaskRetryService::new(
            repositories.tasks.clone(),
            job_service.clone(),
            RetryConfig::from_controller(config),
        ));

        receiver
            .register_listener(Arc::new(TaskStatusPropagator::new(
                repositories.tasks.clone(),
                job_service.clone(),
                retry_tx,
                config.max_task_retries,
                metrics.clone(),
            )))
            .await;

        let agent_reports = match &executor {
            ExecutorChoice::Agent(agent_executor) => Some(Arc::new(AgentReportService::new(
                repositories.tasks.clone(),
                receiver_port,
                agent_executor.clone(),
                metrics.clone(),
            ))),
            _ => None,
        };

        info!(
            "控制器装配完成，执行器: {:?}，默认资源池: {}",
            config.executor, config.default_resource_pool
        );

        Ok(Self {
            repositories,
            receiver,
            scheduler,
            job_service,
            agent_reports,
            metrics,
            retry_service,
            retry_rx: std::sync::Mutex::new(Some(retry_rx)),
        })
    }

    /// 启动后台重试循环，只能调用一次
    pub fn start_background(&self, shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        let requests = self.retry_rx.lock().ok()?.take()?;
        Some(self.retry_service.clone().spawn(requests, shutdown))
    }

    /// 重新调度等待重试的任务，并重新触发仍有未结束任务的步骤
    pub async fn recover(&self) -> Result<usize> {
        let active = self
            .repositories
            .tasks
            .load_active_tasks()
            .await
            .context("加载未结束任务失败")?;
        for task in active.iter().filter(|task| task.is_awaiting_retry()) {
            if let Err(e) = self.retry_service.retry(task.id).await {
                warn!("恢复任务 {} 的重试失败: {}", task.id, e);
            }
        }
        let step_ids: BTreeSet<i64> = active.iter().map(|task| task.step_id).collect();
        for step_id in &step_ids {
            if let Err(e) = self.job_service.refresh_step(*step_id).await {
                warn!("恢复步骤 {} 失败: {}", step_id, e);
            }
        }
        if !step_ids.is_empty() {
            info!("已恢复 {} 个步骤的调度", step_ids.len());
        }
        Ok(step_ids.len())
    }
}
