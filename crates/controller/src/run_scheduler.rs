use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use evalflow_domain::{
    ContainerSpecificationFinder, ExecOutput, ResourcePoolRegistry, Run, RunExecutor,
    RunReportReceiver, RunRepository, RunSpec, SchedulerError, SchedulerResult, StatusMachine,
    StepRepository, StoragePathAllocator, TaskRepository, TaskStatus,
};
use evalflow_infrastructure::{MetricsCollector, StructuredLogger};

/// 把需要执行的任务转换为运行实例并提交给执行器
pub struct RunScheduler {
    task_repo: Arc<dyn TaskRepository>,
    run_repo: Arc<dyn RunRepository>,
    step_repo: Arc<dyn StepRepository>,
    spec_finder: Arc<dyn ContainerSpecificationFinder>,
    path_allocator: Arc<dyn StoragePathAllocator>,
    pools: Arc<ResourcePoolRegistry>,
    executor: Arc<dyn RunExecutor>,
    receiver: Arc<dyn RunReportReceiver>,
    metrics: Arc<MetricsCollector>,
}

impl RunScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        run_repo: Arc<dyn RunRepository>,
        step_repo: Arc<dyn StepRepository>,
        spec_finder: Arc<dyn ContainerSpecificationFinder>,
        path_allocator: Arc<dyn StoragePathAllocator>,
        pools: Arc<ResourcePoolRegistry>,
        executor: Arc<dyn RunExecutor>,
        receiver: Arc<dyn RunReportReceiver>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            task_repo,
            run_repo,
            step_repo,
            spec_finder,
            path_allocator,
            pools,
            executor,
            receiver,
            metrics,
        }
    }

    /// 为任务创建运行实例并提交执行
    ///
    /// 任务已有未结束的运行实例时返回 [`SchedulerError::ActiveRunExists`]。
    /// CREATED 的任务进入 PREPARING；等待重试的任务保持原有状态，不回退。
    /// 执行器提交失败时删除刚创建的运行实例，任务恢复到调度前的状态。
    pub async fn schedule(&self, task_id: i64) -> SchedulerResult<Run> {
        let (run, previous_status) = self.prepare_run(task_id).await?;

        if let Err(e) = self.executor.run(&run, self.receiver.clone()).await {
            warn!("运行实例 {} 提交执行器失败: {}", run.id, e);
            self.metrics.record_run_schedule_failure();
            self.rollback(&run, previous_status).await?;
            return Err(e);
        }

        self.metrics.record_run_scheduled();
        StructuredLogger::log_run_scheduled(
            run.id,
            run.task_id,
            &run.run_spec.image,
            &run.run_spec.resource_pool,
        );
        Ok(run)
    }

    /// 持有任务行锁完成校验、落库与任务状态更新，提交执行器前释放行锁
    async fn prepare_run(&self, task_id: i64) -> SchedulerResult<(Run, TaskStatus)> {
        let mut task = self
            .task_repo
            .lock_for_update(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        if let Some(run_id) = task.current_run {
            match self.run_repo.find_by_id(run_id).await? {
                Some(run) if !run.is_final() => {
                    return Err(SchedulerError::ActiveRunExists { task_id, run_id });
                }
                _ => {
                    debug!("任务 {} 的当前运行实例 {} 已结束，清除引用", task_id, run_id);
                    task.current_run = None;
                }
            }
        }

        let previous_status = task.status;
        let next_status = if task.is_awaiting_retry() {
            task.failed_reason = None;
            task.status
        } else {
            task.status.transfer(TaskStatus::Preparing)?
        };

        let step = self
            .step_repo
            .find_by_id(task.step_id)
            .await?
            .ok_or(SchedulerError::StepNotFound { id: task.step_id })?;
        let cs = self.spec_finder.find_cs(&task).await?;

        let pool = self.pools.get(&step.resource_pool)?;
        let requested_resources = pool.patch_resources(&task.resources);
        pool.validate_resources(&requested_resources)?;

        let run_spec = RunSpec {
            image: cs.image,
            command: cs.cmd,
            envs: cs.envs,
            resource_pool: pool.name.clone(),
            requested_resources,
        };
        let log_dir = self.path_allocator.run_log_dir(&task, task.retry_num);
        let run = self
            .run_repo
            .create(&Run::new(task.id, log_dir, run_spec))
            .await?;

        task.current_run = Some(run.id);
        task.status = next_status;
        task.updated_at = Utc::now();
        if let Err(e) = self.task_repo.update(&task).await {
            self.run_repo.delete(run.id).await?;
            return Err(e);
        }

        Ok((run, previous_status))
    }

    async fn rollback(&self, run: &Run, previous_status: TaskStatus) -> SchedulerResult<()> {
        self.run_repo.delete(run.id).await?;

        if let Some(mut task) = self.task_repo.lock_for_update(run.task_id).await? {
            if task.current_run == Some(run.id) {
                task.current_run = None;
                task.status = previous_status;
                task.updated_at = Utc::now();
                self.task_repo.update(&task).await?;
            }
        }
        Ok(())
    }

    /// 停止任务的当前运行实例，没有当前运行实例时什么也不做
    ///
    /// 返回是否向执行器发出了停止请求。停止的结果由执行器异步上报。
    pub async fn stop(&self, task_id: i64) -> SchedulerResult<bool> {
        let task = self
            .task_repo
            .find_by_id(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        let Some(run_id) = task.current_run else {
            debug!("任务 {} 没有当前运行实例，无需停止", task_id);
            return Ok(false);
        };

        let Some(run) = self.run_repo.find_by_id(run_id).await? else {
            warn!("任务 {} 引用的运行实例 {} 不存在", task_id, run_id);
            return Ok(false);
        };

        self.executor.stop(&run).await?;
        info!("已请求停止任务 {} 的运行实例 {}", task_id, run_id);
        Ok(true)
    }

    /// 在任务的当前运行实例中执行命令
    pub async fn exec(&self, task_id: i64, command: &[String]) -> SchedulerResult<ExecOutput> {
        let task = self
            .task_repo
            .find_by_id(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        let run_id = task
            .current_run
            .ok_or(SchedulerError::NoActiveRun { task_id })?;
        let run = self
            .run_repo
            .find_by_id(run_id)
            .await?
            .ok_or(SchedulerError::RunNotFound { id: run_id })?;

        self.executor.exec(&run, command).await
    }
}
