//! 作业拆分、步骤推进与取消
//!
//! 作业创建时按请求顺序生成步骤（`index` 从 0 开始），第一个步骤立即开始；
//! 步骤成功后开始下一个步骤，步骤失败后尚未开始的步骤直接取消。
//! 步骤与作业的状态都由下层状态推导，只在状态机允许时写入。

use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use evalflow_domain::{
    derive_job_status, derive_step_status, DeviceClass, ErrorKind, Job, JobRepository, JobRuntime,
    JobStatus, ResourcePoolRegistry, RuntimeResource, SchedulerError, SchedulerResult, StatusMachine, Step,
    StepRepository, StepStatus, StepSummary, StoragePathAllocator, Task, TaskRepository,
    TaskStatus, TaskSummary,
};

use crate::run_scheduler::RunScheduler;
use crate::step_trigger::StepTrigger;

const GPU_RESOURCE_TYPE: &str = "nvidia.com/gpu";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub name: String,
    /// 为空时使用默认资源池
    #[serde(default)]
    pub resource_pool: Option<String>,
    pub task_num: u32,
    /// 为空时等于 `task_num`
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub resources: Vec<RuntimeResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub runtime: JobRuntime,
    pub steps: Vec<StepRequest>,
}

/// 作业及其步骤、任务的完整视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    pub job: Job,
    pub steps: Vec<Step>,
    pub tasks: Vec<Task>,
}

pub struct JobService {
    job_repo: Arc<dyn JobRepository>,
    step_repo: Arc<dyn StepRepository>,
    task_repo: Arc<dyn TaskRepository>,
    pools: Arc<ResourcePoolRegistry>,
    path_allocator: Arc<dyn StoragePathAllocator>,
    scheduler: Arc<RunScheduler>,
    trigger: StepTrigger,
}

impl JobService {
    pub fn new(
        job_repo: Arc<dyn JobRepository>,
        step_repo: Arc<dyn StepRepository>,
        task_repo: Arc<dyn TaskRepository>,
        pools: Arc<ResourcePoolRegistry>,
        path_allocator: Arc<dyn StoragePathAllocator>,
        scheduler: Arc<RunScheduler>,
    ) -> Self {
        let trigger = StepTrigger::new(task_repo.clone(), scheduler.clone());
        Self {
            job_repo,
            step_repo,
            task_repo,
            pools,
            path_allocator,
            scheduler,
            trigger,
        }
    }

    /// 校验请求并生成步骤，任何校验失败都不会落库
    fn build_steps(&self, request: &JobRequest) -> SchedulerResult<Vec<Step>> {
        if request.name.trim().is_empty() {
            return Err(SchedulerError::invalid_request("作业名称不能为空"));
        }
        if request.runtime.image.trim().is_empty() {
            return Err(SchedulerError::invalid_request("作业镜像不能为空"));
        }
        if request.steps.is_empty() {
            return Err(SchedulerError::invalid_request("作业至少需要一个步骤"));
        }

        let mut steps = Vec::with_capacity(request.steps.len());
        for (index, step_req) in request.steps.iter().enumerate() {
            if step_req.task_num == 0 {
                return Err(SchedulerError::invalid_request(format!(
                    "步骤 {} 的任务数必须大于 0",
                    step_req.name
                )));
            }

            let pool_name = step_req.resource_pool.as_deref().unwrap_or_default();
            let pool = self.pools.get(pool_name).map_err(|_| {
                SchedulerError::invalid_request(format!(
                    "步骤 {} 引用了不存在的资源池 {}",
                    step_req.name, pool_name
                ))
            })?;

            let mut resources = step_req.resources.clone();
            let runtime = &request.runtime;
            if runtime.device_class == DeviceClass::Gpu
                && runtime.device_amount > 0
                && !resources.iter().any(|r| r.resource_type == GPU_RESOURCE_TYPE)
            {
                resources.push(RuntimeResource::new(
                    GPU_RESOURCE_TYPE,
                    runtime.device_amount as f32,
                ));
            }
            pool.validate_resources(&resources)?;
            let resources = pool.patch_resources(&resources);

            steps.push(Step {
                id: 0,
                job_id: 0,
                index: index as u32,
                name: step_req.name.clone(),
                status: StepStatus::Created,
                resource_pool: pool.name.clone(),
                resources,
                task_num: step_req.task_num,
                concurrency: step_req.concurrency.unwrap_or(step_req.task_num).max(1),
                started_time: None,
                finished_time: None,
            });
        }
        Ok(steps)
    }

    pub async fn create_job(&self, request: JobRequest) -> SchedulerResult<Job> {
        let steps = self.build_steps(&request)?;

        let mut job = self
            .job_repo
            .create(&Job::new(request.name.clone(), request.runtime.clone()))
            .await?;
        let mut first_step = None;
        for mut step in steps {
            step.job_id = job.id;
            let created = self.step_repo.create(&step).await?;
            first_step.get_or_insert(created);
        }

        job.status = job.status.transfer(JobStatus::Split)?;
        self.job_repo.update(&job).await?;
        info!("作业 {} ({}) 已拆分为 {} 个步骤", job.id, job.name, request.steps.len());

        if let Some(step) = first_step {
            self.start_step(&job, &step).await?;
        }
        self.refresh_job(job.id).await?;

        self.job_repo
            .find_by_id(job.id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: job.id })
    }

    /// 为步骤生成任务并触发调度
    async fn start_step(&self, job: &Job, step: &Step) -> SchedulerResult<()> {
        if matches!(job.status, JobStatus::ToCancel) || job.is_final() {
            debug!("作业 {} 处于 {:?}，不再开始步骤 {}", job.id, job.status, step.id);
            return Ok(());
        }

        let existing = self.task_repo.find_by_step_id(step.id).await?;
        if existing.is_empty() {
            for index in 0..step.task_num {
                let path = self.path_allocator.task_result_path(job, step, index);
                self.task_repo
                    .create(&Task::new(job.id, step.id, index, path, step.resources.clone()))
                    .await?;
            }
            info!(
                "作业 {} 的步骤 {} ({}) 已开始，生成 {} 个任务",
                job.id, step.index, step.name, step.task_num
            );
        }

        self.refresh_step(step.id).await
    }

    /// 重新推导步骤状态，触发调度，并继续推导作业状态
    pub async fn refresh_step(&self, step_id: i64) -> SchedulerResult<()> {
        let mut final_transition = None;
        let step = loop {
            let step = {
                let mut step = self
                    .step_repo
                    .lock_for_update(step_id)
                    .await?
                    .ok_or(SchedulerError::StepNotFound { id: step_id })?;
                let tasks = self.task_repo.find_by_step_id(step_id).await?;
                let derived = derive_step_status(tasks.iter().map(TaskSummary::from));

                if let Some(next) = step.status.next(derived) {
                    debug!("步骤 {} 状态 {:?} -> {:?}", step_id, step.status, next);
                    step.status = next;
                    let now = Utc::now();
                    step.started_time.get_or_insert(now);
                    if next.is_final() {
                        step.finished_time = Some(now);
                        final_transition = Some(next);
                    }
                    self.step_repo.update(&step).await?;
                }
                step.clone()
            };

            if step.is_final() || !self.accepts_new_runs(step.job_id).await? {
                break step;
            }
            let outcome = self.trigger.trigger(&step).await?;
            if outcome.failed == 0 {
                break step;
            }
        };

        match final_transition {
            Some(StepStatus::Success) => self.start_next_step(&step).await?,
            Some(StepStatus::Failed) | Some(StepStatus::Canceled) => {
                self.cancel_pending_steps(step.job_id).await?
            }
            _ => {}
        }
        if step.is_final() {
            self.trigger.forget(step.id).await;
        }

        self.refresh_job(step.job_id).await
    }

    /// 为等待重试的任务创建新的运行实例，任务状态保持不变
    ///
    /// 返回是否提交了新的运行实例。请求已无法满足时任务置为 ERROR。
    pub async fn retry_task(&self, task: &Task) -> SchedulerResult<bool> {
        if !self.accepts_new_runs(task.job_id).await? {
            debug!("作业 {} 不再接受新的运行实例，任务 {} 不重试", task.job_id, task.id);
            return Ok(false);
        }

        let scheduled = match self.scheduler.schedule(task.id).await {
            Ok(run) => {
                info!("任务 {} 的重试运行实例 {} 已提交", task.id, run.id);
                true
            }
            Err(SchedulerError::ActiveRunExists { run_id, .. }) => {
                debug!("任务 {} 已有运行实例 {}，跳过重试", task.id, run_id);
                false
            }
            Err(e) if matches!(e.kind(), ErrorKind::Validation | ErrorKind::NotFound) => {
                warn!("任务 {} 无法重试，置为 ERROR: {}", task.id, e);
                self.trigger.fail_task(task.id, &e).await?;
                false
            }
            Err(e) => return Err(e),
        };

        self.refresh_step(task.step_id).await?;
        Ok(scheduled)
    }

    async fn accepts_new_runs(&self, job_id: i64) -> SchedulerResult<bool> {
        let job = self
            .job_repo
            .find_by_id(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: job_id })?;
        Ok(job.status != JobStatus::ToCancel && !job.is_final())
    }

    // start_step -> refresh_step -> start_next_step 构成递归，需要装箱
    fn start_next_step<'a>(&'a self, finished: &'a Step) -> BoxFuture<'a, SchedulerResult<()>> {
        async move {
            let steps = self.step_repo.find_by_job_id(finished.job_id).await?;
            let Some(next) = steps.iter().find(|step| step.index == finished.index + 1) else {
                debug!("作业 {} 的最后一个步骤已完成", finished.job_id);
                return Ok(());
            };
            let job = self
                .job_repo
                .find_by_id(finished.job_id)
                .await?
                .ok_or(SchedulerError::JobNotFound {
                    id: finished.job_id,
                })?;
            self.start_step(&job, next).await
        }
        .boxed()
    }

    /// 尚未生成任务的步骤直接取消
    async fn cancel_pending_steps(&self, job_id: i64) -> SchedulerResult<()> {
        for step in self.step_repo.find_by_job_id(job_id).await? {
            if step.status != StepStatus::Created {
                continue;
            }
            if !self.task_repo.find_by_step_id(step.id).await?.is_empty() {
                continue;
            }
            if let Some(mut locked) = self.step_repo.lock_for_update(step.id).await? {
                if let Some(next) = locked.status.next(StepStatus::Canceled) {
                    locked.status = next;
                    locked.finished_time = Some(Utc::now());
                    self.step_repo.update(&locked).await?;
                    debug!("作业 {} 的步骤 {} 未开始，已取消", job_id, step.id);
                }
            }
        }
        Ok(())
    }

    /// 按步骤顺序重新推导作业状态
    pub async fn refresh_job(&self, job_id: i64) -> SchedulerResult<()> {
        let mut job = self
            .job_repo
            .lock_for_update(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: job_id })?;

        let steps = self.step_repo.find_by_job_id(job_id).await?;
        let mut summaries = Vec::with_capacity(steps.len());
        for step in &steps {
            let task_count = self.task_repo.find_by_step_id(step.id).await?.len();
            summaries.push(StepSummary {
                status: step.status,
                task_count,
            });
        }

        let derived = derive_job_status(&summaries);
        if let Some(next) = job.status.next(derived) {
            info!("作业 {} 状态 {:?} -> {:?}", job_id, job.status, next);
            job.status = next;
            if next.is_final() {
                job.finished_time = Some(Utc::now());
            }
            self.job_repo.update(&job).await?;
        }
        Ok(())
    }

    /// 取消作业
    ///
    /// 未开始执行的任务直接取消，执行中的任务置为 CANCELING 并通知执行器停止，
    /// 由执行器的终态上报完成取消。
    pub async fn cancel_job(&self, job_id: i64) -> SchedulerResult<Job> {
        {
            let mut job = self
                .job_repo
                .lock_for_update(job_id)
                .await?
                .ok_or(SchedulerError::JobNotFound { id: job_id })?;
            if job.is_final() {
                debug!("作业 {} 已结束，忽略取消请求", job_id);
                return Ok(job.clone());
            }
            if job.status != JobStatus::ToCancel {
                job.status = job.status.transfer(JobStatus::ToCancel)?;
                self.job_repo.update(&job).await?;
                info!("作业 {} 进入 TO_CANCEL", job_id);
            }
        }

        let steps = self.step_repo.find_by_job_id(job_id).await?;
        for step in &steps {
            for task in self.task_repo.find_by_step_id(step.id).await? {
                if !task.is_final() {
                    self.cancel_task(task.id).await?;
                }
            }
        }

        self.cancel_pending_steps(job_id).await?;
        for step in &steps {
            self.refresh_step(step.id).await?;
        }

        self.job_repo
            .find_by_id(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: job_id })
    }

    async fn cancel_task(&self, task_id: i64) -> SchedulerResult<()> {
        let needs_stop = {
            let Some(mut task) = self.task_repo.lock_for_update(task_id).await? else {
                return Ok(());
            };
            if task.is_final() {
                return Ok(());
            }

            let (target, needs_stop) = if task.current_run.is_some() {
                (TaskStatus::Canceling, true)
            } else {
                (TaskStatus::Canceled, false)
            };
            if let Some(next) = task.status.next(target) {
                task.status = next;
                if next.is_final() {
                    task.finished_time = Some(Utc::now());
                }
                task.updated_at = Utc::now();
                self.task_repo.update(&task).await?;
            }
            needs_stop
        };

        if needs_stop {
            if let Err(e) = self.scheduler.stop(task_id).await {
                warn!("停止任务 {} 失败，等待执行器上报: {}", task_id, e);
            }
        }
        Ok(())
    }

    pub async fn describe_job(&self, job_id: i64) -> SchedulerResult<JobDetail> {
        let job = self
            .job_repo
            .find_by_id(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: job_id })?;
        let steps = self.step_repo.find_by_job_id(job_id).await?;
        let mut tasks = Vec::new();
        for step in &steps {
            tasks.extend(self.task_repo.find_by_step_id(step.id).await?);
        }
        Ok(JobDetail { job, steps, tasks })
    }
}
