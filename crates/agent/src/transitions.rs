//! 各阶段的任务状态转换动作

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use evalflow_domain::{
    AgentReportRequest, AgentReportResponse, Device, SchedulerError, SchedulerResult, TaskStatus,
};

use crate::action::Action;
use crate::container::{ContainerClient, ContainerHandle, ContainerState};
use crate::controller_client::ControllerClient;
use crate::device_allocator::DeviceAllocator;
use crate::task::{AgentTask, Stage};
use crate::task_pool::TaskPool;
use crate::uploader::ResultUploader;

/// 动作的输入：任务快照及其所在阶段
#[derive(Debug, Clone)]
pub struct StagedTask {
    pub stage: Stage,
    pub task: AgentTask,
}

impl StagedTask {
    pub fn new(stage: Stage, task: AgentTask) -> Self {
        Self { stage, task }
    }
}

/// preparing → running：分配设备并启动容器
pub struct PrepareAction {
    pool: Arc<TaskPool>,
    allocator: Arc<DeviceAllocator>,
    containers: Arc<dyn ContainerClient>,
}

impl PrepareAction {
    pub fn new(
        pool: Arc<TaskPool>,
        allocator: Arc<DeviceAllocator>,
        containers: Arc<dyn ContainerClient>,
    ) -> Self {
        Self {
            pool,
            allocator,
            containers,
        }
    }
}

#[async_trait]
impl Action for PrepareAction {
    type Input = StagedTask;
    type Output = (Vec<Device>, ContainerHandle);

    fn name(&self) -> &'static str {
        "prepare"
    }

    async fn validate(&self, input: &StagedTask) -> SchedulerResult<()> {
        input.task.trigger.validate()
    }

    async fn execute(&self, input: &StagedTask) -> SchedulerResult<Self::Output> {
        let task_id = input.task.id;
        let devices = self
            .allocator
            .allocate(task_id, input.task.trigger.devices)
            .await?;

        let mut task = input.task.clone();
        task.devices = devices.clone();
        match self.containers.start(&task).await {
            Ok(handle) => Ok((devices, handle)),
            Err(e) => {
                self.allocator.release(task_id).await;
                Err(e)
            }
        }
    }

    async fn commit(&self, input: &StagedTask, output: Self::Output) -> SchedulerResult<()> {
        let (devices, handle) = output;
        let mut task = input.task.clone();
        task.status = TaskStatus::Running;
        task.devices = devices;
        task.container_id = Some(handle.id.clone());
        task.ip = handle.ip;
        task.start_time = Some(Utc::now());

        if !self.pool.transfer(task, input.stage, Stage::Running).await {
            warn!("任务 {} 已不在 preparing 队列，停止刚启动的容器", input.task.id);
            self.containers.stop(&handle.id).await?;
            self.allocator.release(input.task.id).await;
        }
        Ok(())
    }
}

/// running → uploading | error：检查容器状态
pub struct MonitorAction {
    pool: Arc<TaskPool>,
    allocator: Arc<DeviceAllocator>,
    containers: Arc<dyn ContainerClient>,
}

impl MonitorAction {
    pub fn new(
        pool: Arc<TaskPool>,
        allocator: Arc<DeviceAllocator>,
        containers: Arc<dyn ContainerClient>,
    ) -> Self {
        Self {
            pool,
            allocator,
            containers,
        }
    }
}

#[async_trait]
impl Action for MonitorAction {
    type Input = StagedTask;
    type Output = ContainerState;

    fn name(&self) -> &'static str {
        "monitor"
    }

    async fn execute(&self, input: &StagedTask) -> SchedulerResult<ContainerState> {
        let container_id = input.task.container_id.as_deref().ok_or_else(|| {
            SchedulerError::invalid_request(format!("任务 {} 没有关联的容器", input.task.id))
        })?;
        self.containers.inspect(container_id).await
    }

    async fn commit(&self, input: &StagedTask, state: ContainerState) -> SchedulerResult<()> {
        let mut task = input.task.clone();
        let target = match state {
            ContainerState::Running => return Ok(()),
            ContainerState::Exited { code: 0 } => {
                task.status = TaskStatus::Uploading;
                Stage::Uploading
            }
            ContainerState::Exited { code } => {
                task.status = TaskStatus::Error;
                task.failed_reason = Some(format!("容器退出码 {code}"));
                task.stop_time = Some(Utc::now());
                Stage::Error
            }
            ContainerState::Missing => {
                task.status = TaskStatus::Error;
                task.failed_reason = Some("容器已丢失".to_string());
                task.stop_time = Some(Utc::now());
                Stage::Error
            }
        };

        self.allocator.release(task.id).await;
        task.devices.clear();
        self.pool.transfer(task, input.stage, target).await;
        Ok(())
    }
}

/// uploading → finished：上传结果
pub struct UploadAction {
    pool: Arc<TaskPool>,
    uploader: Arc<dyn ResultUploader>,
}

impl UploadAction {
    pub fn new(pool: Arc<TaskPool>, uploader: Arc<dyn ResultUploader>) -> Self {
        Self { pool, uploader }
    }
}

#[async_trait]
impl Action for UploadAction {
    type Input = StagedTask;
    type Output = ();

    fn name(&self) -> &'static str {
        "upload"
    }

    async fn execute(&self, input: &StagedTask) -> SchedulerResult<()> {
        self.uploader.upload(&input.task).await
    }

    async fn commit(&self, input: &StagedTask, _output: ()) -> SchedulerResult<()> {
        let mut task = input.task.clone();
        task.status = TaskStatus::Finished;
        task.stop_time = Some(Utc::now());
        self.pool.transfer(task, input.stage, Stage::Finished).await;
        Ok(())
    }
}

/// 任意执行阶段 → canceled：停止容器并释放设备
pub struct CancelAction {
    pool: Arc<TaskPool>,
    allocator: Arc<DeviceAllocator>,
    containers: Arc<dyn ContainerClient>,
}

impl CancelAction {
    pub fn new(
        pool: Arc<TaskPool>,
        allocator: Arc<DeviceAllocator>,
        containers: Arc<dyn ContainerClient>,
    ) -> Self {
        Self {
            pool,
            allocator,
            containers,
        }
    }
}

#[async_trait]
impl Action for CancelAction {
    type Input = StagedTask;
    type Output = ();

    fn name(&self) -> &'static str {
        "cancel"
    }

    async fn execute(&self, input: &StagedTask) -> SchedulerResult<()> {
        if let Some(container_id) = &input.task.container_id {
            self.containers.stop(container_id).await?;
        }
        self.allocator.release(input.task.id).await;
        Ok(())
    }

    async fn commit(&self, input: &StagedTask, _output: ()) -> SchedulerResult<()> {
        let mut task = input.task.clone();
        task.status = TaskStatus::Canceled;
        task.devices.clear();
        task.stop_time = Some(Utc::now());
        if self.pool.transfer(task, input.stage, Stage::Canceled).await {
            info!("任务 {} 已取消", input.task.id);
        }
        self.pool.clear_cancel(input.task.id).await;
        Ok(())
    }
}

/// 上报任务快照，归档已上报的终态任务并合入控制器的响应
pub struct ReportAction {
    pool: Arc<TaskPool>,
    client: Arc<dyn ControllerClient>,
}

impl ReportAction {
    pub fn new(pool: Arc<TaskPool>, client: Arc<dyn ControllerClient>) -> Self {
        Self { pool, client }
    }
}

#[async_trait]
impl Action for ReportAction {
    type Input = AgentReportRequest;
    type Output = AgentReportResponse;

    fn name(&self) -> &'static str {
        "report"
    }

    async fn execute(&self, input: &AgentReportRequest) -> SchedulerResult<AgentReportResponse> {
        self.client.report(input).await
    }

    async fn commit(
        &self,
        input: &AgentReportRequest,
        response: AgentReportResponse,
    ) -> SchedulerResult<()> {
        self.pool.archive_reported(&input.tasks).await;
        for trigger in response.tasks_to_run {
            self.pool.add(trigger).await;
        }
        for task_id in response.task_ids_to_cancel {
            self.pool.request_cancel(task_id).await;
        }
        Ok(())
    }
}
