//! # 任务派发循环
//!
//! 四个 tick 分别推进 preparing、running、uploading 三个阶段并向控制器上报。
//! 每个 tick 各自防重入：上一次还没结束时，新的调用直接跳过。
//!
//! preparing 队列严格 FIFO：每次只处理队首，队首拿不到设备时整个队列等待。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, warn};

use evalflow_domain::{AgentReportRequest, NodeInfo, SchedulerError, TaskStatus};
use evalflow_infrastructure::MetricsCollector;

use crate::action::{failure_policy, run_action, select_one_of, Action, FailurePolicy};
use crate::container::ContainerClient;
use crate::controller_client::ControllerClient;
use crate::device_allocator::DeviceAllocator;
use crate::task::Stage;
use crate::task_pool::TaskPool;
use crate::transitions::{
    CancelAction, MonitorAction, PrepareAction, ReportAction, StagedTask, UploadAction,
};
use crate::uploader::ResultUploader;

/// 非阻塞的单飞锁
#[derive(Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

pub struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl SingleFlight {
    pub fn try_enter(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flag: &self.busy })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// 上报时携带的节点静态信息
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub serial_number: String,
    pub host_address: String,
    pub memory_mb: u64,
}

pub struct TaskDispatcher {
    pool: Arc<TaskPool>,
    allocator: Arc<DeviceAllocator>,
    containers: Arc<dyn ContainerClient>,
    node: NodeIdentity,
    prepare: PrepareAction,
    monitor: MonitorAction,
    upload: UploadAction,
    cancel: CancelAction,
    report: ReportAction,
    metrics: Arc<MetricsCollector>,
    preparing_flight: SingleFlight,
    running_flight: SingleFlight,
    uploading_flight: SingleFlight,
    report_flight: SingleFlight,
}

impl TaskDispatcher {
    pub fn new(
        pool: Arc<TaskPool>,
        allocator: Arc<DeviceAllocator>,
        containers: Arc<dyn ContainerClient>,
        uploader: Arc<dyn ResultUploader>,
        client: Arc<dyn ControllerClient>,
        node: NodeIdentity,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            prepare: PrepareAction::new(pool.clone(), allocator.clone(), containers.clone()),
            monitor: MonitorAction::new(pool.clone(), allocator.clone(), containers.clone()),
            upload: UploadAction::new(pool.clone(), uploader),
            cancel: CancelAction::new(pool.clone(), allocator.clone(), containers.clone()),
            report: ReportAction::new(pool.clone(), client),
            pool,
            allocator,
            containers,
            node,
            metrics,
            preparing_flight: SingleFlight::default(),
            running_flight: SingleFlight::default(),
            uploading_flight: SingleFlight::default(),
            report_flight: SingleFlight::default(),
        }
    }

    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    /// 处理 preparing 队首，返回是否执行了转换
    pub async fn deal_preparing_tasks(&self) -> bool {
        let Some(_guard) = self.preparing_flight.try_enter() else {
            return false;
        };
        if !self.pool.is_ready() || !self.allocator.is_ready() {
            debug!("任务池或设备尚未就绪");
            return false;
        }
        let started = Instant::now();
        self.metrics
            .update_preparing_queue_depth(self.pool.len(Stage::Preparing).await);

        let Some(task) = self.pool.peek(Stage::Preparing).await else {
            return false;
        };
        let proceed = !self.pool.should_cancel(&task).await;
        let staged = StagedTask::new(Stage::Preparing, task);
        let (_, result) = select_one_of(&staged, proceed, &self.prepare, &self.cancel).await;
        let moved = match result {
            Ok(()) => true,
            Err(e) => {
                self.handle_failure(&staged, &e).await;
                false
            }
        };

        self.metrics
            .update_idle_devices(self.allocator.idle_count().await);
        self.metrics
            .record_tick_duration("preparing", started.elapsed().as_secs_f64());
        moved
    }

    pub async fn monitor_running_tasks(&self) {
        let Some(_guard) = self.running_flight.try_enter() else {
            return;
        };
        let started = Instant::now();
        self.advance(Stage::Running, &self.monitor).await;
        self.metrics
            .record_tick_duration("running", started.elapsed().as_secs_f64());
    }

    pub async fn upload_task_results(&self) {
        let Some(_guard) = self.uploading_flight.try_enter() else {
            return;
        };
        let started = Instant::now();
        self.advance(Stage::Uploading, &self.upload).await;
        self.metrics
            .record_tick_duration("uploading", started.elapsed().as_secs_f64());
    }

    /// 遍历阶段快照，逐个执行正常动作或取消动作
    async fn advance<A>(&self, stage: Stage, happy: &A)
    where
        A: Action<Input = StagedTask>,
    {
        for task in self.pool.snapshot(stage).await {
            let proceed = !self.pool.should_cancel(&task).await;
            let staged = StagedTask::new(stage, task);
            let (_, result) = select_one_of(&staged, proceed, happy, &self.cancel).await;
            if let Err(e) = result {
                self.handle_failure(&staged, &e).await;
            }
        }
    }

    /// 上报一次，返回是否成功；上一次上报未结束时直接跳过
    pub async fn report_tasks(&self) -> bool {
        let Some(_guard) = self.report_flight.try_enter() else {
            debug!("上一次上报仍在进行，跳过");
            return false;
        };
        let started = Instant::now();

        let request = AgentReportRequest {
            node: NodeInfo {
                serial_number: self.node.serial_number.clone(),
                host_address: self.node.host_address.clone(),
                memory_mb: self.node.memory_mb,
                devices: self.allocator.devices().await,
            },
            tasks: self.pool.report_snapshot().await,
        };

        let ok = match run_action(&self.report, &request).await {
            Ok(()) => true,
            Err(e) => {
                warn!("向控制器上报失败: {}", e);
                false
            }
        };
        self.metrics.record_agent_report(ok);
        self.metrics
            .record_tick_duration("report", started.elapsed().as_secs_f64());
        ok
    }

    async fn handle_failure(&self, staged: &StagedTask, error: &SchedulerError) {
        let task_id = staged.task.id;
        match failure_policy(error) {
            FailurePolicy::Retry => {
                debug!("任务 {} 暂时无法推进，等待下一次 tick: {}", task_id, error);
            }
            FailurePolicy::Fail => {
                warn!("任务 {} 无法执行，置为 ERROR: {}", task_id, error);
                self.fail_task(staged, error).await;
            }
            FailurePolicy::Ignore => {
                error!("任务 {} 在 {} 阶段处理失败: {}", task_id, staged.stage.as_str(), error);
            }
        }
    }

    async fn fail_task(&self, staged: &StagedTask, error: &SchedulerError) {
        let mut task = staged.task.clone();
        if let Some(container_id) = &task.container_id {
            if let Err(e) = self.containers.stop(container_id).await {
                warn!("停止任务 {} 的容器失败: {}", task.id, e);
            }
        }
        self.allocator.release(task.id).await;

        task.status = TaskStatus::Error;
        task.devices.clear();
        task.failed_reason = Some(error.to_string());
        task.stop_time = Some(Utc::now());
        self.pool.transfer(task, staged.stage, Stage::Error).await;
        self.pool.clear_cancel(staged.task.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight_skips_while_busy() {
        let flight = SingleFlight::default();
        let guard = flight.try_enter();
        assert!(guard.is_some());
        assert!(flight.try_enter().is_none());
        drop(guard);
        assert!(!flight.is_busy());
        assert!(flight.try_enter().is_some());
    }
}
