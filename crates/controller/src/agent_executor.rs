//! 通过 Agent 上报通道执行运行实例
//!
//! 运行实例先进入等待队列，Agent 上报时按 FIFO 取出能放进该节点空闲设备的触发请求，
//! 放不下的请求跳过但保持原位。取消请求在下一次上报的响应中带给持有任务的 Agent。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use evalflow_domain::{
    DeviceClass, DeviceRequest, ExecOutput, JobRepository, NodeInfo, ReportedRun, Run,
    RunExecutor, RunReportReceiver, RunStatus, SchedulerError, SchedulerResult, TaskRepository,
    TaskTrigger,
};

struct PendingRun {
    run_id: i64,
    trigger: TaskTrigger,
    receiver: Arc<dyn RunReportReceiver>,
}

/// 已下发到 Agent 的运行实例
struct Assignment {
    run_id: i64,
    serial_number: String,
}

#[derive(Default)]
struct DispatchState {
    pending: VecDeque<PendingRun>,
    /// task_id -> 当前运行实例所在的 Agent
    assignments: HashMap<i64, Assignment>,
    /// Agent 序列号 -> 待下发的取消任务 id
    cancels: HashMap<String, Vec<i64>>,
}

pub struct AgentRunExecutor {
    task_repo: Arc<dyn TaskRepository>,
    job_repo: Arc<dyn JobRepository>,
    state: Mutex<DispatchState>,
}

impl AgentRunExecutor {
    pub fn new(task_repo: Arc<dyn TaskRepository>, job_repo: Arc<dyn JobRepository>) -> Self {
        Self {
            task_repo,
            job_repo,
            state: Mutex::new(DispatchState::default()),
        }
    }

    async fn build_trigger(&self, run: &Run) -> SchedulerResult<TaskTrigger> {
        let task = self
            .task_repo
            .find_by_id(run.task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: run.task_id })?;
        let job = self
            .job_repo
            .find_by_id(task.job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: task.job_id })?;

        let trigger = TaskTrigger {
            task_id: task.id,
            run_id: run.id,
            image: run.run_spec.image.clone(),
            command: run.run_spec.command.clone(),
            envs: run.run_spec.envs.clone(),
            devices: DeviceRequest::from_resources(&run.run_spec.requested_resources),
            dataset_uris: job.runtime.dataset_uris.clone(),
            model_uri: job.runtime.model_uri.clone(),
            result_root_path: task.result_root_path.clone(),
        };
        trigger.validate()?;
        Ok(trigger)
    }

    /// 为上报的 Agent 挑选可运行的任务，并取出待下发的取消请求
    pub async fn take_for_agent(&self, node: &NodeInfo) -> (Vec<TaskTrigger>, Vec<i64>) {
        let idle = |class: DeviceClass| {
            node.devices
                .iter()
                .filter(|device| device.class == class && device.is_idle())
                .count()
        };
        let mut idle_cpu = idle(DeviceClass::Cpu);
        let mut idle_gpu = idle(DeviceClass::Gpu);

        let mut state = self.state.lock().await;
        let mut triggers = Vec::new();
        let mut remaining = VecDeque::with_capacity(state.pending.len());

        while let Some(pending) = state.pending.pop_front() {
            let devices = pending.trigger.devices;
            if devices.cpu_num <= idle_cpu && devices.gpu_num <= idle_gpu {
                idle_cpu -= devices.cpu_num;
                idle_gpu -= devices.gpu_num;
                state.assignments.insert(
                    pending.trigger.task_id,
                    Assignment {
                        run_id: pending.run_id,
                        serial_number: node.serial_number.clone(),
                    },
                );
                debug!(
                    "运行实例 {} (任务 {}) 下发到 Agent {}",
                    pending.run_id, pending.trigger.task_id, node.serial_number
                );
                triggers.push(pending.trigger);
            } else {
                remaining.push_back(pending);
            }
        }
        state.pending = remaining;

        let cancels = state
            .cancels
            .remove(&node.serial_number)
            .unwrap_or_default();
        (triggers, cancels)
    }

    /// 记录运行实例所在的 Agent，控制器重启后由上报重建
    pub async fn bind(&self, task_id: i64, run_id: i64, serial_number: &str) {
        let mut state = self.state.lock().await;
        match state.assignments.get(&task_id) {
            Some(assignment) if assignment.run_id == run_id => {}
            _ => {
                state.assignments.insert(
                    task_id,
                    Assignment {
                        run_id,
                        serial_number: serial_number.to_string(),
                    },
                );
            }
        }
    }

    /// 运行实例在 Agent 上结束后释放绑定，已被新的运行实例取代时不做修改
    pub async fn release(&self, task_id: i64, run_id: i64) {
        let mut state = self.state.lock().await;
        if !matches!(state.assignments.get(&task_id), Some(a) if a.run_id == run_id) {
            return;
        }
        if let Some(assignment) = state.assignments.remove(&task_id) {
            if let Some(ids) = state.cancels.get_mut(&assignment.serial_number) {
                ids.retain(|id| *id != task_id);
            }
        }
    }

    /// 运行实例仍在等待队列中，尚未下发给任何 Agent
    pub async fn is_pending(&self, run_id: i64) -> bool {
        self.state
            .lock()
            .await
            .pending
            .iter()
            .any(|pending| pending.run_id == run_id)
    }

    /// 运行实例是否已经下发给该 Agent
    pub async fn is_assigned(&self, task_id: i64, run_id: i64, serial_number: &str) -> bool {
        let state = self.state.lock().await;
        matches!(
            state.assignments.get(&task_id),
            Some(a) if a.run_id == run_id && a.serial_number == serial_number
        )
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[async_trait]
impl RunExecutor for AgentRunExecutor {
    async fn run(&self, run: &Run, receiver: Arc<dyn RunReportReceiver>) -> SchedulerResult<()> {
        let trigger = self.build_trigger(run).await?;
        let mut state = self.state.lock().await;
        if state.pending.iter().any(|p| p.run_id == run.id) {
            return Ok(());
        }
        state.pending.push_back(PendingRun {
            run_id: run.id,
            trigger,
            receiver,
        });
        info!("运行实例 {} 进入 Agent 等待队列", run.id);
        Ok(())
    }

    async fn stop(&self, run: &Run) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;

        if let Some(pos) = state.pending.iter().position(|p| p.run_id == run.id) {
            if let Some(pending) = state.pending.remove(pos) {
                drop(state);
                info!("运行实例 {} 尚未下发，直接取消", run.id);
                let report = ReportedRun::status(run.id, RunStatus::Canceled)
                    .with_finish_time(Utc::now());
                tokio::spawn(async move {
                    if let Err(e) = pending.receiver.receive(report).await {
                        warn!("上报运行实例取消失败: {}", e);
                    }
                });
            }
            return Ok(());
        }

        let serial = state
            .assignments
            .get(&run.task_id)
            .filter(|assignment| assignment.run_id == run.id)
            .map(|assignment| assignment.serial_number.clone());
        match serial {
            Some(serial) => {
                let ids = state.cancels.entry(serial.clone()).or_default();
                if !ids.contains(&run.task_id) {
                    ids.push(run.task_id);
                }
                info!(
                    "任务 {} 的取消请求将在 Agent {} 下次上报时下发",
                    run.task_id, serial
                );
            }
            None => warn!("运行实例 {} 不在任何 Agent 上，忽略停止请求", run.id),
        }
        Ok(())
    }

    async fn exec(&self, run: &Run, _command: &[String]) -> SchedulerResult<ExecOutput> {
        Err(SchedulerError::Executor(format!(
            "Agent 执行器不支持在运行实例 {} 中执行命令",
            run.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalflow_domain::{
        Device, Job, JobRuntime, ReceiveOutcome, RunSpec, RuntimeResource, Task,
    };
    use evalflow_infrastructure::{InMemoryJobRepository, InMemoryTaskRepository};
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct RecordingReceiver {
        reports: std::sync::Mutex<Vec<ReportedRun>>,
    }

    #[async_trait]
    impl RunReportReceiver for RecordingReceiver {
        async fn receive(&self, report: ReportedRun) -> SchedulerResult<ReceiveOutcome> {
            self.reports.lock().unwrap().push(report);
            Ok(ReceiveOutcome::Unchanged)
        }
    }

    async fn setup() -> (AgentRunExecutor, Arc<InMemoryTaskRepository>, i64) {
        let task_repo = Arc::new(InMemoryTaskRepository::new());
        let job_repo = Arc::new(InMemoryJobRepository::new());
        let job = job_repo
            .create(&Job::new(
                "eval".to_string(),
                JobRuntime {
                    image: "eval:1".to_string(),
                    command: vec![],
                    envs: BTreeMap::new(),
                    device_class: DeviceClass::Gpu,
                    device_amount: 1,
                    dataset_uris: vec!["s3://data".to_string()],
                    model_uri: None,
                },
            ))
            .await
            .unwrap();
        let executor = AgentRunExecutor::new(task_repo.clone(), job_repo);
        (executor, task_repo, job.id)
    }

    async fn run_for(task_repo: &InMemoryTaskRepository, job_id: i64, id: i64, gpus: f32) -> Run {
        let task = task_repo
            .create(&Task::new(job_id, 1, 0, format!("/results/{id}"), vec![]))
            .await
            .unwrap();
        let mut run = Run::new(
            task.id,
            "/logs".to_string(),
            RunSpec {
                image: "eval:1".to_string(),
                command: vec![],
                envs: BTreeMap::new(),
                resource_pool: "default".to_string(),
                requested_resources: vec![RuntimeResource::new("nvidia.com/gpu", gpus)],
            },
        );
        run.id = id;
        run
    }

    fn node(idle_gpus: usize) -> NodeInfo {
        NodeInfo {
            serial_number: "agent-1".to_string(),
            host_address: "10.0.0.1".to_string(),
            memory_mb: 1024,
            devices: (0..idle_gpus)
                .map(|i| Device::gpu(i.to_string(), "A100", "535"))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_take_skips_triggers_that_do_not_fit() {
        let (executor, task_repo, job_id) = setup().await;
        let receiver = Arc::new(RecordingReceiver {
            reports: std::sync::Mutex::new(Vec::new()),
        });
        let big = run_for(&task_repo, job_id, 100, 4.0).await;
        let small = run_for(&task_repo, job_id, 101, 1.0).await;
        executor.run(&big, receiver.clone()).await.unwrap();
        executor.run(&small, receiver.clone()).await.unwrap();

        let (triggers, cancels) = executor.take_for_agent(&node(2)).await;
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].task_id, small.task_id);
        assert_eq!(triggers[0].dataset_uris, vec!["s3://data".to_string()]);
        assert!(cancels.is_empty());
        assert_eq!(executor.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_pending_reports_canceled() {
        let (executor, task_repo, job_id) = setup().await;
        let receiver = Arc::new(RecordingReceiver {
            reports: std::sync::Mutex::new(Vec::new()),
        });
        let run = run_for(&task_repo, job_id, 200, 1.0).await;
        executor.run(&run, receiver.clone()).await.unwrap();
        executor.stop(&run).await.unwrap();
        assert_eq!(executor.pending_count().await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let reports = receiver.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, Some(RunStatus::Canceled));
    }

    #[tokio::test]
    async fn test_stop_assigned_queues_cancel_for_agent() {
        let (executor, task_repo, job_id) = setup().await;
        let receiver = Arc::new(RecordingReceiver {
            reports: std::sync::Mutex::new(Vec::new()),
        });
        let run = run_for(&task_repo, job_id, 300, 1.0).await;
        executor.run(&run, receiver).await.unwrap();
        let (triggers, _) = executor.take_for_agent(&node(1)).await;
        assert_eq!(triggers.len(), 1);

        executor.stop(&run).await.unwrap();
        let (_, cancels) = executor.take_for_agent(&node(0)).await;
        assert_eq!(cancels, vec![run.task_id]);

        // 取消请求只下发一次
        let (_, cancels) = executor.take_for_agent(&node(0)).await;
        assert!(cancels.is_empty());
    }

    #[tokio::test]
    async fn test_release_ignores_superseded_run() {
        let (executor, task_repo, job_id) = setup().await;
        let receiver = Arc::new(RecordingReceiver {
            reports: std::sync::Mutex::new(Vec::new()),
        });
        let first = run_for(&task_repo, job_id, 400, 1.0).await;
        executor.run(&first, receiver.clone()).await.unwrap();
        let (triggers, _) = executor.take_for_agent(&node(1)).await;
        assert_eq!(triggers[0].run_id, first.id);

        let mut second = first.clone();
        second.id = 401;
        executor.run(&second, receiver).await.unwrap();
        executor.take_for_agent(&node(1)).await;
        assert!(executor.is_assigned(second.task_id, second.id, "agent-1").await);

        // 旧运行实例的终态快照不会释放新运行实例的绑定
        executor.release(first.task_id, first.id).await;
        assert!(executor.is_assigned(second.task_id, second.id, "agent-1").await);
        executor.release(second.task_id, second.id).await;
        assert!(!executor.is_assigned(second.task_id, second.id, "agent-1").await);
    }
}
