use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use evalflow_domain::{
    task_status_for_run, Run, RunStatus, RunUpdateListener, SchedulerResult, StatusMachine, Task,
    TaskRepository, TaskStatus,
};
use evalflow_infrastructure::{MetricsCollector, StructuredLogger};

use crate::job_service::JobService;
use crate::retry_service::RetryRequest;

struct TaskUpdate {
    step_id: i64,
    changed: bool,
    retry: Option<RetryRequest>,
}

/// 重试的新运行实例还没有追上任务在上一次运行中已到达的阶段
fn lags_behind(task: &Task, target: TaskStatus) -> bool {
    task.retry_num > 0
        && matches!(
            (task.status, target),
            (TaskStatus::Running, TaskStatus::Preparing)
                | (TaskStatus::Uploading, TaskStatus::Preparing | TaskStatus::Running)
        )
}

/// 运行实例 → 任务 → 步骤 → 作业 的状态传播
pub struct TaskStatusPropagator {
    task_repo: Arc<dyn TaskRepository>,
    job_service: Arc<JobService>,
    retry_tx: mpsc::UnboundedSender<RetryRequest>,
    max_retries: u32,
    metrics: Arc<MetricsCollector>,
}

impl TaskStatusPropagator {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        job_service: Arc<JobService>,
        retry_tx: mpsc::UnboundedSender<RetryRequest>,
        max_retries: u32,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            task_repo,
            job_service,
            retry_tx,
            max_retries,
            metrics,
        }
    }

    async fn apply_to_task(&self, run: &Run) -> SchedulerResult<Option<TaskUpdate>> {
        let Some(mut task) = self.task_repo.lock_for_update(run.task_id).await? else {
            warn!("运行实例 {} 所属的任务 {} 不存在", run.id, run.task_id);
            return Ok(None);
        };
        if task.current_run != Some(run.id) {
            debug!(
                "运行实例 {} 不是任务 {} 的当前运行实例，忽略",
                run.id, task.id
            );
            return Ok(None);
        }

        let mut changed = false;
        if run.ip.is_some() && task.ip != run.ip {
            task.ip = run.ip.clone();
            changed = true;
        }
        if run.start_time.is_some() && task.started_time != run.start_time {
            task.started_time = run.start_time;
            changed = true;
        }
        if run.failed_reason.is_some() && task.failed_reason != run.failed_reason {
            task.failed_reason = run.failed_reason.clone();
            changed = true;
        }

        let mut retry = None;
        let retryable = run.status == RunStatus::Failed
            && task.status != TaskStatus::Canceling
            && task.retry_num < self.max_retries;

        if retryable {
            task.retry_num += 1;
            task.current_run = None;
            changed = true;
            retry = Some(RetryRequest {
                task_id: task.id,
                retry_num: task.retry_num,
            });
            info!(
                "任务 {} 的运行实例 {} 失败，安排第 {} 次重试",
                task.id, run.id, task.retry_num
            );
        } else {
            let target = task_status_for_run(run.status);
            if lags_behind(&task, target) {
                debug!(
                    "任务 {} 保持 {:?}，重试运行实例 {} 处于 {:?}",
                    task.id, task.status, run.id, run.status
                );
            } else if target != task.status {
                match task.status.next(target) {
                    Some(next) => {
                        task.status = next;
                        changed = true;
                    }
                    None => {
                        StructuredLogger::log_transition_rejected(
                            "task",
                            task.id,
                            &format!("{:?}", task.status),
                            &format!("{target:?}"),
                        );
                        self.metrics.record_transition_rejected("task");
                    }
                }
            }
            if run.is_final() {
                task.current_run = None;
                task.finished_time = run.finish_time.or(Some(Utc::now()));
                changed = true;
            }
        }

        if changed {
            task.updated_at = Utc::now();
            self.task_repo.update(&task).await?;
        }

        Ok(Some(TaskUpdate {
            step_id: task.step_id,
            changed,
            retry,
        }))
    }
}

#[async_trait]
impl RunUpdateListener for TaskStatusPropagator {
    async fn on_run_updated(&self, run: &Run) -> SchedulerResult<()> {
        // 任务行锁在 apply_to_task 返回时释放，之后再推导步骤与作业
        let Some(update) = self.apply_to_task(run).await? else {
            return Ok(());
        };

        if let Some(request) = update.retry {
            self.metrics.record_task_retry();
            if self.retry_tx.send(request).is_err() {
                warn!("重试服务已停止，任务 {} 的重试请求被丢弃", request.task_id);
            }
        }

        if update.changed {
            self.job_service.refresh_step(update.step_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retried_run_does_not_pull_task_back() {
        let mut task = Task::new(1, 1, 0, "/results/1".to_string(), vec![]);
        task.status = TaskStatus::Running;
        assert!(!lags_behind(&task, TaskStatus::Preparing));

        task.retry_num = 1;
        assert!(lags_behind(&task, TaskStatus::Preparing));
        assert!(!lags_behind(&task, TaskStatus::Running));
        assert!(!lags_behind(&task, TaskStatus::Error));

        task.status = TaskStatus::Uploading;
        assert!(lags_behind(&task, TaskStatus::Running));
        assert!(!lags_behind(&task, TaskStatus::Finished));
    }
}
