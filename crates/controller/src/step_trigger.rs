use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use evalflow_domain::{
    ErrorKind, SchedulerError, SchedulerResult, StatusMachine, Step, TaskRepository, TaskStatus,
};

use crate::run_scheduler::RunScheduler;

/// 一次触发的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub scheduled: usize,
    /// 调度时因请求无效被置为 ERROR 的任务数
    pub failed: usize,
}

/// 在步骤并发上限内调度 CREATED 任务
///
/// 同一步骤的触发串行执行，避免并发触发时超出上限。
pub struct StepTrigger {
    task_repo: Arc<dyn TaskRepository>,
    scheduler: Arc<RunScheduler>,
    step_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl StepTrigger {
    pub fn new(task_repo: Arc<dyn TaskRepository>, scheduler: Arc<RunScheduler>) -> Self {
        Self {
            task_repo,
            scheduler,
            step_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn trigger(&self, step: &Step) -> SchedulerResult<TriggerOutcome> {
        let mut outcome = TriggerOutcome::default();
        if step.is_final() {
            self.forget(step.id).await;
            return Ok(outcome);
        }

        let lock = {
            let mut locks = self.step_locks.lock().await;
            locks.entry(step.id).or_default().clone()
        };
        let _guard = lock.lock().await;

        let tasks = self.task_repo.find_by_step_id(step.id).await?;
        let active = tasks
            .iter()
            .filter(|task| !task.is_final() && task.status != TaskStatus::Created)
            .count();
        let limit = step.concurrency.max(1) as usize;

        for task in tasks.iter().filter(|task| task.status == TaskStatus::Created) {
            if active + outcome.scheduled >= limit {
                debug!(
                    "步骤 {} 已达到并发上限 {}，剩余任务等待下次触发",
                    step.id, limit
                );
                break;
            }

            match self.scheduler.schedule(task.id).await {
                Ok(run) => {
                    debug!("步骤 {} 的任务 {} 已调度为运行实例 {}", step.id, task.id, run.id);
                    outcome.scheduled += 1;
                }
                Err(e) => match e.kind() {
                    // 并发触发抢先调度了同一任务
                    ErrorKind::Conflict => continue,
                    ErrorKind::Validation | ErrorKind::NotFound
                        if !matches!(e, SchedulerError::ActiveRunExists { .. }) =>
                    {
                        warn!("任务 {} 无法调度，置为 ERROR: {}", task.id, e);
                        self.fail_task(task.id, &e).await?;
                        outcome.failed += 1;
                    }
                    ErrorKind::Validation => continue,
                    _ => {
                        warn!("调度任务 {} 失败，等待下次触发: {}", task.id, e);
                        break;
                    }
                },
            }
        }

        Ok(outcome)
    }

    /// 步骤结束后释放它的触发锁
    pub async fn forget(&self, step_id: i64) {
        self.step_locks.lock().await.remove(&step_id);
    }

    #[cfg(test)]
    async fn tracked_steps(&self) -> usize {
        self.step_locks.lock().await.len()
    }

    pub(crate) async fn fail_task(&self, task_id: i64, error: &SchedulerError) -> SchedulerResult<()> {
        let Some(mut task) = self.task_repo.lock_for_update(task_id).await? else {
            return Ok(());
        };
        if let Some(next) = task.status.next(TaskStatus::Error) {
            task.status = next;
            task.failed_reason = Some(error.to_string());
            task.finished_time = Some(Utc::now());
            task.updated_at = Utc::now();
            self.task_repo.update(&task).await?;
        }
        Ok(())
    }
}
