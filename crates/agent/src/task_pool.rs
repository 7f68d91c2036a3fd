//! # 任务池
//!
//! 每个阶段一个独立加锁的 FIFO 队列。跨阶段移动时按 [`Stage`] 的顺序加锁，
//! 遍历一律先取快照再处理，处理期间其他执行者可以继续修改队列。

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use evalflow_domain::{SchedulerResult, TaskSnapshot, TaskStatus, TaskTrigger};
use evalflow_infrastructure::StructuredLogger;

use crate::store::AgentTaskStore;
use crate::task::{AgentTask, Stage};

/// 下发任务合入任务池的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// 已归档的任务被重新下发
    Readded,
    Duplicate,
}

pub struct TaskPool {
    stages: Vec<RwLock<VecDeque<AgentTask>>>,
    need_to_cancel: Mutex<HashSet<i64>>,
    ready: AtomicBool,
    store: Arc<dyn AgentTaskStore>,
}

impl TaskPool {
    pub fn new(store: Arc<dyn AgentTaskStore>) -> Self {
        Self {
            stages: Stage::ALL.iter().map(|_| RwLock::new(VecDeque::new())).collect(),
            need_to_cancel: Mutex::new(HashSet::new()),
            ready: AtomicBool::new(false),
            store,
        }
    }

    fn queue(&self, stage: Stage) -> &RwLock<VecDeque<AgentTask>> {
        &self.stages[stage as usize]
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    async fn persist(&self, task: &AgentTask) {
        if let Err(e) = self.store.save_task(task).await {
            warn!("保存任务 {} 失败: {}", task.id, e);
        }
    }

    /// 从持久化存储恢复，返回恢复的任务
    pub async fn restore(&self) -> SchedulerResult<Vec<AgentTask>> {
        let tasks = self.store.load_active_tasks().await?;
        for task in &tasks {
            let stage = Stage::for_task(task);
            if task.status == TaskStatus::Canceling {
                self.need_to_cancel.lock().await.insert(task.id);
            }
            self.queue(stage).write().await.push_back(task.clone());
        }
        info!("从本地存储恢复 {} 个任务", tasks.len());
        Ok(tasks)
    }

    async fn locate(&self, task_id: i64) -> Option<(Stage, AgentTask)> {
        for stage in Stage::ALL {
            let queue = self.queue(stage).read().await;
            if let Some(task) = queue.iter().find(|t| t.id == task_id) {
                return Some((stage, task.clone()));
            }
        }
        None
    }

    /// 合入控制器下发的任务
    ///
    /// 同一运行实例重复下发时忽略；同一任务的新运行实例替换已结束的旧记录。
    pub async fn add(&self, trigger: TaskTrigger) -> AddOutcome {
        let mut task = AgentTask::from_trigger(trigger);
        let outcome = match self.locate(task.id).await {
            Some((stage, existing)) if existing.trigger.run_id == task.trigger.run_id => {
                debug!(
                    "任务 {} 的运行实例 {} 已在 {} 阶段，忽略重复下发",
                    task.id,
                    task.trigger.run_id,
                    stage.as_str()
                );
                return AddOutcome::Duplicate;
            }
            Some((stage, existing)) if stage == Stage::Archived || stage.is_terminal() => {
                let mut queue = self.queue(stage).write().await;
                queue.retain(|t| t.id != existing.id);
                task.retry_num = existing.retry_num + 1;
                AddOutcome::Readded
            }
            Some((stage, existing)) => {
                warn!(
                    "任务 {} 的运行实例 {} 仍在 {} 阶段，忽略运行实例 {}",
                    task.id,
                    existing.trigger.run_id,
                    stage.as_str(),
                    task.trigger.run_id
                );
                return AddOutcome::Duplicate;
            }
            None => AddOutcome::Added,
        };

        self.need_to_cancel.lock().await.remove(&task.id);
        self.persist(&task).await;
        info!(
            "任务 {} (运行实例 {}) 进入 preparing 队列",
            task.id, task.trigger.run_id
        );
        self.queue(Stage::Preparing).write().await.push_back(task);
        outcome
    }

    /// 标记取消，未结束的任务状态置为 CANCELING，由下一次 tick 执行取消
    pub async fn request_cancel(&self, task_id: i64) -> bool {
        for stage in [Stage::Preparing, Stage::Running, Stage::Uploading] {
            let mut queue = self.queue(stage).write().await;
            if let Some(task) = queue.iter_mut().find(|t| t.id == task_id) {
                task.status = TaskStatus::Canceling;
                let task = task.clone();
                drop(queue);
                self.need_to_cancel.lock().await.insert(task_id);
                self.persist(&task).await;
                info!("任务 {} 标记为待取消", task_id);
                return true;
            }
        }
        debug!("任务 {} 不在执行中，忽略取消请求", task_id);
        false
    }

    pub async fn should_cancel(&self, task: &AgentTask) -> bool {
        task.status == TaskStatus::Canceling || self.need_to_cancel.lock().await.contains(&task.id)
    }

    pub async fn clear_cancel(&self, task_id: i64) {
        self.need_to_cancel.lock().await.remove(&task_id);
    }

    pub async fn peek(&self, stage: Stage) -> Option<AgentTask> {
        self.queue(stage).read().await.front().cloned()
    }

    pub async fn snapshot(&self, stage: Stage) -> Vec<AgentTask> {
        self.queue(stage).read().await.iter().cloned().collect()
    }

    pub async fn len(&self, stage: Stage) -> usize {
        self.queue(stage).read().await.len()
    }

    /// 替换阶段内的任务，任务已不在该阶段时返回 `false`
    pub async fn update(&self, stage: Stage, task: AgentTask) -> bool {
        let mut queue = self.queue(stage).write().await;
        let Some(slot) = queue.iter_mut().find(|t| t.id == task.id) else {
            return false;
        };
        *slot = task.clone();
        drop(queue);
        self.persist(&task).await;
        true
    }

    /// 把任务从 `from` 移到 `to` 的队尾
    ///
    /// 任务已被其他执行者移走时返回 `false`，不做任何修改。
    pub async fn transfer(&self, task: AgentTask, from: Stage, to: Stage) -> bool {
        if from == to {
            return self.update(from, task).await;
        }

        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let mut first_queue = self.queue(first).write().await;
        let mut second_queue = self.queue(second).write().await;
        let (source, target) = if from < to {
            (&mut *first_queue, &mut *second_queue)
        } else {
            (&mut *second_queue, &mut *first_queue)
        };

        let Some(pos) = source.iter().position(|t| t.id == task.id) else {
            return false;
        };
        source.remove(pos);
        target.push_back(task.clone());
        drop(first_queue);
        drop(second_queue);

        StructuredLogger::log_task_moved(task.id, from.as_str(), to.as_str());
        self.persist(&task).await;
        true
    }

    /// 所有未归档任务的快照，用于上报
    pub async fn report_snapshot(&self) -> Vec<TaskSnapshot> {
        let mut snapshots = Vec::new();
        for stage in Stage::ALL {
            if stage == Stage::Archived {
                continue;
            }
            let queue = self.queue(stage).read().await;
            snapshots.extend(queue.iter().map(AgentTask::snapshot));
        }
        snapshots
    }

    /// 归档在上报快照中已处于终态的任务，按任务与运行实例一起匹配
    pub async fn archive_reported(&self, reported: &[TaskSnapshot]) -> usize {
        let final_runs: HashSet<(i64, i64)> = reported
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    TaskStatus::Finished | TaskStatus::Canceled | TaskStatus::Error
                )
            })
            .map(|s| (s.id, s.run_id))
            .collect();
        if final_runs.is_empty() {
            return 0;
        }

        let mut archived = 0;
        for stage in Stage::ALL.into_iter().filter(Stage::is_terminal) {
            for mut task in self.snapshot(stage).await {
                if !final_runs.contains(&(task.id, task.trigger.run_id)) {
                    continue;
                }
                task.archived = true;
                if self.transfer(task, stage, Stage::Archived).await {
                    archived += 1;
                }
            }
        }
        archived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileTaskStore;
    use crate::task::tests::trigger;
    use evalflow_domain::DeviceRequest;

    fn pool(dir: &tempfile::TempDir) -> TaskPool {
        TaskPool::new(Arc::new(FileTaskStore::new(dir.path())))
    }

    #[tokio::test]
    async fn test_add_keeps_fifo_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        assert_eq!(pool.add(trigger(1, DeviceRequest::new(1, 0))).await, AddOutcome::Added);
        assert_eq!(pool.add(trigger(2, DeviceRequest::new(1, 0))).await, AddOutcome::Added);
        assert_eq!(pool.add(trigger(1, DeviceRequest::new(1, 0))).await, AddOutcome::Duplicate);

        let preparing = pool.snapshot(Stage::Preparing).await;
        assert_eq!(preparing.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(pool.peek(Stage::Preparing).await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_transfer_moves_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        pool.add(trigger(1, DeviceRequest::new(1, 0))).await;
        let mut task = pool.peek(Stage::Preparing).await.unwrap();
        task.status = TaskStatus::Running;

        assert!(pool.transfer(task.clone(), Stage::Preparing, Stage::Running).await);
        assert!(!pool.transfer(task, Stage::Preparing, Stage::Running).await);
        assert_eq!(pool.len(Stage::Preparing).await, 0);
        assert_eq!(pool.len(Stage::Running).await, 1);
    }

    #[tokio::test]
    async fn test_archive_only_tasks_final_in_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        pool.add(trigger(1, DeviceRequest::new(1, 0))).await;
        pool.add(trigger(2, DeviceRequest::new(1, 0))).await;

        let mut first = pool.snapshot(Stage::Preparing).await.remove(0);
        first.status = TaskStatus::Finished;
        pool.transfer(first, Stage::Preparing, Stage::Finished).await;
        let reported = pool.report_snapshot().await;

        // 快照之后才结束的任务留到下一次上报
        let mut second = pool.peek(Stage::Preparing).await.unwrap();
        second.status = TaskStatus::Error;
        pool.transfer(second, Stage::Preparing, Stage::Error).await;

        assert_eq!(pool.archive_reported(&reported).await, 1);
        assert_eq!(pool.len(Stage::Archived).await, 1);
        assert_eq!(pool.len(Stage::Error).await, 1);
        let ids: Vec<i64> = pool.report_snapshot().await.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2]);
    }

    fn retried(task_id: i64, run_id: i64) -> TaskTrigger {
        let mut trigger = trigger(task_id, DeviceRequest::new(1, 0));
        trigger.run_id = run_id;
        trigger
    }

    #[tokio::test]
    async fn test_readd_archived_task_counts_retry() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        pool.add(trigger(4, DeviceRequest::new(1, 0))).await;
        let mut task = pool.peek(Stage::Preparing).await.unwrap();
        task.status = TaskStatus::Error;
        pool.transfer(task, Stage::Preparing, Stage::Error).await;
        let reported = pool.report_snapshot().await;
        pool.archive_reported(&reported).await;

        // 同一运行实例不会被再次执行
        assert_eq!(pool.add(trigger(4, DeviceRequest::new(1, 0))).await, AddOutcome::Duplicate);
        assert_eq!(pool.add(retried(4, 41)).await, AddOutcome::Readded);
        let task = pool.peek(Stage::Preparing).await.unwrap();
        assert_eq!(task.retry_num, 1);
        assert_eq!(task.trigger.run_id, 41);
        assert_eq!(pool.len(Stage::Archived).await, 0);
    }

    #[tokio::test]
    async fn test_new_run_replaces_unarchived_final_task() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        pool.add(trigger(6, DeviceRequest::new(1, 0))).await;
        let mut task = pool.peek(Stage::Preparing).await.unwrap();
        task.status = TaskStatus::Error;
        pool.transfer(task, Stage::Preparing, Stage::Error).await;
        let stale = pool.report_snapshot().await;

        assert_eq!(pool.add(retried(6, 61)).await, AddOutcome::Readded);
        assert_eq!(pool.len(Stage::Error).await, 0);

        // 旧运行实例的快照不会归档新的运行实例
        assert_eq!(pool.archive_reported(&stale).await, 0);
        let snapshots = pool.report_snapshot().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!((snapshots[0].run_id, snapshots[0].status), (61, TaskStatus::Preparing));
    }

    #[tokio::test]
    async fn test_new_run_ignored_while_old_run_active() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        pool.add(trigger(7, DeviceRequest::new(1, 0))).await;
        assert_eq!(pool.add(retried(7, 71)).await, AddOutcome::Duplicate);
        assert_eq!(pool.peek(Stage::Preparing).await.unwrap().trigger.run_id, 70);
    }

    #[tokio::test]
    async fn test_request_cancel_marks_canceling() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        pool.add(trigger(5, DeviceRequest::new(1, 0))).await;
        assert!(pool.request_cancel(5).await);
        assert!(!pool.request_cancel(6).await);

        let task = pool.peek(Stage::Preparing).await.unwrap();
        assert_eq!(task.status, TaskStatus::Canceling);
        assert!(pool.should_cancel(&task).await);
    }

    #[tokio::test]
    async fn test_restore_places_tasks_by_status() {
        let dir = tempfile::tempdir().unwrap();
        {
            let pool = pool(&dir);
            pool.add(trigger(1, DeviceRequest::new(1, 0))).await;
            pool.add(trigger(2, DeviceRequest::new(1, 0))).await;
            let mut task = pool.peek(Stage::Preparing).await.unwrap();
            task.status = TaskStatus::Running;
            task.container_id = Some("c-1".to_string());
            pool.transfer(task, Stage::Preparing, Stage::Running).await;
        }

        let restored = pool(&dir);
        let tasks = restored.restore().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(restored.len(Stage::Running).await, 1);
        assert_eq!(restored.len(Stage::Preparing).await, 1);
    }
}
