use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::entities::{Job, Run, Step, Task};
use evalflow_core::SchedulerResult;

/// 行锁：持有期间同一主键的其他 `lock_for_update` 调用会等待
///
/// 等价于 `SELECT ... FOR UPDATE`。锁在值被丢弃时释放，修改后需显式调用仓储的 `update`。
pub struct RowLock<T> {
    row: T,
    _guard: OwnedMutexGuard<()>,
}

impl<T> RowLock<T> {
    pub fn new(row: T, guard: OwnedMutexGuard<()>) -> Self {
        Self { row, _guard: guard }
    }
}

impl<T> Deref for RowLock<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.row
    }
}

impl<T> DerefMut for RowLock<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.row
    }
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> SchedulerResult<Task>;
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Task>>;
    async fn find_by_step_id(&self, step_id: i64) -> SchedulerResult<Vec<Task>>;
    async fn update(&self, task: &Task) -> SchedulerResult<()>;
    /// 加载所有非终态任务
    async fn load_active_tasks(&self) -> SchedulerResult<Vec<Task>>;
    async fn lock_for_update(&self, id: i64) -> SchedulerResult<Option<RowLock<Task>>>;
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create(&self, run: &Run) -> SchedulerResult<Run>;
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Run>>;
    async fn find_by_task_id(&self, task_id: i64) -> SchedulerResult<Vec<Run>>;
    async fn update(&self, run: &Run) -> SchedulerResult<()>;
    async fn delete(&self, id: i64) -> SchedulerResult<bool>;
    async fn lock_for_update(&self, id: i64) -> SchedulerResult<Option<RowLock<Run>>>;
}

#[async_trait]
pub trait StepRepository: Send + Sync {
    async fn create(&self, step: &Step) -> SchedulerResult<Step>;
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Step>>;
    /// 按 `index` 升序返回
    async fn find_by_job_id(&self, job_id: i64) -> SchedulerResult<Vec<Step>>;
    async fn update(&self, step: &Step) -> SchedulerResult<()>;
    async fn lock_for_update(&self, id: i64) -> SchedulerResult<Option<RowLock<Step>>>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, job: &Job) -> SchedulerResult<Job>;
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Job>>;
    async fn update(&self, job: &Job) -> SchedulerResult<()>;
    async fn lock_for_update(&self, id: i64) -> SchedulerResult<Option<RowLock<Job>>>;
}
