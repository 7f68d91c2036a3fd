//! 内存仓储实现
//!
//! 每张表一个 [`Table`]：数据由读写锁保护，另有按主键划分的行锁表，
//! `lock_for_update` 返回的 [`RowLock`] 持有期间同一主键的加锁请求排队等待，
//! 不同主键互不影响。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use evalflow_domain::{
    Job, JobRepository, RowLock, Run, RunRepository, SchedulerResult, Step, StepRepository, Task,
    TaskRepository,
};

trait Row: Clone + Send + Sync + 'static {
    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
}

macro_rules! impl_row {
    ($($ty:ty),*) => {
        $(
            impl Row for $ty {
                fn id(&self) -> i64 {
                    self.id
                }

                fn set_id(&mut self, id: i64) {
                    self.id = id;
                }
            }
        )*
    };
}

impl_row!(Task, Run, Step, Job);

struct Table<T> {
    rows: RwLock<BTreeMap<i64, T>>,
    row_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    next_id: AtomicI64,
    writes: AtomicUsize,
}

impl<T: Row> Table<T> {
    fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            row_locks: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            writes: AtomicUsize::new(0),
        }
    }

    async fn insert(&self, row: &T) -> T {
        let mut row = row.clone();
        row.set_id(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.rows.write().await.insert(row.id(), row.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        row
    }

    async fn get(&self, id: i64) -> Option<T> {
        self.rows.read().await.get(&id).cloned()
    }

    async fn filter(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.rows
            .read()
            .await
            .values()
            .filter(|row| predicate(row))
            .cloned()
            .collect()
    }

    /// 行不存在时返回 false，不做插入
    async fn update(&self, row: &T) -> bool {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&row.id()) {
            Some(existing) => {
                *existing = row.clone();
                self.writes.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    async fn remove(&self, id: i64) -> bool {
        let removed = self.rows.write().await.remove(&id).is_some();
        if removed {
            self.row_locks.lock().await.remove(&id);
        }
        removed
    }

    async fn lock_for_update(&self, id: i64) -> Option<RowLock<T>> {
        let lock = {
            let mut locks = self.row_locks.lock().await;
            // 不存在的主键不留下锁条目
            if !self.rows.read().await.contains_key(&id) {
                return None;
            }
            locks.entry(id).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        // 加锁后再读取，保证看到前一个持锁者写入的结果
        let row = self.get(id).await?;
        Some(RowLock::new(row, guard))
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

macro_rules! not_found_on_update {
    ($updated:expr, $err:expr) => {
        if $updated {
            Ok(())
        } else {
            Err($err)
        }
    };
}

pub struct InMemoryTaskRepository {
    table: Table<Task>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self {
            table: Table::new(),
        }
    }

    /// 累计写入次数（插入与更新）
    pub fn write_count(&self) -> usize {
        self.table.writes()
    }
}

impl Default for InMemoryTaskRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        Ok(self.table.insert(task).await)
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Task>> {
        Ok(self.table.get(id).await)
    }

    async fn find_by_step_id(&self, step_id: i64) -> SchedulerResult<Vec<Task>> {
        let mut tasks = self.table.filter(|task| task.step_id == step_id).await;
        tasks.sort_by_key(|task| task.index);
        Ok(tasks)
    }

    async fn update(&self, task: &Task) -> SchedulerResult<()> {
        not_found_on_update!(
            self.table.update(task).await,
            evalflow_domain::SchedulerError::TaskNotFound { id: task.id }
        )
    }

    async fn load_active_tasks(&self) -> SchedulerResult<Vec<Task>> {
        Ok(self.table.filter(|task| !task.is_final()).await)
    }

    async fn lock_for_update(&self, id: i64) -> SchedulerResult<Option<RowLock<Task>>> {
        Ok(self.table.lock_for_update(id).await)
    }
}

pub struct InMemoryRunRepository {
    table: Table<Run>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self {
            table: Table::new(),
        }
    }

    pub fn write_count(&self) -> usize {
        self.table.writes()
    }
}

impl Default for InMemoryRunRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn create(&self, run: &Run) -> SchedulerResult<Run> {
        Ok(self.table.insert(run).await)
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Run>> {
        Ok(self.table.get(id).await)
    }

    async fn find_by_task_id(&self, task_id: i64) -> SchedulerResult<Vec<Run>> {
        Ok(self.table.filter(|run| run.task_id == task_id).await)
    }

    async fn update(&self, run: &Run) -> SchedulerResult<()> {
        not_found_on_update!(
            self.table.update(run).await,
            evalflow_domain::SchedulerError::RunNotFound { id: run.id }
        )
    }

    async fn delete(&self, id: i64) -> SchedulerResult<bool> {
        Ok(self.table.remove(id).await)
    }

    async fn lock_for_update(&self, id: i64) -> SchedulerResult<Option<RowLock<Run>>> {
        Ok(self.table.lock_for_update(id).await)
    }
}

pub struct InMemoryStepRepository {
    table: Table<Step>,
}

impl InMemoryStepRepository {
    pub fn new() -> Self {
        Self {
            table: Table::new(),
        }
    }
}

impl Default for InMemoryStepRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepRepository for InMemoryStepRepository {
    async fn create(&self, step: &Step) -> SchedulerResult<Step> {
        Ok(self.table.insert(step).await)
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Step>> {
        Ok(self.table.get(id).await)
    }

    async fn find_by_job_id(&self, job_id: i64) -> SchedulerResult<Vec<Step>> {
        let mut steps = self.table.filter(|step| step.job_id == job_id).await;
        steps.sort_by_key(|step| step.index);
        Ok(steps)
    }

    async fn update(&self, step: &Step) -> SchedulerResult<()> {
        not_found_on_update!(
            self.table.update(step).await,
            evalflow_domain::SchedulerError::StepNotFound { id: step.id }
        )
    }

    async fn lock_for_update(&self, id: i64) -> SchedulerResult<Option<RowLock<Step>>> {
        Ok(self.table.lock_for_update(id).await)
    }
}

pub struct InMemoryJobRepository {
    table: Table<Job>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self {
            table: Table::new(),
        }
    }
}

impl Default for InMemoryJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, job: &Job) -> SchedulerResult<Job> {
        Ok(self.table.insert(job).await)
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Job>> {
        Ok(self.table.get(id).await)
    }

    async fn update(&self, job: &Job) -> SchedulerResult<()> {
        not_found_on_update!(
            self.table.update(job).await,
            evalflow_domain::SchedulerError::JobNotFound { id: job.id }
        )
    }

    async fn lock_for_update(&self, id: i64) -> SchedulerResult<Option<RowLock<Job>>> {
        Ok(self.table.lock_for_update(id).await)
    }
}
