//! # 状态机
//!
//! 任务、运行实例、步骤、作业的合法状态转换与终态定义，以及由下而上的状态聚合：
//! 步骤状态由其任务状态推导，作业状态由其步骤状态推导。
//!
//! 所有函数都是纯函数。非法转换返回 `None`（或 [`SchedulerError::IllegalTransition`]），
//! 由调用方记录日志并丢弃，从而容忍重复或乱序的上报。

use std::fmt::Debug;

use evalflow_core::{SchedulerError, SchedulerResult};

use crate::entities::{JobStatus, RunStatus, StepStatus, Task, TaskStatus};

pub trait StatusMachine: Copy + Eq + Debug {
    const ENTITY: &'static str;

    fn is_final(self) -> bool;

    /// 是否存在 `self -> target` 的合法转换（不包含自身到自身）
    fn can_transfer_to(self, target: Self) -> bool;

    /// 相同状态视为无变化，返回 `None`
    fn next(self, target: Self) -> Option<Self> {
        if self != target && self.can_transfer_to(target) {
            Some(target)
        } else {
            None
        }
    }

    fn transfer(self, target: Self) -> SchedulerResult<Self> {
        self.next(target)
            .ok_or_else(|| SchedulerError::illegal_transition(Self::ENTITY, self, target))
    }
}

impl StatusMachine for TaskStatus {
    const ENTITY: &'static str = "任务";

    fn is_final(self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Canceled | TaskStatus::Error
        )
    }

    fn can_transfer_to(self, target: Self) -> bool {
        use TaskStatus::*;
        match self {
            Created => matches!(target, Preparing | Running | Canceling | Canceled | Error),
            Preparing => matches!(target, Running | Finished | Canceling | Canceled | Error),
            Running => matches!(target, Uploading | Finished | Canceling | Canceled | Error),
            Uploading => matches!(target, Finished | Canceling | Canceled | Error),
            Canceling => matches!(target, Canceled | Finished | Error),
            Finished | Canceled | Error => false,
        }
    }
}

impl StatusMachine for RunStatus {
    const ENTITY: &'static str = "运行实例";

    fn is_final(self) -> bool {
        matches!(
            self,
            RunStatus::Finished | RunStatus::Failed | RunStatus::Canceled
        )
    }

    fn can_transfer_to(self, target: Self) -> bool {
        use RunStatus::*;
        match self {
            Pending => matches!(target, Running | Finished | Failed | Canceled),
            Running => matches!(target, Finished | Failed | Canceled),
            Finished | Failed | Canceled => false,
        }
    }
}

impl StatusMachine for StepStatus {
    const ENTITY: &'static str = "步骤";

    fn is_final(self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Canceled
        )
    }

    fn can_transfer_to(self, target: Self) -> bool {
        use StepStatus::*;
        match self {
            Created => matches!(target, Running | Success | Failed | Canceled),
            Running => matches!(target, Success | Failed | Canceled),
            Success | Failed | Canceled => false,
        }
    }
}

impl StatusMachine for JobStatus {
    const ENTITY: &'static str = "作业";

    fn is_final(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Canceled | JobStatus::ExitError
        )
    }

    fn can_transfer_to(self, target: Self) -> bool {
        use JobStatus::*;
        match self {
            Created => matches!(target, Split | ToCancel | Canceled | ExitError),
            Split => matches!(
                target,
                Scheduling | Scheduled | Finished | ToCancel | Canceled | ExitError
            ),
            Scheduling => matches!(target, Scheduled | Finished | ToCancel | Canceled | ExitError),
            Scheduled => matches!(target, Finished | ToCancel | Canceled | ExitError),
            ToCancel => matches!(target, Canceled | Finished | ExitError),
            Finished | Canceled | ExitError => false,
        }
    }
}

/// 步骤推导所需的任务摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSummary {
    pub status: TaskStatus,
    /// 任务的某个运行实例曾经开始执行
    pub started: bool,
}

impl TaskSummary {
    fn has_run(&self) -> bool {
        self.started
            || matches!(
                self.status,
                TaskStatus::Running | TaskStatus::Uploading | TaskStatus::Finished
            )
    }
}

impl From<TaskStatus> for TaskSummary {
    fn from(status: TaskStatus) -> Self {
        Self {
            status,
            started: false,
        }
    }
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            status: task.status,
            started: task.started_time.is_some(),
        }
    }
}

/// 由任务状态推导步骤状态，结果与任务顺序无关
///
/// - 全部终态：存在 ERROR 则 FAILED，否则存在 CANCELED 则 CANCELED，否则 SUCCESS
/// - 有任务真正执行过（到达 RUNNING 或记录了开始时间）：RUNNING
/// - 其余情况（含没有任务、只有未执行就失败或取消的任务）：CREATED
pub fn derive_step_status<I>(tasks: I) -> StepStatus
where
    I: IntoIterator,
    I::Item: Into<TaskSummary>,
{
    let mut total = 0usize;
    let mut terminal = 0usize;
    let mut has_error = false;
    let mut has_canceled = false;
    let mut has_run = false;

    for task in tasks {
        let task: TaskSummary = task.into();
        total += 1;
        match task.status {
            TaskStatus::Error => has_error = true,
            TaskStatus::Canceled => has_canceled = true,
            _ => {}
        }
        has_run |= task.has_run();
        if task.status.is_final() {
            terminal += 1;
        }
    }

    if total == 0 {
        return StepStatus::Created;
    }
    if terminal == total {
        return if has_error {
            StepStatus::Failed
        } else if has_canceled {
            StepStatus::Canceled
        } else {
            StepStatus::Success
        };
    }
    if has_run {
        StepStatus::Running
    } else {
        StepStatus::Created
    }
}

/// 作业推导所需的步骤摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSummary {
    pub status: StepStatus,
    pub task_count: usize,
}

/// 按步骤顺序推导作业状态
///
/// 全部步骤终态时按 FAILED > CANCELED > SUCCESS 的优先级得出终态；
/// 否则所有步骤都已分配任务为 SCHEDULED，尚有步骤未分配任务为 SCHEDULING。
/// 没有步骤的作业保持 CREATED。
pub fn derive_job_status(steps: &[StepSummary]) -> JobStatus {
    if steps.is_empty() {
        return JobStatus::Created;
    }

    if steps.iter().all(|step| step.status.is_final()) {
        let mut result = JobStatus::Finished;
        for step in steps {
            match step.status {
                StepStatus::Failed => return JobStatus::ExitError,
                StepStatus::Canceled => result = JobStatus::Canceled,
                _ => {}
            }
        }
        return result;
    }

    if steps.iter().all(|step| step.task_count > 0) {
        JobStatus::Scheduled
    } else {
        JobStatus::Scheduling
    }
}

/// 运行实例状态映射为任务状态
pub fn task_status_for_run(status: RunStatus) -> TaskStatus {
    match status {
        RunStatus::Pending => TaskStatus::Preparing,
        RunStatus::Running => TaskStatus::Running,
        RunStatus::Finished => TaskStatus::Finished,
        RunStatus::Failed => TaskStatus::Error,
        RunStatus::Canceled => TaskStatus::Canceled,
    }
}

/// Agent 上报的任务状态映射为运行实例状态
///
/// CANCELING 是 Agent 内部的过渡状态，不产生运行实例状态变化。
pub fn run_status_for_task(status: TaskStatus) -> Option<RunStatus> {
    match status {
        TaskStatus::Created | TaskStatus::Preparing => Some(RunStatus::Pending),
        TaskStatus::Running | TaskStatus::Uploading => Some(RunStatus::Running),
        TaskStatus::Canceling => None,
        TaskStatus::Finished => Some(RunStatus::Finished),
        TaskStatus::Canceled => Some(RunStatus::Canceled),
        TaskStatus::Error => Some(RunStatus::Failed),
    }
}
