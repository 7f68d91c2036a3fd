//! 控制器依赖的外部协作方接口

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entities::{Job, ReportedRun, Run, Step, Task};
use evalflow_core::SchedulerResult;

/// 容器规格：镜像、启动命令与环境变量
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpecification {
    pub image: String,
    pub cmd: Vec<String>,
    pub envs: BTreeMap<String, String>,
}

#[async_trait]
pub trait ContainerSpecificationFinder: Send + Sync {
    async fn find_cs(&self, task: &Task) -> SchedulerResult<ContainerSpecification>;
}

/// 结果与日志目录分配
pub trait StoragePathAllocator: Send + Sync {
    fn task_result_path(&self, job: &Job, step: &Step, task_index: u32) -> String;
    fn run_log_dir(&self, task: &Task, attempt: u32) -> String;
}

/// 交互式执行的输出
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// 运行实例的实际执行载体（本地进程、容器、Agent）
///
/// `run` 不阻塞等待执行结束，执行器负责最终通过 `receiver` 上报终态。
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn run(&self, run: &Run, receiver: Arc<dyn RunReportReceiver>) -> SchedulerResult<()>;
    async fn stop(&self, run: &Run) -> SchedulerResult<()>;
    async fn exec(&self, run: &Run, command: &[String]) -> SchedulerResult<ExecOutput>;
}

/// 一次上报的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// 运行实例不存在，上报被丢弃
    UnknownRun,
    /// 所有字段与已持久化的值相同，未写入
    Unchanged,
    Applied {
        status_changed: bool,
        /// 上报中的状态因非法转换被拒绝，其余字段仍已应用
        status_rejected: bool,
    },
}

#[async_trait]
pub trait RunReportReceiver: Send + Sync {
    async fn receive(&self, report: ReportedRun) -> SchedulerResult<ReceiveOutcome>;
}

/// 运行实例持久化后的通知
#[async_trait]
pub trait RunUpdateListener: Send + Sync {
    async fn on_run_updated(&self, run: &Run) -> SchedulerResult<()>;
}
