use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status_machine::StatusMachine;
use crate::value_objects::{DeviceClass, RuntimeResource};

/// 任务状态
///
/// 控制器与 Agent 共用同一套任务状态，Agent 的各个阶段集合与其一一对应。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Preparing,
    Running,
    Uploading,
    Canceling,
    Finished,
    Canceled,
    Error,
}

/// 作业中的最小调度单元，每次执行对应一个 [`Run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub uuid: Uuid,
    pub job_id: i64,
    pub step_id: i64,
    /// 在所属步骤中的序号，从 0 开始
    pub index: u32,
    pub status: TaskStatus,
    pub retry_num: u32,
    pub result_root_path: String,
    pub resources: Vec<RuntimeResource>,
    /// 当前运行实例，终态后清空
    pub current_run: Option<i64>,
    pub ip: Option<String>,
    pub started_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        job_id: i64,
        step_id: i64,
        index: u32,
        result_root_path: String,
        resources: Vec<RuntimeResource>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 由仓储生成
            uuid: Uuid::new_v4(),
            job_id,
            step_id,
            index,
            status: TaskStatus::Created,
            retry_num: 0,
            result_root_path,
            resources,
            current_run: None,
            ip: None,
            started_time: None,
            finished_time: None,
            failed_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    pub fn has_active_run(&self) -> bool {
        self.current_run.is_some()
    }

    /// 上一次运行实例失败后等待重试
    ///
    /// 等待期间任务保持失败前的状态，没有当前运行实例。
    pub fn is_awaiting_retry(&self) -> bool {
        self.retry_num > 0
            && self.current_run.is_none()
            && matches!(
                self.status,
                TaskStatus::Preparing | TaskStatus::Running | TaskStatus::Uploading
            )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Created,
    Running,
    Success,
    Failed,
    Canceled,
}

/// 作业中的一个阶段，同一步骤的任务共享资源池与资源请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub job_id: i64,
    /// 在作业中的顺序，从 0 开始
    pub index: u32,
    pub name: String,
    pub status: StepStatus,
    pub resource_pool: String,
    pub resources: Vec<RuntimeResource>,
    pub task_num: u32,
    /// 同时处于活跃状态的任务上限
    pub concurrency: u32,
    pub started_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
}

impl Step {
    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Split,
    Scheduling,
    Scheduled,
    ToCancel,
    Finished,
    Canceled,
    ExitError,
}

/// 作业运行时：镜像与设备需求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRuntime {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    pub device_class: DeviceClass,
    pub device_amount: usize,
    #[serde(default)]
    pub dataset_uris: Vec<String>,
    #[serde(default)]
    pub model_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub runtime: JobRuntime,
    pub created_at: DateTime<Utc>,
    pub finished_time: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(name: String, runtime: JobRuntime) -> Self {
        Self {
            id: 0,
            uuid: Uuid::new_v4(),
            name,
            status: JobStatus::Created,
            runtime,
            created_at: Utc::now(),
            finished_time: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Finished,
    Failed,
    Canceled,
}

/// 一次运行的容器规格
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSpec {
    pub image: String,
    pub command: Vec<String>,
    pub envs: BTreeMap<String, String>,
    pub resource_pool: String,
    pub requested_resources: Vec<RuntimeResource>,
}

/// 任务的一次执行尝试
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub task_id: i64,
    pub status: RunStatus,
    pub log_dir: String,
    pub run_spec: RunSpec,
    pub ip: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(task_id: i64, log_dir: String, run_spec: RunSpec) -> Self {
        Self {
            id: 0,
            task_id,
            status: RunStatus::Pending,
            log_dir,
            run_spec,
            ip: None,
            start_time: None,
            finish_time: None,
            failed_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

/// 执行器上报的运行观测值，所有字段都是可选的部分更新
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportedRun {
    pub id: i64,
    pub status: Option<RunStatus>,
    pub ip: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

impl ReportedRun {
    pub fn status(id: i64, status: RunStatus) -> Self {
        Self {
            id,
            status: Some(status),
            ip: None,
            start_time: None,
            finish_time: None,
            failed_reason: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_start_time(mut self, time: DateTime<Utc>) -> Self {
        self.start_time = Some(time);
        self
    }

    pub fn with_finish_time(mut self, time: DateTime<Utc>) -> Self {
        self.finish_time = Some(time);
        self
    }

    pub fn with_failed_reason(mut self, reason: impl Into<String>) -> Self {
        self.failed_reason = Some(reason.into());
        self
    }
}
