use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use evalflow_domain::{Device, StatusMachine, TaskSnapshot, TaskStatus, TaskTrigger};

/// Agent 本地维护的任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTask {
    pub id: i64,
    pub status: TaskStatus,
    /// 同一任务在本节点上被重新下发的次数
    pub retry_num: u32,
    pub trigger: TaskTrigger,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub container_id: Option<String>,
    pub ip: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

impl AgentTask {
    pub fn from_trigger(trigger: TaskTrigger) -> Self {
        Self {
            id: trigger.task_id,
            status: TaskStatus::Preparing,
            retry_num: 0,
            trigger,
            devices: Vec::new(),
            container_id: None,
            ip: None,
            start_time: None,
            stop_time: None,
            failed_reason: None,
            archived: false,
        }
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            run_id: self.trigger.run_id,
            status: self.status,
            retry_num: self.retry_num,
            ip: self.ip.clone(),
            start_time: self.start_time,
            stop_time: self.stop_time,
            failed_reason: self.failed_reason.clone(),
        }
    }
}

/// 任务池中的阶段，顺序即加锁顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Preparing,
    Running,
    Uploading,
    Finished,
    Error,
    Canceled,
    Archived,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Preparing,
        Stage::Running,
        Stage::Uploading,
        Stage::Finished,
        Stage::Error,
        Stage::Canceled,
        Stage::Archived,
    ];

    /// 恢复时按任务状态决定所在阶段，CANCELING 回到取消前的阶段
    pub fn for_task(task: &AgentTask) -> Stage {
        if task.archived {
            return Stage::Archived;
        }
        match task.status {
            TaskStatus::Created | TaskStatus::Preparing => Stage::Preparing,
            TaskStatus::Running => Stage::Running,
            TaskStatus::Uploading => Stage::Uploading,
            TaskStatus::Canceling if task.container_id.is_some() => Stage::Running,
            TaskStatus::Canceling => Stage::Preparing,
            TaskStatus::Finished => Stage::Finished,
            TaskStatus::Error => Stage::Error,
            TaskStatus::Canceled => Stage::Canceled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preparing => "preparing",
            Stage::Running => "running",
            Stage::Uploading => "uploading",
            Stage::Finished => "finished",
            Stage::Error => "error",
            Stage::Canceled => "canceled",
            Stage::Archived => "archived",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Finished | Stage::Error | Stage::Canceled)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use evalflow_domain::DeviceRequest;
    use std::collections::BTreeMap;

    pub fn trigger(task_id: i64, devices: DeviceRequest) -> TaskTrigger {
        TaskTrigger {
            task_id,
            run_id: task_id * 10,
            image: "registry.local/eval:1.0".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()],
            envs: BTreeMap::new(),
            devices,
            dataset_uris: vec![],
            model_uri: None,
            result_root_path: format!("/tmp/evalflow-test/{task_id}"),
        }
    }

    #[test]
    fn test_stage_for_restored_task() {
        let mut task = AgentTask::from_trigger(trigger(1, DeviceRequest::new(1, 0)));
        assert_eq!(Stage::for_task(&task), Stage::Preparing);

        task.status = TaskStatus::Canceling;
        assert_eq!(Stage::for_task(&task), Stage::Preparing);
        task.container_id = Some("c-1".to_string());
        assert_eq!(Stage::for_task(&task), Stage::Running);

        task.status = TaskStatus::Finished;
        task.archived = true;
        assert_eq!(Stage::for_task(&task), Stage::Archived);
    }

    #[test]
    fn test_snapshot_carries_report_fields() {
        let mut task = AgentTask::from_trigger(trigger(3, DeviceRequest::new(0, 1)));
        task.status = TaskStatus::Error;
        task.failed_reason = Some("exit code 137".to_string());
        let snapshot = task.snapshot();
        assert_eq!(snapshot.id, 3);
        assert_eq!(snapshot.run_id, 30);
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert_eq!(snapshot.failed_reason.as_deref(), Some("exit code 137"));
    }
}
