//! Agent 与控制器之间的周期上报协议

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::TaskStatus;
use crate::value_objects::{Device, DeviceRequest};
use evalflow_core::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub serial_number: String,
    pub host_address: String,
    pub memory_mb: u64,
    pub devices: Vec<Device>,
}

/// 单个任务在 Agent 上的状态快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub id: i64,
    /// 快照所属的运行实例，与下发时的 [`TaskTrigger::run_id`] 一致
    pub run_id: i64,
    pub status: TaskStatus,
    pub retry_num: u32,
    pub ip: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentReportRequest {
    pub node: NodeInfo,
    pub tasks: Vec<TaskSnapshot>,
}

/// 控制器下发给 Agent 的待运行任务
///
/// 同一任务每次重试都对应新的 `run_id`，Agent 上报时原样带回，
/// 控制器据此丢弃旧运行实例的快照。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskTrigger {
    pub task_id: i64,
    pub run_id: i64,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    pub devices: DeviceRequest,
    #[serde(default)]
    pub dataset_uris: Vec<String>,
    #[serde(default)]
    pub model_uri: Option<String>,
    pub result_root_path: String,
}

impl TaskTrigger {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.task_id <= 0 {
            return Err(SchedulerError::invalid_resource(format!(
                "无效的任务 id: {}",
                self.task_id
            )));
        }
        if self.run_id <= 0 {
            return Err(SchedulerError::invalid_resource(format!(
                "任务 {} 的运行实例 id 无效: {}",
                self.task_id, self.run_id
            )));
        }
        if self.image.trim().is_empty() {
            return Err(SchedulerError::invalid_resource(format!(
                "任务 {} 缺少镜像",
                self.task_id
            )));
        }
        if self.result_root_path.trim().is_empty() {
            return Err(SchedulerError::invalid_resource(format!(
                "任务 {} 缺少结果目录",
                self.task_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    #[default]
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentReportResponse {
    pub code: ResponseCode,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub tasks_to_run: Vec<TaskTrigger>,
    #[serde(default)]
    pub task_ids_to_cancel: Vec<i64>,
}

impl AgentReportResponse {
    pub fn success(tasks_to_run: Vec<TaskTrigger>, task_ids_to_cancel: Vec<i64>) -> Self {
        Self {
            code: ResponseCode::Success,
            message: None,
            tasks_to_run,
            task_ids_to_cancel,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Failure,
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger() -> TaskTrigger {
        TaskTrigger {
            task_id: 7,
            run_id: 70,
            image: "registry.local/eval:1.0".to_string(),
            command: vec!["python".to_string(), "eval.py".to_string()],
            envs: BTreeMap::new(),
            devices: DeviceRequest::new(1, 0),
            dataset_uris: vec!["s3://datasets/mmlu".to_string()],
            model_uri: None,
            result_root_path: "/results/7".to_string(),
        }
    }

    #[test]
    fn test_trigger_validation() {
        assert!(trigger().validate().is_ok());

        let mut no_image = trigger();
        no_image.image = " ".to_string();
        assert!(no_image.validate().is_err());

        let mut bad_id = trigger();
        bad_id.task_id = 0;
        assert!(bad_id.validate().is_err());

        let mut bad_run = trigger();
        bad_run.run_id = 0;
        assert!(bad_run.validate().is_err());
    }

    #[test]
    fn test_response_defaults_when_fields_missing() {
        let response: AgentReportResponse = serde_json::from_str(r#"{"code":"SUCCESS"}"#).unwrap();
        assert!(response.tasks_to_run.is_empty());
        assert!(response.task_ids_to_cancel.is_empty());
    }
}
