use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use evalflow_domain::{
    AgentReportRequest, AgentReportResponse, ResponseCode, SchedulerError, SchedulerResult,
    TaskTrigger,
};

/// 向控制器发送周期上报
#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn report(&self, request: &AgentReportRequest) -> SchedulerResult<AgentReportResponse>;
}

/// 先按原始 JSON 接收待运行任务，逐个解析
#[derive(Debug, Deserialize)]
struct RawReportResponse {
    code: ResponseCode,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    tasks_to_run: Vec<serde_json::Value>,
    #[serde(default)]
    task_ids_to_cancel: Vec<i64>,
}

impl RawReportResponse {
    fn into_response(self) -> AgentReportResponse {
        let mut tasks_to_run = Vec::with_capacity(self.tasks_to_run.len());
        for raw in self.tasks_to_run {
            match serde_json::from_value::<TaskTrigger>(raw) {
                Ok(trigger) => match trigger.validate() {
                    Ok(()) => tasks_to_run.push(trigger),
                    Err(e) => warn!("跳过无效的任务下发 {}: {}", trigger.task_id, e),
                },
                Err(e) => warn!("跳过无法解析的任务下发: {}", e),
            }
        }
        AgentReportResponse {
            code: self.code,
            message: self.message,
            tasks_to_run,
            task_ids_to_cancel: self.task_ids_to_cancel,
        }
    }
}

pub struct HttpControllerClient {
    report_url: String,
    http_client: reqwest::Client,
}

impl HttpControllerClient {
    pub fn new(controller_url: &str, timeout: Duration) -> SchedulerResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedulerError::Network(format!("创建 HTTP 客户端失败: {e}")))?;
        Ok(Self {
            report_url: format!("{}/api/v1/agent/report", controller_url.trim_end_matches('/')),
            http_client,
        })
    }
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn report(&self, request: &AgentReportRequest) -> SchedulerResult<AgentReportResponse> {
        let response = self
            .http_client
            .post(&self.report_url)
            .json(request)
            .send()
            .await
            .map_err(|e| SchedulerError::Network(format!("上报控制器失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::Network(format!(
                "控制器返回 HTTP {status}: {body}"
            )));
        }

        let raw: RawReportResponse = response
            .json()
            .await
            .map_err(|e| SchedulerError::Network(format!("解析控制器响应失败: {e}")))?;
        if raw.code != ResponseCode::Success {
            return Err(SchedulerError::Network(format!(
                "控制器拒绝上报: {}",
                raw.message.unwrap_or_default()
            )));
        }

        let response = raw.into_response();
        debug!(
            "上报完成，下发 {} 个任务，取消 {} 个任务",
            response.tasks_to_run.len(),
            response.task_ids_to_cancel.len()
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use evalflow_domain::NodeInfo;
    use serde_json::json;

    async fn serve(body: serde_json::Value) -> String {
        let app = Router::new().route(
            "/api/v1/agent/report",
            post(move || {
                let body = body.clone();
                async move { Json(body) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request() -> AgentReportRequest {
        AgentReportRequest {
            node: NodeInfo {
                serial_number: "agent-1".to_string(),
                host_address: "127.0.0.1".to_string(),
                memory_mb: 1024,
                devices: vec![],
            },
            tasks: vec![],
        }
    }

    #[tokio::test]
    async fn test_malformed_trigger_is_skipped() {
        let url = serve(json!({
            "code": "SUCCESS",
            "tasks_to_run": [
                {
                    "task_id": 1,
                    "image": "eval:1",
                    "devices": { "cpu_num": 1, "gpu_num": 0 },
                    "result_root_path": "/results/1"
                },
                { "task_id": "not-a-number" },
                {
                    "task_id": 3,
                    "image": "",
                    "devices": { "cpu_num": 1, "gpu_num": 0 },
                    "result_root_path": "/results/3"
                }
            ],
            "task_ids_to_cancel": [7]
        }))
        .await;

        let client = HttpControllerClient::new(&url, Duration::from_secs(5)).unwrap();
        let response = client.report(&request()).await.unwrap();
        assert_eq!(response.tasks_to_run.len(), 1);
        assert_eq!(response.tasks_to_run[0].task_id, 1);
        assert_eq!(response.task_ids_to_cancel, vec![7]);
    }

    #[tokio::test]
    async fn test_failure_code_is_network_error() {
        let url = serve(json!({ "code": "FAILURE", "message": "unknown agent" })).await;
        let client = HttpControllerClient::new(&url, Duration::from_secs(5)).unwrap();
        let err = client.report(&request()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Network(_)));
        assert!(err.is_retryable());
    }
}
