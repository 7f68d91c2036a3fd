use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use evalflow_domain::{AgentReportRequest, AgentReportResponse, ReceiveOutcome, ReportedRun};

use crate::{
    error::ApiResult,
    response::success,
    routes::AppState,
};

/// 运行上报的处理结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReportAck {
    pub outcome: String,
    pub status_changed: bool,
    pub status_rejected: bool,
}

impl From<ReceiveOutcome> for RunReportAck {
    fn from(outcome: ReceiveOutcome) -> Self {
        match outcome {
            ReceiveOutcome::UnknownRun => Self {
                outcome: "unknown_run".to_string(),
                status_changed: false,
                status_rejected: false,
            },
            ReceiveOutcome::Unchanged => Self {
                outcome: "unchanged".to_string(),
                status_changed: false,
                status_rejected: false,
            },
            ReceiveOutcome::Applied {
                status_changed,
                status_rejected,
            } => Self {
                outcome: "applied".to_string(),
                status_changed,
                status_rejected,
            },
        }
    }
}

/// Agent 周期上报，响应体直接是 [`AgentReportResponse`]
pub async fn agent_report(
    State(state): State<AppState>,
    Json(request): Json<AgentReportRequest>,
) -> Response {
    match state.agent_reports.as_ref() {
        Some(service) => Json(service.handle(request).await).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(AgentReportResponse::failure("控制器未使用 agent 执行器")),
        )
            .into_response(),
    }
}

/// 执行器上报运行实例的观测值
pub async fn run_report(
    State(state): State<AppState>,
    Json(report): Json<ReportedRun>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.run_reports.receive(report).await?;
    Ok(success(RunReportAck::from(outcome)))
}
