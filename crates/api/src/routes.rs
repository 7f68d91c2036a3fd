use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use evalflow_controller::{AgentReportService, ControllerServices, JobService};
use evalflow_domain::RunReportReceiver;

use crate::handlers::{
    health::health_check,
    jobs::{cancel_job, create_job, get_job},
    reports::{agent_report, run_report},
};
use crate::middleware::{cors_layer, request_logging, trace_layer};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub job_service: Arc<JobService>,
    pub run_reports: Arc<dyn RunReportReceiver>,
    /// 仅在使用 agent 执行器时存在
    pub agent_reports: Option<Arc<AgentReportService>>,
}

impl AppState {
    pub fn from_services(services: &ControllerServices) -> Self {
        Self {
            job_service: services.job_service.clone(),
            run_reports: services.receiver.clone(),
            agent_reports: services.agent_reports.clone(),
        }
    }
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/agent/report", post(agent_report))
        .route("/api/v1/runs/report", post(run_report))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/{id}", get(get_job))
        .route("/api/v1/jobs/{id}/cancel", post(cancel_job))
        .layer(axum::middleware::from_fn(request_logging))
        .layer(trace_layer())
        .layer(cors_layer())
        .with_state(state)
}
