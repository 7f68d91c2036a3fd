use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use tracing::info;

use evalflow_controller::JobRequest;

use crate::{
    error::{ApiError, ApiResult},
    response::{created, success},
    routes::AppState,
};

/// 提交作业
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.steps.is_empty() {
        return Err(ApiError::BadRequest("作业至少需要一个步骤".to_string()));
    }
    let job = state.job_service.create_job(request).await?;
    info!("作业 {} ({}) 已提交", job.id, job.name);
    Ok(created(job))
}

/// 获取作业及其步骤、任务
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let detail = state.job_service.describe_job(id).await?;
    Ok(success(detail))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let job = state.job_service.cancel_job(id).await?;
    Ok(success(job))
}
