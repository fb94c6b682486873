//! Job management handlers.

use super::{AddJobRequest, AddJobResponse, ClearCompletedResponse};
use crate::Result;
use crate::api::AppState;
use crate::types::{DirectDownloadOptions, JobId, JobSnapshot};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

/// GET /jobs - List all jobs
#[utoipa::path(
    get,
    path = "/api/v1/jobs",
    tag = "jobs",
    responses(
        (status = 200, description = "All jobs ordered by id", body = Vec<JobSnapshot>)
    )
)]
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSnapshot>> {
    Json(state.manager.list_jobs().await)
}

/// GET /jobs/:id - Get single job
#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    tag = "jobs",
    params(
        ("id" = i64, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job snapshot", body = JobSnapshot),
        (status = 404, description = "Job not found", body = crate::error::ApiError)
    )
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<JobSnapshot>> {
    let snapshot = state.manager.get_job(JobId(id)).await?;
    Ok(Json(snapshot))
}

/// POST /jobs - Submit a direct download
#[utoipa::path(
    post,
    path = "/api/v1/jobs",
    tag = "jobs",
    request_body = AddJobRequest,
    responses(
        (status = 201, description = "Job created", body = AddJobResponse),
        (status = 422, description = "No usable page URLs", body = crate::error::ApiError),
        (status = 503, description = "Shutting down", body = crate::error::ApiError)
    )
)]
pub async fn add_job(
    State(state): State<AppState>,
    Json(request): Json<AddJobRequest>,
) -> Result<impl IntoResponse> {
    // The caller metadata file is a library-only option; the HTTP surface
    // never names a path that finalization deletes
    let options = DirectDownloadOptions {
        headers: request.headers,
        meta_path: None,
    };
    let id = state
        .manager
        .add_direct_download(request.urls, request.meta, options)
        .await?;

    Ok((StatusCode::CREATED, Json(AddJobResponse { id })))
}

/// POST /jobs/:id/stop - Stop a fetching job
#[utoipa::path(
    post,
    path = "/api/v1/jobs/{id}/stop",
    tag = "jobs",
    params(
        ("id" = i64, Path, description = "Job ID")
    ),
    responses(
        (status = 204, description = "Job stopped"),
        (status = 404, description = "Job not found", body = crate::error::ApiError),
        (status = 409, description = "Job cannot be stopped in its current state", body = crate::error::ApiError)
    )
)]
pub async fn stop_job(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode> {
    state.manager.stop_job(JobId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /jobs/:id/start - Restart a stopped job
#[utoipa::path(
    post,
    path = "/api/v1/jobs/{id}/start",
    tag = "jobs",
    params(
        ("id" = i64, Path, description = "Job ID")
    ),
    responses(
        (status = 204, description = "Job restarted"),
        (status = 404, description = "Job not found", body = crate::error::ApiError),
        (status = 409, description = "Job cannot be started in its current state", body = crate::error::ApiError),
        (status = 410, description = "Temp directory is gone", body = crate::error::ApiError),
        (status = 422, description = "Job has no page URLs", body = crate::error::ApiError)
    )
)]
pub async fn start_job(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode> {
    state.manager.start_job_from_stop(JobId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /jobs/:id - Remove a job
///
/// Unfinished jobs are cleaned up as if they had failed; completed jobs keep
/// their library item.
#[utoipa::path(
    delete,
    path = "/api/v1/jobs/{id}",
    tag = "jobs",
    params(
        ("id" = i64, Path, description = "Job ID")
    ),
    responses(
        (status = 204, description = "Job removed"),
        (status = 404, description = "Job not found", body = crate::error::ApiError)
    )
)]
pub async fn remove_job(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode> {
    state.manager.remove_job(JobId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /jobs/clear-completed - Drop completed jobs
#[utoipa::path(
    post,
    path = "/api/v1/jobs/clear-completed",
    tag = "jobs",
    responses(
        (status = 200, description = "Completed jobs removed", body = ClearCompletedResponse),
        (status = 500, description = "Internal server error", body = crate::error::ApiError)
    )
)]
pub async fn clear_completed(State(state): State<AppState>) -> Result<Json<ClearCompletedResponse>> {
    let removed = state.manager.clear_completed_jobs().await?;
    Ok(Json(ClearCompletedResponse { removed }))
}
