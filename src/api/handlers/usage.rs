//! Worker-facing handlers: selection, usage slots, assignments and outcomes

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;

use crate::api::server::AppState;
use crate::error::PoolError;
use crate::models::{AssignRequest, FailureReport, SuccessReport, TaskContext};

/// Ranked candidates for a task; an empty list means nothing is free
pub async fn select_candidates(
    State(state): State<AppState>,
    Json(ctx): Json<TaskContext>,
) -> Result<impl IntoResponse, PoolError> {
    let candidates = state.pool.select_candidates(&ctx).await?;
    Ok(Json(candidates))
}

pub async fn acquire(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, PoolError> {
    let proxy = state.pool.acquire(&id).await?;
    Ok(Json(proxy))
}

pub async fn release(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, PoolError> {
    let proxy = state.pool.release(&id).await?;
    Ok(Json(proxy))
}

pub async fn assign(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AssignRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let proxy = state.pool.assign(&id, &req.task_id).await?;
    Ok(Json(proxy))
}

pub async fn unassign(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, PoolError> {
    let proxy = state.pool.unassign(&id, &task_id).await?;
    Ok(Json(proxy))
}

pub async fn record_success(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<SuccessReport>,
) -> Result<impl IntoResponse, PoolError> {
    let proxy = state
        .pool
        .record_success(&id, report.response_time_ms)
        .await?;
    Ok(Json(proxy))
}

pub async fn record_failure(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<FailureReport>,
) -> Result<impl IntoResponse, PoolError> {
    let proxy = state.pool.record_failure(&id, report).await?;
    Ok(Json(proxy))
}

/// Probe the proxy now; a failed probe is still a 200 with `success: false`
pub async fn test_connectivity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, PoolError> {
    let result = state.pool.test_connectivity(&id).await?;
    Ok(Json(result))
}
