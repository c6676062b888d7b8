//! Health and statistics endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::api::server::AppState;
use crate::error::PoolError;

/// Liveness, including a round trip to the proxy store
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_secs = state.started_at.elapsed().as_secs();

    match state.pool.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "proxy-pool",
                "uptime_secs": uptime_secs
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Store health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "proxy-pool",
                    "uptime_secs": uptime_secs,
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Pool-wide statistics
pub async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, PoolError> {
    let stats = state.pool.stats().await?;
    Ok(Json(stats))
}
