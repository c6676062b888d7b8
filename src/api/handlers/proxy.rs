//! Proxy management handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::api::server::AppState;
use crate::error::PoolError;
use crate::models::{
    BulkDeleteRequest, BulkImportRequest, CreateProxyRequest, ProxyListParams, UpdateProxyRequest,
};

/// List proxies with filters and pagination
pub async fn list_proxies(
    State(state): State<AppState>,
    Query(params): Query<ProxyListParams>,
) -> Result<impl IntoResponse, PoolError> {
    let response = state.pool.list_proxies(&params).await?;
    Ok(Json(response))
}

pub async fn get_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, PoolError> {
    let proxy = state.pool.get_proxy(&id).await?;
    Ok(Json(proxy))
}

/// Create a proxy from a `host:port:username:password` line
pub async fn create_proxy(
    State(state): State<AppState>,
    Json(req): Json<CreateProxyRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let proxy = state.pool.create_proxy(req).await?;
    Ok((StatusCode::CREATED, Json(proxy)))
}

pub async fn update_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProxyRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let proxy = state.pool.update_proxy(&id, req).await?;
    Ok(Json(proxy))
}

pub async fn delete_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, PoolError> {
    state.pool.delete_proxy(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Bulk import proxies, optionally replacing the whole pool
pub async fn bulk_import(
    State(state): State<AppState>,
    Json(req): Json<BulkImportRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let result = state.pool.bulk_import(req).await?;
    Ok(Json(result))
}

pub async fn bulk_delete(
    State(state): State<AppState>,
    Json(req): Json<BulkDeleteRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let result = state.pool.bulk_delete(&req.ids).await?;
    Ok(Json(result))
}
