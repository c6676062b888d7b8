//! API route definitions

use axum::routing::{delete, get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api", api_routes())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        // Proxy management
        .route(
            "/proxies",
            get(handlers::proxy::list_proxies).post(handlers::proxy::create_proxy),
        )
        .route("/proxies/bulk-import", post(handlers::proxy::bulk_import))
        .route("/proxies/bulk-delete", post(handlers::proxy::bulk_delete))
        .route(
            "/proxies/:id",
            get(handlers::proxy::get_proxy)
                .put(handlers::proxy::update_proxy)
                .delete(handlers::proxy::delete_proxy),
        )
        // Worker-facing
        .route("/proxies/select", post(handlers::usage::select_candidates))
        .route("/proxies/:id/acquire", post(handlers::usage::acquire))
        .route("/proxies/:id/release", post(handlers::usage::release))
        .route("/proxies/:id/assignments", post(handlers::usage::assign))
        .route(
            "/proxies/:id/assignments/:task_id",
            delete(handlers::usage::unassign),
        )
        .route("/proxies/:id/success", post(handlers::usage::record_success))
        .route("/proxies/:id/failure", post(handlers::usage::record_failure))
        .route("/proxies/:id/test", post(handlers::usage::test_connectivity))
        .route("/stats", get(handlers::health::stats))
}
