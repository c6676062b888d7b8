//! API server implementation
//!
//! REST endpoints for managing proxies and for workers leasing them.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
