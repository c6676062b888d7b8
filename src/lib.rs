//! Proxy Pool - proxy allocation for scraping workers
//!
//! Keeps a pool of authenticated upstream proxies and hands them out to
//! concurrent workers.
//!
//! ## Features
//!
//! - Per-proxy concurrency caps and per-minute request quotas
//! - Success/failure accounting with automatic disable and recovery
//! - Task assignments, task black/whitelists and weighted selection
//! - Bulk import of `host:port:username:password` lines
//! - Background connectivity checks through HTTP CONNECT
//! - In-memory or PostgreSQL storage

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod pool;
pub mod repository;

pub use config::Config;
pub use error::{PoolError, Result};
pub use pool::ProxyPool;
