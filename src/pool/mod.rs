//! Proxy pool domain logic
//!
//! - `parser`: identity and raw-line parsing
//! - `usage`: concurrency cap, per-minute quota and leases
//! - `health`: outcome accounting and auto-disable policy
//! - `assignment`: advisory task bindings
//! - `selector`: candidate filtering and ranking
//! - `importer`: bulk import
//! - `connectivity` / `checker`: probing, on demand and in the background
//! - `service`: the `ProxyPool` operation surface

pub mod assignment;
pub mod checker;
pub mod connectivity;
pub mod health;
pub mod importer;
pub mod parser;
pub mod selector;
pub mod service;
pub mod usage;

pub use checker::{HealthChecker, HealthCheckerConfig, HealthCheckerHandle};
pub use connectivity::{ConnectivityProbe, HttpConnectProbe};
pub use health::{HealthPolicy, Transition};
pub use importer::BulkImporter;
pub use parser::{proxy_id, ProxyParser};
pub use service::{PoolConfig, ProxyPool};
pub use usage::ProxyLease;
