//! Background connectivity checks
//!
//! Periodically probes every proxy that is still in rotation or waiting to
//! recover, feeding the results back through the pool.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, instrument, warn};

use super::ProxyPool;
use crate::error::Result;

/// Health checker configuration
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Interval between check rounds
    pub check_interval: Duration,
    /// Probes allowed in flight at once
    pub workers: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            workers: 20,
        }
    }
}

/// Summary of one check round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

pub struct HealthChecker {
    pool: ProxyPool,
    config: HealthCheckerConfig,
}

impl HealthChecker {
    pub fn new(pool: ProxyPool, config: HealthCheckerConfig) -> Self {
        Self { pool, config }
    }

    /// Run until `shutdown` flips to true (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health checker with {}s interval",
            self.config.check_interval.as_secs()
        );

        let mut check_interval = interval(self.config.check_interval);

        loop {
            tokio::select! {
                _ = check_interval.tick() => {
                    if let Err(e) = self.check_all().await {
                        error!("Health check round failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every active or inactive proxy once.
    ///
    /// Blacklisted and maintenance proxies are left alone.
    pub async fn check_all(&self) -> Result<RoundSummary> {
        let proxies: Vec<_> = self
            .pool
            .all_proxies()
            .await?
            .into_iter()
            .filter(|p| p.status.is_probed())
            .collect();

        info!("Checking health of {} proxies", proxies.len());

        let results = futures::stream::iter(proxies)
            .map(|proxy| {
                let pool = self.pool.clone();
                async move {
                    match pool.test_connectivity(&proxy.id).await {
                        Ok(result) => result.success,
                        Err(e) => {
                            warn!("Failed to check proxy {}: {}", proxy.address(), e);
                            false
                        }
                    }
                }
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect::<Vec<bool>>()
            .await;

        let healthy = results.iter().filter(|&&v| v).count();
        let summary = RoundSummary {
            checked: results.len(),
            healthy,
            unhealthy: results.len().saturating_sub(healthy),
        };

        info!(
            "Health check complete: {} healthy, {} unhealthy",
            summary.healthy, summary.unhealthy
        );
        Ok(summary)
    }
}

/// Guard for managing health checker lifecycle
pub struct HealthCheckerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl HealthCheckerHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
