//! The proxy pool service
//!
//! Every caller-facing operation lives here. Business rules are delegated
//! to the pure functions in the sibling modules and applied through the
//! store's atomic `modify`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::assignment;
use super::connectivity::ConnectivityProbe;
use super::health::{self, HealthPolicy, Transition};
use super::importer::BulkImporter;
use super::parser::{validate_limits, ProxyParser};
use super::selector;
use super::usage::ProxyLease;
use crate::error::{PoolError, Result};
use crate::models::{
    BulkDeleteResult, BulkImportRequest, BulkImportResult, ConnectivityResult,
    CreateProxyRequest, FailureReport, OutcomeSource, PaginatedResponse, PoolStats, Proxy,
    ProxyLimits, ProxyListParams, TaskContext, UpdateProxyRequest,
};
use crate::repository::ProxyStore;

/// Pool-wide behaviour knobs
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Limits applied to new proxies when the caller supplies none
    pub limits: ProxyLimits,
    pub allow_hostnames: bool,
    pub health: HealthPolicy,
    /// Upper bound on a single connectivity probe
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limits: ProxyLimits::default(),
            allow_hostnames: false,
            health: HealthPolicy::default(),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

struct PoolInner {
    store: Arc<dyn ProxyStore>,
    probe: Arc<dyn ConnectivityProbe>,
    parser: ProxyParser,
    config: PoolConfig,
    /// Shared by every operation, exclusive for replace-all imports
    fence: RwLock<()>,
}

/// Handle to the proxy pool; cheap to clone
#[derive(Clone)]
pub struct ProxyPool {
    inner: Arc<PoolInner>,
}

impl ProxyPool {
    pub fn new(
        store: Arc<dyn ProxyStore>,
        probe: Arc<dyn ConnectivityProbe>,
        config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                store,
                probe,
                parser: ProxyParser::new(config.allow_hostnames),
                config,
                fence: RwLock::new(()),
            }),
        }
    }

    /// Backend liveness
    pub async fn ping(&self) -> Result<()> {
        self.inner.store.ping().await
    }

    pub async fn create_proxy(&self, request: CreateProxyRequest) -> Result<Proxy> {
        let _fence = self.inner.fence.read().await;
        let limits = request.options.limits(self.inner.config.limits);
        let proxy = self.inner.parser.parse(
            &request.raw,
            request.options.metadata,
            limits,
            Utc::now(),
        )?;

        let proxy = self.inner.store.insert(proxy).await?;
        info!(id = %proxy.id, address = %proxy.address(), "Created proxy");
        Ok(proxy)
    }

    pub async fn get_proxy(&self, id: &str) -> Result<Proxy> {
        let _fence = self.inner.fence.read().await;
        self.inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| PoolError::not_found(id))
    }

    pub async fn list_proxies(&self, params: &ProxyListParams) -> Result<PaginatedResponse<Proxy>> {
        let _fence = self.inner.fence.read().await;
        self.inner.store.list(params).await
    }

    /// Every proxy in the pool, unordered
    pub async fn all_proxies(&self) -> Result<Vec<Proxy>> {
        let _fence = self.inner.fence.read().await;
        self.inner.store.all().await
    }

    pub async fn update_proxy(&self, id: &str, patch: UpdateProxyRequest) -> Result<Proxy> {
        let _fence = self.inner.fence.read().await;
        let proxy = self
            .inner
            .store
            .modify(id, &|proxy: &mut Proxy| apply_patch(proxy, &patch))
            .await?;

        info!(id = %proxy.id, status = %proxy.status, "Updated proxy");
        Ok(proxy)
    }

    pub async fn delete_proxy(&self, id: &str) -> Result<()> {
        let _fence = self.inner.fence.read().await;
        if !self.inner.store.delete(id).await? {
            return Err(PoolError::not_found(id));
        }
        info!(id = %id, "Deleted proxy");
        Ok(())
    }

    /// Import one proxy per line.
    ///
    /// With `replace_existing`, the whole pool is swapped while holding the
    /// exclusive fence; no other pool operation runs until it finishes.
    pub async fn bulk_import(&self, request: BulkImportRequest) -> Result<BulkImportResult> {
        let importer = BulkImporter::new(
            self.inner.store.as_ref(),
            self.inner.parser,
            self.inner.config.limits,
        );

        if request.replace_existing {
            let _fence = self.inner.fence.write().await;
            warn!("Replacing entire proxy pool from bulk import");
            importer.import(&request).await
        } else {
            let _fence = self.inner.fence.read().await;
            importer.import(&request).await
        }
    }

    pub async fn bulk_delete(&self, ids: &[String]) -> Result<BulkDeleteResult> {
        let _fence = self.inner.fence.read().await;
        let deleted_count = self.inner.store.delete_many(ids).await?;
        info!(requested = ids.len(), deleted = deleted_count, "Bulk deleted proxies");
        Ok(BulkDeleteResult { deleted_count })
    }

    /// Ranked proxies the task could acquire right now
    pub async fn select_candidates(&self, ctx: &TaskContext) -> Result<Vec<Proxy>> {
        let _fence = self.inner.fence.read().await;
        let now = Utc::now();
        let usable = self.inner.store.list_usable(now).await?;
        Ok(selector::select_candidates(usable, ctx, now))
    }

    /// Take a usage slot; guard failures are returned for the caller to retry
    pub async fn acquire(&self, id: &str) -> Result<Proxy> {
        let _fence = self.inner.fence.read().await;
        match self.inner.store.try_acquire(id, Utc::now()).await {
            Ok(proxy) => {
                debug!(
                    id = %id,
                    usage = proxy.capacity.current_usage,
                    requests_this_minute = proxy.rate_limit.requests_this_minute,
                    "Acquired proxy"
                );
                Ok(proxy)
            }
            Err(e) => {
                if e.is_retryable() {
                    debug!(id = %id, reason = %e, "Acquire rejected");
                }
                Err(e)
            }
        }
    }

    /// Give back a usage slot; releasing an idle proxy is a no-op
    pub async fn release(&self, id: &str) -> Result<Proxy> {
        let _fence = self.inner.fence.read().await;
        let proxy = self.inner.store.release_usage(id).await?;
        debug!(id = %id, usage = proxy.capacity.current_usage, "Released proxy");
        Ok(proxy)
    }

    /// Acquire and wrap the slot in a lease that releases itself
    pub async fn lease(&self, id: &str) -> Result<ProxyLease> {
        let proxy = self.acquire(id).await?;
        Ok(ProxyLease::new(self.clone(), proxy))
    }

    /// Run `work` while holding a usage slot on `id`.
    ///
    /// The slot is released whether `work` succeeds, fails or panics.
    pub async fn with_lease<F, Fut, T>(&self, id: &str, work: F) -> Result<T>
    where
        F: FnOnce(Proxy) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.lease(id).await?;
        let result = work(lease.proxy().clone()).await;

        if let Err(e) = lease.release().await {
            warn!(id = %id, error = %e, "Failed to release leased proxy");
        }
        result
    }

    pub async fn assign(&self, id: &str, task_id: &str) -> Result<Proxy> {
        assignment::validate_task_id(task_id)?;
        let _fence = self.inner.fence.read().await;
        let now = Utc::now();
        let proxy = self
            .inner
            .store
            .modify(id, &|proxy: &mut Proxy| {
                assignment::assign(proxy, task_id, now);
                Ok(())
            })
            .await?;

        debug!(id = %id, task_id = %task_id, "Assigned task");
        Ok(proxy)
    }

    /// Unbind a task and release its slot in one step
    pub async fn unassign(&self, id: &str, task_id: &str) -> Result<Proxy> {
        let _fence = self.inner.fence.read().await;
        let proxy = self
            .inner
            .store
            .modify(id, &|proxy: &mut Proxy| {
                assignment::unassign(proxy, task_id);
                Ok(())
            })
            .await?;

        debug!(id = %id, task_id = %task_id, usage = proxy.capacity.current_usage, "Unassigned task");
        Ok(proxy)
    }

    pub async fn record_success(&self, id: &str, response_time_ms: i64) -> Result<Proxy> {
        if response_time_ms < 0 {
            return Err(PoolError::validation(
                "response_time_ms",
                "must not be negative",
            ));
        }

        let _fence = self.inner.fence.read().await;
        let policy = self.inner.config.health;
        let now = Utc::now();
        let transition = Mutex::new(Transition::Unchanged);

        let proxy = self
            .inner
            .store
            .modify(id, &|proxy: &mut Proxy| {
                *transition.lock() = health::record_success(proxy, response_time_ms, &policy, now);
                Ok(())
            })
            .await?;

        log_transition(&proxy, transition.into_inner());
        Ok(proxy)
    }

    pub async fn record_failure(&self, id: &str, report: FailureReport) -> Result<Proxy> {
        self.record_failure_from(id, &report, OutcomeSource::Request)
            .await
    }

    async fn record_failure_from(
        &self,
        id: &str,
        report: &FailureReport,
        source: OutcomeSource,
    ) -> Result<Proxy> {
        let _fence = self.inner.fence.read().await;
        let policy = self.inner.config.health;
        let now = Utc::now();
        let transition = Mutex::new(Transition::Unchanged);

        let proxy = self
            .inner
            .store
            .modify(id, &|proxy: &mut Proxy| {
                *transition.lock() = health::record_failure(proxy, report, source, &policy, now);
                Ok(())
            })
            .await?;

        debug!(
            id = %id,
            consecutive_failures = proxy.health.consecutive_failures,
            error = %report.message,
            "Recorded failure"
        );
        log_transition(&proxy, transition.into_inner());
        Ok(proxy)
    }

    /// Probe the proxy under the configured timeout and record the outcome.
    ///
    /// Probe failures come back as a result value; only unknown ids and
    /// backend errors are returned as `Err`. Quota is not consumed.
    #[instrument(skip(self))]
    pub async fn test_connectivity(&self, id: &str) -> Result<ConnectivityResult> {
        let proxy = self.get_proxy(id).await?;
        let bound = self.inner.config.probe_timeout;

        let started = Instant::now();
        let outcome = match tokio::time::timeout(bound, self.inner.probe.probe(&proxy)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PoolError::Timeout {
                after_ms: bound.as_millis() as u64,
            }),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.record_success(id, elapsed_ms as i64).await?;
                info!(id = %id, response_time_ms = elapsed_ms, "Connectivity check passed");
                Ok(ConnectivityResult {
                    success: true,
                    response_time_ms: Some(elapsed_ms),
                    message: "Proxy is reachable".to_string(),
                    error_code: None,
                })
            }
            Err(e) => {
                let report = FailureReport::new(e.to_string(), Some(e.code()));
                self.record_failure_from(id, &report, OutcomeSource::Healthcheck)
                    .await?;
                warn!(id = %id, code = %e.code(), error = %e, "Connectivity check failed");
                Ok(ConnectivityResult {
                    success: false,
                    response_time_ms: None,
                    message: report.message,
                    error_code: report.code,
                })
            }
        }
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let _fence = self.inner.fence.read().await;
        let proxies = self.inner.store.all().await?;
        Ok(PoolStats::from_proxies(&proxies))
    }
}

fn log_transition(proxy: &Proxy, transition: Transition) {
    match transition {
        Transition::Disabled => warn!(
            id = %proxy.id,
            consecutive_failures = proxy.health.consecutive_failures,
            "Proxy auto-disabled"
        ),
        Transition::Reenabled => info!(
            id = %proxy.id,
            consecutive_successes = proxy.health.consecutive_successes,
            "Proxy re-enabled"
        ),
        Transition::Unchanged => {}
    }
}

/// Apply an operator patch, validating the resulting limits as a whole
fn apply_patch(proxy: &mut Proxy, patch: &UpdateProxyRequest) -> Result<()> {
    let limits = ProxyLimits {
        max_concurrent_usage: patch
            .max_concurrent_usage
            .unwrap_or(proxy.capacity.max_concurrent_usage),
        requests_per_minute_limit: patch
            .requests_per_minute_limit
            .unwrap_or(proxy.rate_limit.requests_per_minute_limit),
        rotation_weight: patch
            .rotation_weight
            .unwrap_or(proxy.capacity.rotation_weight),
    };
    validate_limits(&limits)?;
    if limits.max_concurrent_usage < proxy.capacity.current_usage {
        return Err(PoolError::validation(
            "max_concurrent_usage",
            format!(
                "cannot drop below current usage of {}",
                proxy.capacity.current_usage
            ),
        ));
    }

    if let Some(username) = &patch.username {
        if username.is_empty() || username.contains(':') {
            return Err(PoolError::validation("username", "must be non-empty without ':'"));
        }
        proxy.endpoint.username = username.clone();
    }
    if let Some(password) = &patch.password {
        if password.is_empty() || password.contains(':') {
            return Err(PoolError::validation("password", "must be non-empty without ':'"));
        }
        proxy.endpoint.password = password.clone();
    }
    proxy.endpoint.raw = format!(
        "{}:{}:{}",
        proxy.endpoint.address(),
        proxy.endpoint.username,
        proxy.endpoint.password
    );

    proxy.capacity.max_concurrent_usage = limits.max_concurrent_usage;
    proxy.capacity.rotation_weight = limits.rotation_weight;
    proxy.rate_limit.requests_per_minute_limit = limits.requests_per_minute_limit;

    if let Some(metadata) = &patch.metadata {
        proxy.metadata = metadata.clone();
    }
    if let Some(tasks) = &patch.blacklisted_tasks {
        proxy.blacklisted_tasks = tasks.clone();
    }
    if let Some(tasks) = &patch.whitelisted_tasks {
        proxy.whitelisted_tasks = tasks.clone();
    }
    if let Some(status) = patch.status {
        health::set_operator_status(proxy, status);
    }
    Ok(())
}
