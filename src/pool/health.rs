//! Health monitoring: outcome accounting and failure-driven transitions
//!
//! Only `active` <-> `inactive` is ever decided here. `blacklisted` and
//! `maintenance` belong to operators.

use chrono::{DateTime, Utc};

use crate::models::{FailureReport, LastError, OutcomeSource, Proxy, ProxyStatus};

/// Auto-disable policy with recovery hysteresis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Disable proxies after `failure_threshold` consecutive failures
    pub auto_disable: bool,
    pub failure_threshold: i32,
    /// Consecutive successes required before an auto-disabled proxy returns
    pub recovery_successes: i32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            auto_disable: false,
            failure_threshold: 5,
            recovery_successes: 3,
        }
    }
}

/// Status change caused by a recorded outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Disabled,
    Reenabled,
}

pub fn success_rate(total_requests: i64, failed_requests: i64) -> f64 {
    if total_requests <= 0 {
        0.0
    } else {
        let succeeded = (total_requests - failed_requests).max(0);
        (succeeded as f64 / total_requests as f64) * 100.0
    }
}

pub fn record_success(
    proxy: &mut Proxy,
    response_time_ms: i64,
    policy: &HealthPolicy,
    now: DateTime<Utc>,
) -> Transition {
    let health = &mut proxy.health;
    health.total_requests += 1;
    health.consecutive_failures = 0;
    health.consecutive_successes = health.consecutive_successes.saturating_add(1);
    health.last_response_time_ms = Some(response_time_ms.max(0));
    health.last_tested_at = Some(now);
    health.is_working = true;
    health.success_rate = success_rate(health.total_requests, health.failed_requests);

    let recovered = proxy.status == ProxyStatus::Inactive
        && health.auto_disabled_at.is_some()
        && health.consecutive_successes >= policy.recovery_successes.max(1);

    if recovered {
        proxy.status = ProxyStatus::Active;
        proxy.health.auto_disabled_at = None;
        Transition::Reenabled
    } else {
        Transition::Unchanged
    }
}

pub fn record_failure(
    proxy: &mut Proxy,
    report: &FailureReport,
    source: OutcomeSource,
    policy: &HealthPolicy,
    now: DateTime<Utc>,
) -> Transition {
    let health = &mut proxy.health;
    health.total_requests += 1;
    health.failed_requests += 1;
    health.consecutive_failures = health.consecutive_failures.saturating_add(1);
    health.consecutive_successes = 0;
    health.last_error = Some(LastError {
        message: report.message.clone(),
        code: report.code.clone(),
        source,
        timestamp: now,
    });
    health.success_rate = success_rate(health.total_requests, health.failed_requests);

    if source == OutcomeSource::Healthcheck {
        health.is_working = false;
        health.last_tested_at = Some(now);
    }

    let disable = policy.auto_disable
        && proxy.status == ProxyStatus::Active
        && health.consecutive_failures >= policy.failure_threshold.max(1);

    if disable {
        proxy.status = ProxyStatus::Inactive;
        proxy.health.is_working = false;
        proxy.health.auto_disabled_at = Some(now);
        Transition::Disabled
    } else {
        Transition::Unchanged
    }
}

/// Apply an operator-chosen status, dropping any automatic-disable marker.
///
/// Setting `active` puts the proxy straight back into rotation: it is
/// marked working and its failure streak starts over.
pub fn set_operator_status(proxy: &mut Proxy, status: ProxyStatus) {
    proxy.status = status;
    proxy.health.auto_disabled_at = None;
    proxy.health.consecutive_successes = 0;
    if status == ProxyStatus::Active {
        proxy.health.is_working = true;
        proxy.health.consecutive_failures = 0;
    }
}
