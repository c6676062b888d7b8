//! Candidate selection
//!
//! Filters proxies down to the ones a task could acquire right now and
//! ranks them by rotation weight, then health, then load.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::models::{Proxy, TaskContext};

/// Whether `proxy` may be handed to the task described by `ctx`
pub fn is_candidate(proxy: &Proxy, ctx: &TaskContext, now: DateTime<Utc>) -> bool {
    proxy.is_available(now)
        && proxy.accepts_task(ctx.task_id.as_deref())
        && ctx.matches_metadata(&proxy.metadata)
}

/// Higher weight first, then higher success rate, then least loaded
pub fn rank(a: &Proxy, b: &Proxy) -> Ordering {
    b.capacity
        .rotation_weight
        .cmp(&a.capacity.rotation_weight)
        .then_with(|| b.health.success_rate.total_cmp(&a.health.success_rate))
        .then_with(|| a.capacity.current_usage.cmp(&b.capacity.current_usage))
        .then_with(|| a.id.cmp(&b.id))
}

/// Ranked candidates; empty when nothing qualifies
pub fn select_candidates(
    proxies: Vec<Proxy>,
    ctx: &TaskContext,
    now: DateTime<Utc>,
) -> Vec<Proxy> {
    let mut candidates: Vec<Proxy> = proxies
        .into_iter()
        .filter(|p| is_candidate(p, ctx, now))
        .collect();

    candidates.sort_by(rank);

    if let Some(limit) = ctx.limit {
        candidates.truncate(limit);
    }
    candidates
}
