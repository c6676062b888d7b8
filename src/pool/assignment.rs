//! Advisory task assignments
//!
//! Records which tasks currently route through a proxy. This is
//! bookkeeping only; the concurrency gate lives in the usage tracker.

use chrono::{DateTime, Utc};

use super::usage;
use crate::error::{PoolError, Result};
use crate::models::{Assignment, Proxy};

pub fn validate_task_id(task_id: &str) -> Result<()> {
    if task_id.trim().is_empty() {
        return Err(PoolError::validation("task_id", "must not be empty"));
    }
    Ok(())
}

/// Bind `task_id` to the proxy. Returns false if it was already bound.
pub fn assign(proxy: &mut Proxy, task_id: &str, now: DateTime<Utc>) -> bool {
    if proxy.is_assigned_to(task_id) {
        return false;
    }
    proxy.assignments.push(Assignment {
        task_id: task_id.to_string(),
        assigned_at: now,
    });
    true
}

/// Drop the binding and give back its usage slot.
///
/// Nothing changes when the task was not bound.
pub fn unassign(proxy: &mut Proxy, task_id: &str) -> bool {
    let before = proxy.assignments.len();
    proxy.assignments.retain(|a| a.task_id != task_id);
    let removed = proxy.assignments.len() != before;

    if removed {
        usage::release(proxy);
    }
    removed
}
