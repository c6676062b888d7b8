//! Usage tracking: concurrency cap and fixed-window per-minute quota
//!
//! The window is fixed, not sliding, so a burst straddling a minute
//! boundary can briefly see up to twice the limit. The quota is advisory.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{PoolError, Result};
use crate::models::Proxy;
use crate::pool::ProxyPool;

/// Take one usage slot and one request from the current minute.
///
/// The concurrency guard is checked first; the minute window rolls over
/// before the quota guard is evaluated. Callers must run this inside the
/// store's critical section so both increments commit together.
pub fn try_acquire(proxy: &mut Proxy, now: DateTime<Utc>) -> Result<()> {
    if !proxy.has_free_slot() {
        return Err(PoolError::ConcurrencyExceeded {
            id: proxy.id.clone(),
            max: proxy.capacity.max_concurrent_usage,
        });
    }

    let window = &mut proxy.rate_limit;
    if window.window_expired(now) {
        window.requests_this_minute = 0;
        window.minute_window_start = now;
    }

    if window.requests_this_minute >= window.requests_per_minute_limit {
        return Err(PoolError::QuotaExceeded {
            id: proxy.id.clone(),
            limit: window.requests_per_minute_limit,
        });
    }

    window.requests_this_minute += 1;
    proxy.capacity.current_usage += 1;
    Ok(())
}

/// Give back one usage slot. Returns false if nothing was held.
pub fn release(proxy: &mut Proxy) -> bool {
    if proxy.capacity.current_usage > 0 {
        proxy.capacity.current_usage -= 1;
        true
    } else {
        false
    }
}

/// A held usage slot on one proxy
///
/// Released by [`ProxyLease::release`] or, if the holder never gets that
/// far, on drop.
pub struct ProxyLease {
    pool: ProxyPool,
    proxy: Proxy,
    released: bool,
}

impl ProxyLease {
    pub(crate) fn new(pool: ProxyPool, proxy: Proxy) -> Self {
        Self {
            pool,
            proxy,
            released: false,
        }
    }

    /// Snapshot of the proxy taken at acquire time
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn id(&self) -> &str {
        &self.proxy.id
    }

    /// Give the slot back now.
    ///
    /// The lease only counts as released once the store call returns, so a
    /// cancelled call still falls back to the release on drop.
    pub async fn release(mut self) -> Result<Proxy> {
        let result = self.pool.release(&self.proxy.id).await;
        self.released = true;
        result
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let pool = self.pool.clone();
        let id = self.proxy.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pool.release(&id).await {
                        warn!(id = %id, error = %e, "Failed to release dropped lease");
                    }
                });
            }
            Err(_) => {
                warn!(id = %id, "Lease dropped outside a runtime; usage slot not released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::proxy::tests::test_proxy;
    use chrono::Duration;

    #[test]
    fn test_acquire_increments_both_counters() {
        let now = Utc::now();
        let mut proxy = test_proxy("a");
        proxy.capacity.max_concurrent_usage = 2;

        try_acquire(&mut proxy, now).unwrap();
        try_acquire(&mut proxy, now).unwrap();
        assert_eq!(proxy.capacity.current_usage, 2);
        assert_eq!(proxy.rate_limit.requests_this_minute, 2);

        let err = try_acquire(&mut proxy, now).unwrap_err();
        assert!(matches!(err, PoolError::ConcurrencyExceeded { max: 2, .. }));
        assert_eq!(proxy.rate_limit.requests_this_minute, 2);
    }

    #[test]
    fn test_acquire_quota_exhausted() {
        let now = Utc::now();
        let mut proxy = test_proxy("a");
        proxy.capacity.max_concurrent_usage = 10;
        proxy.rate_limit.requests_per_minute_limit = 2;
        proxy.rate_limit.requests_this_minute = 2;
        proxy.rate_limit.minute_window_start = now - Duration::seconds(10);

        let err = try_acquire(&mut proxy, now).unwrap_err();
        assert!(matches!(err, PoolError::QuotaExceeded { limit: 2, .. }));
        assert_eq!(proxy.capacity.current_usage, 0);
    }

    #[test]
    fn test_minute_window_rollover_resets_to_one() {
        let now = Utc::now();
        let mut proxy = test_proxy("a");
        proxy.rate_limit.requests_this_minute = 59;
        proxy.rate_limit.minute_window_start = now - Duration::seconds(61);

        try_acquire(&mut proxy, now).unwrap();
        assert_eq!(proxy.rate_limit.requests_this_minute, 1);
        assert_eq!(proxy.rate_limit.minute_window_start, now);
    }

    #[test]
    fn test_exhausted_quota_recovers_after_window() {
        let now = Utc::now();
        let mut proxy = test_proxy("a");
        proxy.rate_limit.requests_this_minute = 60;
        proxy.rate_limit.minute_window_start = now - Duration::seconds(60);

        try_acquire(&mut proxy, now).unwrap();
        assert_eq!(proxy.rate_limit.requests_this_minute, 1);
    }

    #[test]
    fn test_release_floors_at_zero() {
        let mut proxy = test_proxy("a");
        proxy.capacity.current_usage = 1;

        assert!(release(&mut proxy));
        assert!(!release(&mut proxy));
        assert_eq!(proxy.capacity.current_usage, 0);
    }
}
