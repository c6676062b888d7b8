//! Proxy store port and its backends
//!
//! The store is the only shared mutable state in the pool. Every mutation
//! after creation goes through [`ProxyStore::modify`] (or one of the guarded
//! counter primitives), which applies the caller's function atomically with
//! respect to every other operation on the same id.

pub mod memory;
pub mod postgres;

pub use memory::MemoryProxyStore;
pub use postgres::PgProxyStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{PaginatedResponse, Proxy, ProxyListParams};
use crate::pool::usage;

/// A state transition evaluated inside the store's critical section.
///
/// Returning an error aborts the mutation and leaves the record untouched.
pub type Mutation<'a> = &'a (dyn Fn(&mut Proxy) -> Result<()> + Send + Sync);

#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Insert a new record, failing with `Duplicate` if the id exists
    async fn insert(&self, proxy: Proxy) -> Result<Proxy>;

    async fn get(&self, id: &str) -> Result<Option<Proxy>>;

    /// Filtered, paginated listing ordered by newest first
    async fn list(&self, params: &ProxyListParams) -> Result<PaginatedResponse<Proxy>>;

    async fn all(&self) -> Result<Vec<Proxy>>;

    /// Atomically apply `mutation` to the record with `id`
    async fn modify(&self, id: &str, mutation: Mutation<'_>) -> Result<Proxy>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn delete_many(&self, ids: &[String]) -> Result<u64>;

    /// Wipe the store and insert `proxies` as one exclusive step
    async fn replace_all(&self, proxies: Vec<Proxy>) -> Result<Vec<Proxy>>;

    async fn count(&self) -> Result<i64>;

    /// Proxies that could be acquired at `now`
    async fn list_usable(&self, now: DateTime<Utc>) -> Result<Vec<Proxy>> {
        let proxies = self.all().await?;
        Ok(proxies.into_iter().filter(|p| p.is_available(now)).collect())
    }

    /// Increment usage and the minute counter if both guards pass
    async fn try_acquire(&self, id: &str, now: DateTime<Utc>) -> Result<Proxy> {
        self.modify(id, &move |proxy: &mut Proxy| usage::try_acquire(proxy, now))
            .await
    }

    /// Decrement usage, floored at zero
    async fn release_usage(&self, id: &str) -> Result<Proxy> {
        self.modify(id, &|proxy: &mut Proxy| {
            usage::release(proxy);
            Ok(())
        })
        .await
    }

    /// Backend liveness check
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
