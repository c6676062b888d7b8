//! In-process proxy store

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{Mutation, ProxyStore};
use crate::error::{PoolError, Result};
use crate::models::{PaginatedResponse, Proxy, ProxyListParams};

/// Proxy store backed by a sharded concurrent map
///
/// Per-record mutations run under the shard's write lock. The generation
/// lock is shared by every operation and taken exclusively by
/// `replace_all`, so a whole-pool swap is never observed half done.
#[derive(Default)]
pub struct MemoryProxyStore {
    records: DashMap<String, Proxy>,
    generation: RwLock<()>,
}

impl MemoryProxyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProxyStore for MemoryProxyStore {
    async fn insert(&self, proxy: Proxy) -> Result<Proxy> {
        let _generation = self.generation.read();
        match self.records.entry(proxy.id.clone()) {
            Entry::Occupied(_) => Err(PoolError::Duplicate { id: proxy.id }),
            Entry::Vacant(slot) => {
                slot.insert(proxy.clone());
                Ok(proxy)
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Proxy>> {
        let _generation = self.generation.read();
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn list(&self, params: &ProxyListParams) -> Result<PaginatedResponse<Proxy>> {
        let mut matching: Vec<Proxy> = {
            let _generation = self.generation.read();
            self.records
                .iter()
                .filter(|r| params.matches(r.value()))
                .map(|r| r.value().clone())
                .collect()
        };

        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(params.offset() as usize)
            .take(params.limit() as usize)
            .collect();

        Ok(PaginatedResponse::new(
            items,
            total,
            params.page(),
            params.limit(),
        ))
    }

    async fn all(&self) -> Result<Vec<Proxy>> {
        let _generation = self.generation.read();
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }

    async fn modify(&self, id: &str, mutation: Mutation<'_>) -> Result<Proxy> {
        let _generation = self.generation.read();
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| PoolError::not_found(id))?;

        let mut next = record.value().clone();
        mutation(&mut next)?;
        next.updated_at = Utc::now();

        *record.value_mut() = next.clone();
        Ok(next)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let _generation = self.generation.read();
        Ok(self.records.remove(id).is_some())
    }

    async fn delete_many(&self, ids: &[String]) -> Result<u64> {
        let _generation = self.generation.read();
        let deleted = ids
            .iter()
            .filter(|id| self.records.remove(id.as_str()).is_some())
            .count();
        Ok(deleted as u64)
    }

    async fn replace_all(&self, proxies: Vec<Proxy>) -> Result<Vec<Proxy>> {
        let _generation = self.generation.write();
        self.records.clear();
        for proxy in &proxies {
            self.records.insert(proxy.id.clone(), proxy.clone());
        }
        Ok(proxies)
    }

    async fn count(&self) -> Result<i64> {
        let _generation = self.generation.read();
        Ok(self.records.len() as i64)
    }
}
