//! Bulk import of newline-separated proxy lines

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::parser::{validate_limits, ProxyParser};
use crate::error::{PoolError, Result};
use crate::models::{
    BulkImportRequest, BulkImportResult, ImportLineError, Proxy, ProxyLimits, ProxyOptions,
};
use crate::repository::ProxyStore;

/// Lines that parsed, and the ones that did not
#[derive(Debug, Default)]
pub struct PreparedBatch {
    /// Parsed proxies with their 1-based line numbers
    pub proxies: Vec<(usize, Proxy)>,
    pub errors: Vec<ImportLineError>,
}

pub struct BulkImporter<'a> {
    store: &'a dyn ProxyStore,
    parser: ProxyParser,
    defaults: ProxyLimits,
}

impl<'a> BulkImporter<'a> {
    pub fn new(store: &'a dyn ProxyStore, parser: ProxyParser, defaults: ProxyLimits) -> Self {
        Self {
            store,
            parser,
            defaults,
        }
    }

    /// Parse every line independently.
    ///
    /// Blank lines and `#` comments are ignored. A line whose id already
    /// appeared earlier in the same text is reported against the later line.
    pub fn prepare(
        &self,
        text: &str,
        options: &ProxyOptions,
        limits: ProxyLimits,
        now: DateTime<Utc>,
    ) -> PreparedBatch {
        let mut batch = PreparedBatch::default();
        let mut seen: HashMap<String, usize> = HashMap::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match self
                .parser
                .parse(trimmed, options.metadata.clone(), limits, now)
            {
                Ok(proxy) => {
                    if let Some(first) = seen.get(&proxy.id) {
                        batch.errors.push(ImportLineError {
                            line,
                            reason: format!("duplicate of line {}", first),
                        });
                        continue;
                    }
                    seen.insert(proxy.id.clone(), line);
                    batch.proxies.push((line, proxy));
                }
                Err(e) => batch.errors.push(ImportLineError {
                    line,
                    reason: e.to_string(),
                }),
            }
        }

        batch
    }

    pub async fn import(&self, request: &BulkImportRequest) -> Result<BulkImportResult> {
        let limits = request.defaults.limits(self.defaults);
        validate_limits(&limits)?;

        let now = Utc::now();
        let PreparedBatch { proxies, mut errors } =
            self.prepare(&request.text, &request.defaults, limits, now);

        let imported = if request.replace_existing {
            let batch: Vec<Proxy> = proxies.into_iter().map(|(_, proxy)| proxy).collect();
            let replaced = self.store.replace_all(batch).await?;
            info!(count = replaced.len(), "Replaced entire proxy pool");
            replaced
        } else {
            let mut imported = Vec::with_capacity(proxies.len());
            for (line, proxy) in proxies {
                match self.store.insert(proxy).await {
                    Ok(created) => imported.push(created),
                    Err(PoolError::Duplicate { id }) => {
                        debug!(line, id = %id, "Skipping proxy that already exists");
                        errors.push(ImportLineError {
                            line,
                            reason: format!("duplicate of existing proxy {}", id),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
            imported
        };

        errors.sort_by_key(|e| e.line);

        info!(
            imported = imported.len(),
            failed = errors.len(),
            replace_existing = request.replace_existing,
            "Bulk import finished"
        );

        Ok(BulkImportResult {
            success_count: imported.len(),
            failed_count: errors.len(),
            errors,
            imported,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::proxy::tests::test_proxy;
    use crate::repository::MemoryProxyStore;

    const MIXED: &str = "1.2.3.4:8080:u1:p1\nbad-line\n1.2.3.4:8080:u1:p1\n";

    fn request(text: &str, replace_existing: bool) -> BulkImportRequest {
        BulkImportRequest {
            text: text.to_string(),
            defaults: ProxyOptions::default(),
            replace_existing,
        }
    }

    fn importer(store: &MemoryProxyStore) -> BulkImporter<'_> {
        BulkImporter::new(store, ProxyParser::default(), ProxyLimits::default())
    }

    #[tokio::test]
    async fn test_mixed_batch_without_replace() {
        let store = MemoryProxyStore::new();
        let result = importer(&store).import(&request(MIXED, false)).await.unwrap();

        assert_eq!(result.success_count, 1);
        assert_eq!(result.failed_count, 2);
        assert_eq!(result.errors[0].line, 2);
        assert_eq!(result.errors[1].line, 3);
        assert!(result.errors[1].reason.contains("duplicate"));
        assert_eq!(result.imported[0].address(), "1.2.3.4:8080");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replace_existing_wipes_pool() {
        let store = MemoryProxyStore::new();
        for i in 0..10 {
            store.insert(test_proxy(&format!("old-{}", i))).await.unwrap();
        }

        let result = importer(&store).import(&request(MIXED, true)).await.unwrap();

        assert_eq!(result.success_count, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.get("old-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_existing_proxy_reported_as_duplicate() {
        let store = MemoryProxyStore::new();
        importer(&store)
            .import(&request("5.6.7.8:3128:a:b", false))
            .await
            .unwrap();

        let result = importer(&store)
            .import(&request("5.6.7.8:3128:other:creds\n9.9.9.9:80:a:b", false))
            .await
            .unwrap();

        assert_eq!(result.success_count, 1);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.errors[0].line, 1);
        assert!(result.errors[0].reason.contains("existing"));
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_comments_blank_lines_and_defaults() {
        let store = MemoryProxyStore::new();
        let mut req = request("# datacenter batch\n\n  10.0.0.1:8000:u:p  \n", false);
        req.defaults.max_concurrent_usage = Some(3);
        req.defaults.metadata.provider = Some("acme".to_string());

        let result = importer(&store).import(&req).await.unwrap();
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failed_count, 0);

        let proxy = &result.imported[0];
        assert_eq!(proxy.capacity.max_concurrent_usage, 3);
        assert_eq!(proxy.metadata.provider.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_invalid_defaults_reject_whole_request() {
        let store = MemoryProxyStore::new();
        let mut req = request("10.0.0.1:8000:u:p", false);
        req.defaults.rotation_weight = Some(42);

        let err = importer(&store).import(&req).await.unwrap_err();
        assert!(matches!(err, PoolError::Validation { field: "rotation_weight", .. }));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[test]
    fn test_prepare_collects_line_errors() {
        let store = MemoryProxyStore::new();
        let batch = importer(&store).prepare(
            "10.0.0.1:0:u:p\n10.0.0.1:80::p\n10.0.0.1:80:u:p",
            &ProxyOptions::default(),
            ProxyLimits::default(),
            Utc::now(),
        );

        assert_eq!(batch.proxies.len(), 1);
        assert_eq!(batch.proxies[0].0, 3);
        let lines: Vec<usize> = batch.errors.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![1, 2]);
    }
}
