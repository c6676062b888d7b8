use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{Proxy, ProxyLimits, ProxyMetadata, ProxyStatus};

/// Per-proxy settings supplied on create or as bulk-import defaults
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyOptions {
    #[serde(default)]
    pub metadata: ProxyMetadata,
    pub max_concurrent_usage: Option<i32>,
    pub requests_per_minute_limit: Option<i32>,
    pub rotation_weight: Option<i32>,
}

impl ProxyOptions {
    /// Overlay the explicit options on top of pool-wide defaults
    pub fn limits(&self, defaults: ProxyLimits) -> ProxyLimits {
        ProxyLimits {
            max_concurrent_usage: self
                .max_concurrent_usage
                .unwrap_or(defaults.max_concurrent_usage),
            requests_per_minute_limit: self
                .requests_per_minute_limit
                .unwrap_or(defaults.requests_per_minute_limit),
            rotation_weight: self.rotation_weight.unwrap_or(defaults.rotation_weight),
        }
    }
}

/// Request to create a new proxy
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProxyRequest {
    /// `host:port:username:password`
    pub raw: String,
    #[serde(flatten)]
    pub options: ProxyOptions,
}

/// Partial update of an existing proxy
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProxyRequest {
    pub metadata: Option<ProxyMetadata>,
    pub status: Option<ProxyStatus>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_concurrent_usage: Option<i32>,
    pub requests_per_minute_limit: Option<i32>,
    pub rotation_weight: Option<i32>,
    pub blacklisted_tasks: Option<BTreeSet<String>>,
    pub whitelisted_tasks: Option<BTreeSet<String>>,
}

/// Proxy list query parameters
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyListParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub status: Option<ProxyStatus>,
    pub is_working: Option<bool>,
    pub provider: Option<String>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub tag: Option<String>,
    pub search: Option<String>,
}

impl ProxyListParams {
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(20).clamp(1, 100)
    }

    /// Rows to skip; saturates so an absurd `page` just yields an empty page
    pub fn offset(&self) -> i64 {
        (self.page() - 1).saturating_mul(self.limit())
    }

    /// Whether a proxy passes every filter that is set
    pub fn matches(&self, proxy: &Proxy) -> bool {
        if let Some(status) = self.status {
            if proxy.status != status {
                return false;
            }
        }
        if let Some(is_working) = self.is_working {
            if proxy.health.is_working != is_working {
                return false;
            }
        }
        if !matches_optional(&self.provider, &proxy.metadata.provider)
            || !matches_optional(&self.country_code, &proxy.metadata.country_code)
            || !matches_optional(&self.region, &proxy.metadata.region)
        {
            return false;
        }
        if let Some(tag) = non_empty(&self.tag) {
            if !proxy.metadata.tags.contains(tag) {
                return false;
            }
        }
        if let Some(search) = non_empty(&self.search) {
            if !proxy
                .endpoint
                .host
                .to_lowercase()
                .contains(&search.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn matches_optional(filter: &Option<String>, value: &Option<String>) -> bool {
    match non_empty(filter) {
        Some(wanted) => value
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case(wanted)),
        None => true,
    }
}

/// Paginated response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: i64, page: i64, limit: i64) -> Self {
        let total_pages = (total as f64 / limit as f64).ceil() as i64;
        PaginatedResponse {
            items,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

/// Who is asking for proxies and what they need
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskContext {
    pub task_id: Option<String>,
    /// Maximum number of candidates to return
    pub limit: Option<usize>,
    pub provider: Option<String>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    /// Every listed tag must be present on the proxy
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl TaskContext {
    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::default()
        }
    }

    pub fn matches_metadata(&self, metadata: &ProxyMetadata) -> bool {
        matches_optional(&self.provider, &metadata.provider)
            && matches_optional(&self.country_code, &metadata.country_code)
            && matches_optional(&self.region, &metadata.region)
            && self.tags.is_subset(&metadata.tags)
    }
}

/// Bulk import request
#[derive(Debug, Clone, Deserialize)]
pub struct BulkImportRequest {
    pub text: String,
    #[serde(default)]
    pub defaults: ProxyOptions,
    #[serde(default)]
    pub replace_existing: bool,
}

/// A rejected bulk-import line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportLineError {
    /// 1-based line number in the submitted text
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkImportResult {
    pub success_count: usize,
    pub failed_count: usize,
    pub errors: Vec<ImportLineError>,
    pub imported: Vec<Proxy>,
}

/// Bulk delete proxies request
#[derive(Debug, Clone, Deserialize)]
pub struct BulkDeleteRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkDeleteResult {
    pub deleted_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignRequest {
    pub task_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuccessReport {
    pub response_time_ms: i64,
}

/// A failed request or probe, as reported to the health monitor
#[derive(Debug, Clone, Deserialize)]
pub struct FailureReport {
    pub message: String,
    pub code: Option<String>,
}

impl FailureReport {
    pub fn new(message: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            message: message.into(),
            code: code.map(str::to_string),
        }
    }
}

/// Outcome of a connectivity probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    pub response_time_ms: Option<u64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Pool-wide statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: i64,
    pub active: i64,
    pub working: i64,
    pub avg_success_rate: f64,
    pub total_requests: i64,
    pub total_failures: i64,
    pub status_breakdown: BTreeMap<String, i64>,
}

impl PoolStats {
    pub fn from_proxies(proxies: &[Proxy]) -> Self {
        let mut status_breakdown: BTreeMap<String, i64> = ProxyStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();

        let mut rated = 0usize;
        let mut rate_sum = 0.0;
        let mut stats = PoolStats {
            total: proxies.len() as i64,
            active: 0,
            working: 0,
            avg_success_rate: 0.0,
            total_requests: 0,
            total_failures: 0,
            status_breakdown: BTreeMap::new(),
        };

        for proxy in proxies {
            *status_breakdown
                .entry(proxy.status.as_str().to_string())
                .or_default() += 1;
            if proxy.status == ProxyStatus::Active {
                stats.active += 1;
            }
            if proxy.health.is_working {
                stats.working += 1;
            }
            stats.total_requests += proxy.health.total_requests;
            stats.total_failures += proxy.health.failed_requests;
            if proxy.health.total_requests > 0 {
                rated += 1;
                rate_sum += proxy.health.success_rate;
            }
        }

        if rated > 0 {
            stats.avg_success_rate = rate_sum / rated as f64;
        }
        stats.status_breakdown = status_breakdown;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::proxy::tests::test_proxy;

    #[test]
    fn test_offset_saturates_on_huge_page() {
        let params = ProxyListParams {
            page: Some(i64::MAX),
            limit: Some(100),
            ..Default::default()
        };
        assert_eq!(params.offset(), i64::MAX);

        let params = ProxyListParams {
            page: Some(3),
            limit: Some(10),
            ..Default::default()
        };
        assert_eq!(params.offset(), 20);
    }

    #[test]
    fn test_paginated_response_total_pages() {
        let resp = PaginatedResponse::new(vec![1, 2, 3], 0, 1, 10);
        assert_eq!(resp.total_pages, 0);

        let resp = PaginatedResponse::new(vec![1; 10], 10, 1, 10);
        assert_eq!(resp.total_pages, 1);

        let resp = PaginatedResponse::new(vec![1; 10], 11, 1, 10);
        assert_eq!(resp.total_pages, 2);
    }

    #[test]
    fn test_list_params_pagination_bounds() {
        let params = ProxyListParams {
            page: Some(0),
            limit: Some(1000),
            ..Default::default()
        };
        assert_eq!(params.page(), 1);
        assert_eq!(params.limit(), 100);
        assert_eq!(params.offset(), 0);

        let params = ProxyListParams {
            page: Some(3),
            limit: None,
            ..Default::default()
        };
        assert_eq!(params.offset(), 40);
    }

    #[test]
    fn test_list_params_matches() {
        let mut proxy = test_proxy("a");
        proxy.metadata.provider = Some("Acme".to_string());
        proxy.metadata.tags.insert("residential".to_string());

        let params = ProxyListParams {
            provider: Some("acme".to_string()),
            tag: Some("residential".to_string()),
            search: Some("127.0".to_string()),
            ..Default::default()
        };
        assert!(params.matches(&proxy));

        let params = ProxyListParams {
            country_code: Some("DE".to_string()),
            ..Default::default()
        };
        assert!(!params.matches(&proxy));

        let params = ProxyListParams {
            status: Some(ProxyStatus::Blacklisted),
            ..Default::default()
        };
        assert!(!params.matches(&proxy));
    }

    #[test]
    fn test_options_overlay_defaults() {
        let options = ProxyOptions {
            max_concurrent_usage: Some(4),
            ..Default::default()
        };
        let limits = options.limits(ProxyLimits::default());
        assert_eq!(limits.max_concurrent_usage, 4);
        assert_eq!(limits.requests_per_minute_limit, 60);
        assert_eq!(limits.rotation_weight, 5);
    }

    #[test]
    fn test_create_request_flattens_options() {
        let req: CreateProxyRequest = serde_json::from_value(serde_json::json!({
            "raw": "1.2.3.4:8080:u:p",
            "rotation_weight": 9,
            "metadata": { "country_code": "US", "tags": ["dc"] }
        }))
        .unwrap();
        assert_eq!(req.options.rotation_weight, Some(9));
        assert_eq!(req.options.metadata.country_code.as_deref(), Some("US"));
        assert!(req.options.metadata.tags.contains("dc"));
    }

    #[test]
    fn test_pool_stats_from_proxies() {
        let mut a = test_proxy("a");
        a.health.total_requests = 10;
        a.health.failed_requests = 2;
        a.health.success_rate = 80.0;

        let mut b = test_proxy("b");
        b.status = ProxyStatus::Blacklisted;
        b.health.is_working = false;

        let c = test_proxy("c");

        let stats = PoolStats::from_proxies(&[a, b, c]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.working, 2);
        assert_eq!(stats.total_requests, 10);
        assert_eq!(stats.total_failures, 2);
        assert!((stats.avg_success_rate - 80.0).abs() < 1e-9);
        assert_eq!(stats.status_breakdown["active"], 2);
        assert_eq!(stats.status_breakdown["blacklisted"], 1);
        assert_eq!(stats.status_breakdown["maintenance"], 0);
    }
}
