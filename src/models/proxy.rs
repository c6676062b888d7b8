use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of the fixed request-quota window
pub const MINUTE_WINDOW_SECS: i64 = 60;

/// Proxy status
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    #[default]
    Active,
    Inactive,
    Blacklisted,
    Maintenance,
}

impl ProxyStatus {
    pub const ALL: [ProxyStatus; 4] = [
        ProxyStatus::Active,
        ProxyStatus::Inactive,
        ProxyStatus::Blacklisted,
        ProxyStatus::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Active => "active",
            ProxyStatus::Inactive => "inactive",
            ProxyStatus::Blacklisted => "blacklisted",
            ProxyStatus::Maintenance => "maintenance",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(ProxyStatus::Active),
            "inactive" => Some(ProxyStatus::Inactive),
            "blacklisted" => Some(ProxyStatus::Blacklisted),
            "maintenance" => Some(ProxyStatus::Maintenance),
            _ => None,
        }
    }

    /// Statuses the health checker keeps probing
    pub fn is_probed(&self) -> bool {
        matches!(self, ProxyStatus::Active | ProxyStatus::Inactive)
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a recorded outcome came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeSource {
    #[default]
    Request,
    Healthcheck,
}

/// Network location and credentials of a proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    /// The `host:port:user:pass` line the record was created from
    #[serde(skip_serializing, default)]
    pub raw: String,
}

impl Endpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProxyMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub source: OutcomeSource,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyHealth {
    pub is_working: bool,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_response_time_ms: Option<i64>,
    /// Percentage in 0..=100, 0 until an outcome is recorded
    pub success_rate: f64,
    pub total_requests: i64,
    pub failed_requests: i64,
    pub consecutive_failures: i32,
    pub consecutive_successes: i32,
    pub last_error: Option<LastError>,
    /// Set only when the health monitor itself disabled the proxy
    pub auto_disabled_at: Option<DateTime<Utc>>,
}

impl Default for ProxyHealth {
    fn default() -> Self {
        Self {
            is_working: true,
            last_tested_at: None,
            last_response_time_ms: None,
            success_rate: 0.0,
            total_requests: 0,
            failed_requests: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
            auto_disabled_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub current_usage: i32,
    pub max_concurrent_usage: i32,
    /// Selection priority, 0..=10
    pub rotation_weight: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub requests_per_minute_limit: i32,
    pub requests_this_minute: i32,
    pub minute_window_start: DateTime<Utc>,
}

impl RateLimitWindow {
    pub fn window_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.minute_window_start).num_seconds() >= MINUTE_WINDOW_SECS
    }

    /// Requests still allowed in the window that applies at `now`
    pub fn remaining(&self, now: DateTime<Utc>) -> i32 {
        let used = if self.window_expired(now) {
            0
        } else {
            self.requests_this_minute
        };
        (self.requests_per_minute_limit - used).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: String,
    pub assigned_at: DateTime<Utc>,
}

/// Operator-tunable limits applied to new proxies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyLimits {
    pub max_concurrent_usage: i32,
    pub requests_per_minute_limit: i32,
    pub rotation_weight: i32,
}

impl Default for ProxyLimits {
    fn default() -> Self {
        Self {
            max_concurrent_usage: 1,
            requests_per_minute_limit: 60,
            rotation_weight: 5,
        }
    }
}

/// Proxy entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    pub id: String,
    pub endpoint: Endpoint,
    pub metadata: ProxyMetadata,
    pub status: ProxyStatus,
    pub health: ProxyHealth,
    pub capacity: Capacity,
    pub rate_limit: RateLimitWindow,
    pub assignments: Vec<Assignment>,
    pub blacklisted_tasks: BTreeSet<String>,
    pub whitelisted_tasks: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proxy {
    /// Fresh record with zeroed counters
    pub fn new(id: String, endpoint: Endpoint, limits: ProxyLimits, now: DateTime<Utc>) -> Self {
        Self {
            id,
            endpoint,
            metadata: ProxyMetadata::default(),
            status: ProxyStatus::Active,
            health: ProxyHealth::default(),
            capacity: Capacity {
                current_usage: 0,
                max_concurrent_usage: limits.max_concurrent_usage,
                rotation_weight: limits.rotation_weight,
            },
            rate_limit: RateLimitWindow {
                requests_per_minute_limit: limits.requests_per_minute_limit,
                requests_this_minute: 0,
                minute_window_start: now,
            },
            assignments: Vec::new(),
            blacklisted_tasks: BTreeSet::new(),
            whitelisted_tasks: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn address(&self) -> String {
        self.endpoint.address()
    }

    pub fn has_free_slot(&self) -> bool {
        self.capacity.current_usage < self.capacity.max_concurrent_usage
    }

    /// Whether a worker could acquire this proxy right now
    ///
    /// Derived from status, health, concurrency and quota; never stored.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.status == ProxyStatus::Active
            && self.health.is_working
            && self.has_free_slot()
            && self.rate_limit.remaining(now) > 0
    }

    /// Blacklist / whitelist check for a task
    pub fn accepts_task(&self, task_id: Option<&str>) -> bool {
        let Some(task_id) = task_id else {
            return true;
        };

        if self.blacklisted_tasks.contains(task_id) {
            return false;
        }

        self.whitelisted_tasks.is_empty() || self.whitelisted_tasks.contains(task_id)
    }

    pub fn is_assigned_to(&self, task_id: &str) -> bool {
        self.assignments.iter().any(|a| a.task_id == task_id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn test_proxy(id: &str) -> Proxy {
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port: 8080,
            username: "user".to_string(),
            password: "pass".to_string(),
            raw: "127.0.0.1:8080:user:pass".to_string(),
        };
        Proxy::new(id.to_string(), endpoint, ProxyLimits::default(), Utc::now())
    }

    #[test]
    fn test_proxy_status_parsing() {
        assert_eq!(ProxyStatus::from_str("ACTIVE"), Some(ProxyStatus::Active));
        assert_eq!(
            ProxyStatus::from_str("maintenance"),
            Some(ProxyStatus::Maintenance)
        );
        assert_eq!(ProxyStatus::from_str("failed"), None);
        assert_eq!(ProxyStatus::Blacklisted.to_string(), "blacklisted");

        assert!(ProxyStatus::Inactive.is_probed());
        assert!(!ProxyStatus::Blacklisted.is_probed());
    }

    #[test]
    fn test_endpoint_formats() {
        let proxy = test_proxy("a");
        assert_eq!(proxy.address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_credentials_not_serialized() {
        let proxy = test_proxy("a");
        let json = serde_json::to_value(&proxy).unwrap();
        assert!(json["endpoint"].get("password").is_none());
        assert!(json["endpoint"].get("raw").is_none());
        assert_eq!(json["endpoint"]["username"], "user");
        assert_eq!(json["status"], "active");
    }

    #[test]
    fn test_rate_window_remaining() {
        let now = Utc::now();
        let mut window = RateLimitWindow {
            requests_per_minute_limit: 60,
            requests_this_minute: 59,
            minute_window_start: now - Duration::seconds(30),
        };
        assert_eq!(window.remaining(now), 1);

        window.requests_this_minute = 60;
        assert_eq!(window.remaining(now), 0);

        window.minute_window_start = now - Duration::seconds(60);
        assert!(window.window_expired(now));
        assert_eq!(window.remaining(now), 60);
    }

    #[test]
    fn test_is_available() {
        let now = Utc::now();
        let mut proxy = test_proxy("a");
        assert!(proxy.is_available(now));

        proxy.capacity.current_usage = 1;
        assert!(!proxy.is_available(now));
        proxy.capacity.current_usage = 0;

        proxy.health.is_working = false;
        assert!(!proxy.is_available(now));
        proxy.health.is_working = true;

        proxy.status = ProxyStatus::Maintenance;
        assert!(!proxy.is_available(now));
    }

    #[test]
    fn test_accepts_task() {
        let mut proxy = test_proxy("a");
        assert!(proxy.accepts_task(None));
        assert!(proxy.accepts_task(Some("event-1")));

        proxy.blacklisted_tasks.insert("event-1".to_string());
        assert!(!proxy.accepts_task(Some("event-1")));
        assert!(proxy.accepts_task(Some("event-2")));

        proxy.whitelisted_tasks.insert("event-3".to_string());
        assert!(!proxy.accepts_task(Some("event-2")));
        assert!(proxy.accepts_task(Some("event-3")));
        assert!(proxy.accepts_task(None));
    }
}
