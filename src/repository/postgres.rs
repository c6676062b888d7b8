//! PostgreSQL proxy store
//!
//! Acquire and release are single guarded `UPDATE` statements, so the
//! database evaluates the concurrency and quota guards itself. General
//! mutations lock the row with `SELECT ... FOR UPDATE` inside a transaction.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use super::{Mutation, ProxyStore};
use crate::error::{PoolError, Result};
use crate::models::{
    Assignment, Capacity, Endpoint, LastError, PaginatedResponse, Proxy, ProxyHealth,
    ProxyListParams, ProxyMetadata, ProxyStatus, RateLimitWindow, MINUTE_WINDOW_SECS,
};
use crate::pool::usage;

/// Column order shared by every SELECT, INSERT and full-row UPDATE
const COLUMNS: [&str; 32] = [
    "id",
    "host",
    "port",
    "username",
    "password",
    "raw",
    "provider",
    "region",
    "country_code",
    "tags",
    "status",
    "is_working",
    "last_tested_at",
    "last_response_time_ms",
    "success_rate",
    "total_requests",
    "failed_requests",
    "consecutive_failures",
    "consecutive_successes",
    "last_error",
    "auto_disabled_at",
    "current_usage",
    "max_concurrent_usage",
    "rotation_weight",
    "requests_per_minute_limit",
    "requests_this_minute",
    "minute_window_start",
    "assignments",
    "blacklisted_tasks",
    "whitelisted_tasks",
    "created_at",
    "updated_at",
];

/// Condition true when the minute window has rolled over. The current time
/// is bound at `$now_param` and the window length in seconds right after it.
fn window_expired(now_param: usize) -> String {
    format!(
        "(${} - minute_window_start) >= (${} * INTERVAL '1 second')",
        now_param,
        now_param + 1
    )
}

/// Attempts before giving up on an acquire that keeps racing a writer
const ACQUIRE_ATTEMPTS: usize = 3;

type ProxyQuery<'q> = QueryAs<'q, Postgres, ProxyRow, PgArguments>;

#[derive(Debug, FromRow)]
struct ProxyRow {
    id: String,
    host: String,
    port: i32,
    username: String,
    password: String,
    raw: String,
    provider: Option<String>,
    region: Option<String>,
    country_code: Option<String>,
    tags: Json<BTreeSet<String>>,
    status: String,
    is_working: bool,
    last_tested_at: Option<DateTime<Utc>>,
    last_response_time_ms: Option<i64>,
    success_rate: f64,
    total_requests: i64,
    failed_requests: i64,
    consecutive_failures: i32,
    consecutive_successes: i32,
    last_error: Option<Json<LastError>>,
    auto_disabled_at: Option<DateTime<Utc>>,
    current_usage: i32,
    max_concurrent_usage: i32,
    rotation_weight: i32,
    requests_per_minute_limit: i32,
    requests_this_minute: i32,
    minute_window_start: DateTime<Utc>,
    assignments: Json<Vec<Assignment>>,
    blacklisted_tasks: Json<BTreeSet<String>>,
    whitelisted_tasks: Json<BTreeSet<String>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProxyRow> for Proxy {
    type Error = PoolError;

    fn try_from(row: ProxyRow) -> Result<Self> {
        let status = ProxyStatus::from_str(&row.status).ok_or_else(|| {
            PoolError::Internal(format!("unknown status {:?} on proxy {}", row.status, row.id))
        })?;
        let port = u16::try_from(row.port).map_err(|_| {
            PoolError::Internal(format!("port {} out of range on proxy {}", row.port, row.id))
        })?;

        Ok(Proxy {
            id: row.id,
            endpoint: Endpoint {
                host: row.host,
                port,
                username: row.username,
                password: row.password,
                raw: row.raw,
            },
            metadata: ProxyMetadata {
                provider: row.provider,
                region: row.region,
                country_code: row.country_code,
                tags: row.tags.0,
            },
            status,
            health: ProxyHealth {
                is_working: row.is_working,
                last_tested_at: row.last_tested_at,
                last_response_time_ms: row.last_response_time_ms,
                success_rate: row.success_rate,
                total_requests: row.total_requests,
                failed_requests: row.failed_requests,
                consecutive_failures: row.consecutive_failures,
                consecutive_successes: row.consecutive_successes,
                last_error: row.last_error.map(|e| e.0),
                auto_disabled_at: row.auto_disabled_at,
            },
            capacity: Capacity {
                current_usage: row.current_usage,
                max_concurrent_usage: row.max_concurrent_usage,
                rotation_weight: row.rotation_weight,
            },
            rate_limit: RateLimitWindow {
                requests_per_minute_limit: row.requests_per_minute_limit,
                requests_this_minute: row.requests_this_minute,
                minute_window_start: row.minute_window_start,
            },
            assignments: row.assignments.0,
            blacklisted_tasks: row.blacklisted_tasks.0,
            whitelisted_tasks: row.whitelisted_tasks.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn column_list() -> String {
    COLUMNS.join(", ")
}

fn placeholders(range: std::ops::RangeInclusive<usize>) -> String {
    range
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_sql(tail: &str) -> String {
    format!("SELECT {} FROM proxies {}", column_list(), tail)
}

fn insert_sql() -> String {
    format!(
        "INSERT INTO proxies ({cols}) VALUES ({}) RETURNING {cols}",
        placeholders(1..=COLUMNS.len()),
        cols = column_list()
    )
}

/// Overwrite every column but `id`, which is bound as `$1`
fn update_sql() -> String {
    format!(
        "UPDATE proxies SET ({}) = ({}) WHERE id = $1 RETURNING {}",
        COLUMNS[1..].join(", "),
        placeholders(2..=COLUMNS.len()),
        column_list()
    )
}

fn acquire_sql() -> String {
    format!(
        r#"
        UPDATE proxies SET
            current_usage = current_usage + 1,
            requests_this_minute = CASE WHEN {expired} THEN 1 ELSE requests_this_minute + 1 END,
            minute_window_start = CASE WHEN {expired} THEN $2 ELSE minute_window_start END
        WHERE id = $1
          AND current_usage < max_concurrent_usage
          AND (CASE WHEN {expired} THEN 0 ELSE requests_this_minute END) < requests_per_minute_limit
        RETURNING {cols}
        "#,
        expired = window_expired(2),
        cols = column_list()
    )
}

fn usable_sql() -> String {
    select_sql(&format!(
        r#"
        WHERE status = 'active'
          AND is_working
          AND current_usage < max_concurrent_usage
          AND (CASE WHEN {} THEN 0 ELSE requests_this_minute END) < requests_per_minute_limit
        "#,
        window_expired(1)
    ))
}

/// Bind every column of `proxy` in `COLUMNS` order
fn bind_proxy<'q>(query: ProxyQuery<'q>, proxy: &'q Proxy) -> ProxyQuery<'q> {
    query
        .bind(&proxy.id)
        .bind(&proxy.endpoint.host)
        .bind(i32::from(proxy.endpoint.port))
        .bind(&proxy.endpoint.username)
        .bind(&proxy.endpoint.password)
        .bind(&proxy.endpoint.raw)
        .bind(&proxy.metadata.provider)
        .bind(&proxy.metadata.region)
        .bind(&proxy.metadata.country_code)
        .bind(Json(&proxy.metadata.tags))
        .bind(proxy.status.as_str())
        .bind(proxy.health.is_working)
        .bind(proxy.health.last_tested_at)
        .bind(proxy.health.last_response_time_ms)
        .bind(proxy.health.success_rate)
        .bind(proxy.health.total_requests)
        .bind(proxy.health.failed_requests)
        .bind(proxy.health.consecutive_failures)
        .bind(proxy.health.consecutive_successes)
        .bind(proxy.health.last_error.as_ref().map(Json))
        .bind(proxy.health.auto_disabled_at)
        .bind(proxy.capacity.current_usage)
        .bind(proxy.capacity.max_concurrent_usage)
        .bind(proxy.capacity.rotation_weight)
        .bind(proxy.rate_limit.requests_per_minute_limit)
        .bind(proxy.rate_limit.requests_this_minute)
        .bind(proxy.rate_limit.minute_window_start)
        .bind(Json(&proxy.assignments))
        .bind(Json(&proxy.blacklisted_tasks))
        .bind(Json(&proxy.whitelisted_tasks))
        .bind(proxy.created_at)
        .bind(proxy.updated_at)
}

fn insert_error(e: sqlx::Error, id: &str) -> PoolError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            return PoolError::Duplicate { id: id.to_string() };
        }
    }
    PoolError::Database(e)
}

fn filter_value(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| !v.is_empty()).map(str::to_string)
}

/// Append the WHERE conditions for `params` to a query ending in `WHERE 1=1`
fn push_filters(query: &mut QueryBuilder<'_, Postgres>, params: &ProxyListParams) {
    if let Some(status) = params.status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(is_working) = params.is_working {
        query.push(" AND is_working = ").push_bind(is_working);
    }
    for (column, value) in [
        ("provider", &params.provider),
        ("country_code", &params.country_code),
        ("region", &params.region),
    ] {
        if let Some(value) = filter_value(value) {
            query
                .push(format!(" AND LOWER({}) = LOWER(", column))
                .push_bind(value)
                .push(")");
        }
    }
    if let Some(tag) = filter_value(&params.tag) {
        query
            .push(" AND tags @> jsonb_build_array(")
            .push_bind(tag)
            .push("::text)");
    }
    if let Some(search) = filter_value(&params.search) {
        query
            .push(" AND host ILIKE ")
            .push_bind(contains_pattern(&search))
            .push(" ESCAPE '\\'");
    }
}

/// `ILIKE` pattern matching `needle` literally anywhere in the column
fn contains_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Proxy store backed by a `proxies` table
#[derive(Clone)]
pub struct PgProxyStore {
    pool: PgPool,
}

impl PgProxyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProxyStore for PgProxyStore {
    async fn insert(&self, proxy: Proxy) -> Result<Proxy> {
        let sql = insert_sql();
        let row = bind_proxy(sqlx::query_as(&sql), &proxy)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| insert_error(e, &proxy.id))?;

        Proxy::try_from(row)
    }

    async fn get(&self, id: &str) -> Result<Option<Proxy>> {
        let sql = select_sql("WHERE id = $1");
        let row = sqlx::query_as::<_, ProxyRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Proxy::try_from).transpose()
    }

    async fn list(&self, params: &ProxyListParams) -> Result<PaginatedResponse<Proxy>> {
        let mut count_query =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM proxies WHERE 1=1");
        push_filters(&mut count_query, params);

        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut data_query = QueryBuilder::<Postgres>::new(select_sql("WHERE 1=1"));
        push_filters(&mut data_query, params);
        data_query
            .push(" ORDER BY created_at DESC, id ASC LIMIT ")
            .push_bind(params.limit())
            .push(" OFFSET ")
            .push_bind(params.offset());

        let rows: Vec<ProxyRow> = data_query.build_query_as().fetch_all(&self.pool).await?;
        let items = rows
            .into_iter()
            .map(Proxy::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(PaginatedResponse::new(
            items,
            total,
            params.page(),
            params.limit(),
        ))
    }

    async fn all(&self) -> Result<Vec<Proxy>> {
        let sql = select_sql("ORDER BY created_at DESC, id ASC");
        let rows = sqlx::query_as::<_, ProxyRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Proxy::try_from).collect()
    }

    async fn modify(&self, id: &str, mutation: Mutation<'_>) -> Result<Proxy> {
        let mut tx = self.pool.begin().await?;

        let sql = select_sql("WHERE id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, ProxyRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PoolError::not_found(id))?;

        let mut proxy = Proxy::try_from(row)?;
        // Dropping `tx` on error rolls the transaction back.
        mutation(&mut proxy)?;

        let sql = update_sql();
        let row = bind_proxy(sqlx::query_as(&sql), &proxy)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Proxy::try_from(row)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM proxies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_many(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM proxies WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn replace_all(&self, proxies: Vec<Proxy>) -> Result<Vec<Proxy>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("LOCK TABLE proxies IN ACCESS EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;
        let wiped = sqlx::query("DELETE FROM proxies")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let sql = insert_sql();
        let mut inserted = Vec::with_capacity(proxies.len());
        for proxy in &proxies {
            let row = bind_proxy(sqlx::query_as(&sql), proxy)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| insert_error(e, &proxy.id))?;
            inserted.push(Proxy::try_from(row)?);
        }

        tx.commit().await?;

        info!(
            wiped = wiped,
            inserted = inserted.len(),
            "Replaced proxies table"
        );
        Ok(inserted)
    }

    async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM proxies")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn list_usable(&self, now: DateTime<Utc>) -> Result<Vec<Proxy>> {
        let sql = usable_sql();
        let rows = sqlx::query_as::<_, ProxyRow>(&sql)
            .bind(now)
            .bind(MINUTE_WINDOW_SECS as f64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Proxy::try_from).collect()
    }

    async fn try_acquire(&self, id: &str, now: DateTime<Utc>) -> Result<Proxy> {
        let sql = acquire_sql();
        let mut max = 0;

        for _ in 0..ACQUIRE_ATTEMPTS {
            let row = sqlx::query_as::<_, ProxyRow>(&sql)
                .bind(id)
                .bind(now)
                .bind(MINUTE_WINDOW_SECS as f64)
                .fetch_optional(&self.pool)
                .await?;

            if let Some(row) = row {
                return Proxy::try_from(row);
            }

            // No row matched: find out which guard failed.
            let mut snapshot = self.get(id).await?.ok_or_else(|| PoolError::not_found(id))?;
            max = snapshot.capacity.max_concurrent_usage;
            usage::try_acquire(&mut snapshot, now)?;

            debug!(id = %id, "Acquire raced a concurrent update, retrying");
        }

        Err(PoolError::ConcurrencyExceeded {
            id: id.to_string(),
            max,
        })
    }

    async fn release_usage(&self, id: &str) -> Result<Proxy> {
        let sql = format!(
            "UPDATE proxies SET current_usage = GREATEST(current_usage - 1, 0) WHERE id = $1 RETURNING {}",
            column_list()
        );
        let row = sqlx::query_as::<_, ProxyRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PoolError::not_found(id))?;

        Proxy::try_from(row)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::proxy::tests::test_proxy;

    fn row_for(proxy: &Proxy) -> ProxyRow {
        ProxyRow {
            id: proxy.id.clone(),
            host: proxy.endpoint.host.clone(),
            port: i32::from(proxy.endpoint.port),
            username: proxy.endpoint.username.clone(),
            password: proxy.endpoint.password.clone(),
            raw: proxy.endpoint.raw.clone(),
            provider: proxy.metadata.provider.clone(),
            region: proxy.metadata.region.clone(),
            country_code: proxy.metadata.country_code.clone(),
            tags: Json(proxy.metadata.tags.clone()),
            status: proxy.status.as_str().to_string(),
            is_working: proxy.health.is_working,
            last_tested_at: proxy.health.last_tested_at,
            last_response_time_ms: proxy.health.last_response_time_ms,
            success_rate: proxy.health.success_rate,
            total_requests: proxy.health.total_requests,
            failed_requests: proxy.health.failed_requests,
            consecutive_failures: proxy.health.consecutive_failures,
            consecutive_successes: proxy.health.consecutive_successes,
            last_error: proxy.health.last_error.clone().map(Json),
            auto_disabled_at: proxy.health.auto_disabled_at,
            current_usage: proxy.capacity.current_usage,
            max_concurrent_usage: proxy.capacity.max_concurrent_usage,
            rotation_weight: proxy.capacity.rotation_weight,
            requests_per_minute_limit: proxy.rate_limit.requests_per_minute_limit,
            requests_this_minute: proxy.rate_limit.requests_this_minute,
            minute_window_start: proxy.rate_limit.minute_window_start,
            assignments: Json(proxy.assignments.clone()),
            blacklisted_tasks: Json(proxy.blacklisted_tasks.clone()),
            whitelisted_tasks: Json(proxy.whitelisted_tasks.clone()),
            created_at: proxy.created_at,
            updated_at: proxy.updated_at,
        }
    }

    #[test]
    fn test_row_conversion() {
        let mut proxy = test_proxy("a");
        proxy.status = ProxyStatus::Maintenance;
        proxy.metadata.tags.insert("dc".to_string());
        proxy.whitelisted_tasks.insert("event-1".to_string());

        let converted = Proxy::try_from(row_for(&proxy)).unwrap();
        assert_eq!(converted, proxy);
    }

    #[test]
    fn test_row_conversion_rejects_bad_values() {
        let proxy = test_proxy("a");

        let mut row = row_for(&proxy);
        row.status = "failed".to_string();
        assert!(matches!(Proxy::try_from(row), Err(PoolError::Internal(_))));

        let mut row = row_for(&proxy);
        row.port = 70_000;
        assert!(matches!(Proxy::try_from(row), Err(PoolError::Internal(_))));
    }

    #[test]
    fn test_generated_sql_shapes() {
        let insert = insert_sql();
        assert!(insert.contains("$32)"));
        assert!(!insert.contains("$33"));

        let update = update_sql();
        assert!(update.starts_with("UPDATE proxies SET (host, port,"));
        assert!(update.contains("WHERE id = $1"));
        assert!(update.contains("$32)"));

        let acquire = acquire_sql();
        assert!(acquire.contains("current_usage < max_concurrent_usage"));
        assert!(acquire.contains("< requests_per_minute_limit"));
        assert!(acquire.contains("($2 - minute_window_start) >= ($3 * INTERVAL"));

        assert!(usable_sql().contains("($1 - minute_window_start) >= ($2 * INTERVAL"));
    }

    #[test]
    fn test_list_filters() {
        let params = ProxyListParams {
            status: Some(ProxyStatus::Active),
            provider: Some("acme".to_string()),
            region: Some(String::new()),
            tag: Some("dc".to_string()),
            search: Some("10.0".to_string()),
            ..Default::default()
        };

        let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM proxies WHERE 1=1");
        push_filters(&mut query, &params);
        let sql = query.sql();

        assert!(sql.contains("status = $1"));
        assert!(sql.contains("LOWER(provider) = LOWER($2)"));
        assert!(!sql.contains("region"));
        assert!(sql.contains("tags @> jsonb_build_array($3::text)"));
        assert!(sql.contains("host ILIKE $4 ESCAPE '\\'"));
    }

    #[test]
    fn test_search_wildcards_match_literally() {
        assert_eq!(contains_pattern("10.0"), "%10.0%");
        assert_eq!(contains_pattern("a_b%c"), "%a\\_b\\%c%");
        assert_eq!(contains_pattern("x\\y"), "%x\\\\y%");
    }
}
