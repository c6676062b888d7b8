use crate::error::Result;
use sqlx::{Executor, PgPool};
use tracing::info;

/// Run all database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    create_migrations_table(pool).await?;

    for (version, name, sql) in get_migrations() {
        if !is_migration_applied(pool, version).await? {
            info!(version = version, name = name, "Applying migration");

            // Multi-statement scripts need the simple query protocol.
            pool.execute(sql).await?;
            record_migration(pool, version, name).await?;

            info!(version = version, name = name, "Migration applied successfully");
        }
    }

    Ok(())
}

async fn create_migrations_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn is_migration_applied(pool: &PgPool, version: i32) -> Result<bool> {
    let applied = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM schema_migrations WHERE version = $1",
    )
    .bind(version)
    .fetch_one(pool)
    .await?;

    Ok(applied > 0)
}

async fn record_migration(pool: &PgPool, version: i32, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

/// All migrations in order
fn get_migrations() -> Vec<(i32, &'static str, &'static str)> {
    vec![
        (1, "proxies_table", MIGRATION_001_PROXIES),
        (2, "proxies_selection_index", MIGRATION_002_SELECTION_INDEX),
    ]
}

// Migration 1: proxies table
const MIGRATION_001_PROXIES: &str = r#"
CREATE TABLE IF NOT EXISTS proxies (
    id VARCHAR(36) PRIMARY KEY,
    host VARCHAR(253) NOT NULL,
    port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
    username VARCHAR(255) NOT NULL,
    password VARCHAR(255) NOT NULL,
    raw TEXT NOT NULL,

    provider VARCHAR(255),
    region VARCHAR(255),
    country_code VARCHAR(16),
    tags JSONB NOT NULL DEFAULT '[]',

    status VARCHAR(20) NOT NULL DEFAULT 'active',
    is_working BOOLEAN NOT NULL DEFAULT true,
    last_tested_at TIMESTAMPTZ,
    last_response_time_ms BIGINT,
    success_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
    total_requests BIGINT NOT NULL DEFAULT 0,
    failed_requests BIGINT NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    consecutive_successes INTEGER NOT NULL DEFAULT 0,
    last_error JSONB,
    auto_disabled_at TIMESTAMPTZ,

    current_usage INTEGER NOT NULL DEFAULT 0 CHECK (current_usage >= 0),
    max_concurrent_usage INTEGER NOT NULL DEFAULT 1 CHECK (max_concurrent_usage >= 1),
    rotation_weight INTEGER NOT NULL DEFAULT 5 CHECK (rotation_weight BETWEEN 0 AND 10),
    requests_per_minute_limit INTEGER NOT NULL DEFAULT 60 CHECK (requests_per_minute_limit >= 1),
    requests_this_minute INTEGER NOT NULL DEFAULT 0 CHECK (requests_this_minute >= 0),
    minute_window_start TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    assignments JSONB NOT NULL DEFAULT '[]',
    blacklisted_tasks JSONB NOT NULL DEFAULT '[]',
    whitelisted_tasks JSONB NOT NULL DEFAULT '[]',

    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT proxies_usage_within_cap CHECK (current_usage <= max_concurrent_usage),
    CONSTRAINT proxies_status_known
        CHECK (status IN ('active', 'inactive', 'blacklisted', 'maintenance'))
);

CREATE INDEX IF NOT EXISTS idx_proxies_status ON proxies(status);
CREATE INDEX IF NOT EXISTS idx_proxies_created_at ON proxies(created_at DESC, id);
CREATE INDEX IF NOT EXISTS idx_proxies_tags ON proxies USING GIN (tags);

CREATE OR REPLACE FUNCTION update_updated_at_column()
RETURNS TRIGGER AS $$
BEGIN
    NEW.updated_at = NOW();
    RETURN NEW;
END;
$$ language 'plpgsql';

DROP TRIGGER IF EXISTS update_proxies_updated_at ON proxies;
CREATE TRIGGER update_proxies_updated_at
    BEFORE UPDATE ON proxies
    FOR EACH ROW
    EXECUTE FUNCTION update_updated_at_column();
"#;

// Migration 2: partial index covering the selector's hot filter
const MIGRATION_002_SELECTION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_proxies_selectable
    ON proxies(rotation_weight DESC, success_rate DESC, current_usage)
    WHERE status = 'active' AND is_working;
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        let migrations = get_migrations();
        let versions: Vec<i32> = migrations.iter().map(|(v, _, _)| *v).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn test_schema_has_guard_constraints() {
        assert!(MIGRATION_001_PROXIES.contains("current_usage <= max_concurrent_usage"));
        assert!(MIGRATION_001_PROXIES.contains("id VARCHAR(36) PRIMARY KEY"));
    }
}
