//! Proxy Pool Server - Entry Point
//!
//! Starts the API server and the background health checker with graceful
//! shutdown support.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxy_pool::api::ApiServer;
use proxy_pool::config::{Config, LogConfig, StoreBackend};
use proxy_pool::database::Database;
use proxy_pool::pool::{HealthChecker, HealthCheckerHandle, HttpConnectProbe, ProxyPool};
use proxy_pool::repository::{MemoryProxyStore, PgProxyStore, ProxyStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config.log);

    info!("Starting Proxy Pool Server");

    let mut database = None;
    let store: Arc<dyn ProxyStore> = match config.store {
        StoreBackend::Memory => {
            warn!("Using in-memory store; proxies are lost on restart");
            Arc::new(MemoryProxyStore::new())
        }
        StoreBackend::Postgres => {
            let db = Database::new(&config.database)
                .await
                .context("failed to connect to database")?;
            info!("Connected to database");

            db.run_migrations()
                .await
                .context("failed to run database migrations")?;
            info!("Database migrations complete");

            let store = PgProxyStore::new(db.pool().clone());
            database = Some(db);
            Arc::new(store)
        }
    };

    let probe = Arc::new(HttpConnectProbe::from_url(&config.healthcheck.url));
    info!(target = %probe.target(), "Connectivity probe configured");

    let pool = ProxyPool::new(store, probe, config.pool.clone());

    let (shutdown_tx, _) = watch::channel(false);

    let (health_handle, health_shutdown) = HealthCheckerHandle::new();
    let health_task = if config.healthcheck.enabled {
        let checker = HealthChecker::new(pool.clone(), config.healthcheck.checker_config());
        Some(tokio::spawn(async move {
            checker.run(health_shutdown).await;
        }))
    } else {
        info!("Background health checks disabled");
        None
    };

    let api_server = ApiServer::new(config.api.clone(), pool);
    let api_shutdown = shutdown_tx.subscribe();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    });

    info!("Server started - API: {}", config.api_addr());

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    health_handle.shutdown();

    let _ = api_task.await;
    if let Some(task) = health_task {
        let _ = task.await;
    }

    if let Some(db) = database {
        db.close().await;
    }

    info!("Proxy Pool Server stopped");
    Ok(())
}

/// `RUST_LOG` wins over `LOG_LEVEL`; `LOG_FORMAT=json` switches to JSON lines
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("proxy_pool={},tower_http=debug", log.level))
    });

    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
