//! Turnstile — QR admission token validation engine.
//!
//! Bootstrap: configuration, database pool + migrations, shared state,
//! maintenance timers, HTTP server with graceful shutdown.

mod api;
mod breaker;
mod cache;
mod config;
mod crypto;
mod decoder;
mod error;
mod fraud;
mod offline;
mod rules;
mod store;
mod types;
mod validator;

use crate::cache::HotCache;
use crate::config::Config;
use crate::fraud::FraudAnalyzer;
use crate::offline::OfflineStore;
use crate::rules::RulesClient;
use crate::store::ScanStore;
use crate::validator::Validator;
use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("turnstile=info")),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        host = %config.host,
        port = config.port,
        rules_service = %config.rules_service_url,
        "starting turnstile"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max)
        .idle_timeout(config.db_idle_timeout)
        .acquire_timeout(config.db_connection_timeout)
        .connect(&config.database_url)
        .await
        .context("connecting to the scan database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("running schema migrations")?;

    let offline = Arc::new(OfflineStore::new(
        config.offline_cache_ttl,
        config.offline_snapshot_path.clone(),
    ));
    offline.restore();

    let validator = Validator::new(
        config.clone(),
        Arc::new(RulesClient::new(&config)),
        ScanStore::new(pool),
        Arc::new(HotCache::new(config.cache_timeout)),
        Arc::new(FraudAnalyzer::new()),
        offline.clone(),
    );

    spawn_maintenance(validator.clone());

    let app = api::build_router(validator);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    // One last snapshot so restart does not lose admission decisions.
    if let Err(e) = offline.snapshot() {
        warn!(error = %e, "final offline snapshot failed");
    }
    info!("shutdown complete");
    Ok(())
}

/// Long-running maintenance: hot-cache TTL sweep, retention, fraud
/// history cleanup, offline sync and snapshot. Each loop owns a timer
/// task for the lifetime of the process.
fn spawn_maintenance(validator: Validator) {
    let config = validator.config().clone();

    // Hot-cache TTL sweep.
    {
        let validator = validator.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                validator.hot_cache().evict_expired();
            }
        });
    }

    // Scan-log / session / fraud-attempt retention, daily.
    {
        let validator = validator.clone();
        let retention_days = config.scan_retention_days;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(24 * 3600));
            tick.tick().await; // the first tick fires immediately
            loop {
                tick.tick().await;
                if let Err(e) = validator.store().cleanup_old_scans(retention_days).await {
                    error!(error = %e, "retention sweep failed");
                }
            }
        });
    }

    // Fraud history cleanup, daily.
    {
        let validator = validator.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(24 * 3600));
            tick.tick().await;
            loop {
                tick.tick().await;
                let dropped = validator.fraud_analyzer().cleanup_histories();
                info!(dropped, "fraud history sweep");
            }
        });
    }

    // Offline sync drain.
    {
        let validator = validator.clone();
        let interval = config.offline_sync_interval;
        let batch = config.offline_batch_size;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                if validator.offline().pending_count() > 0 {
                    validator
                        .offline()
                        .sync_pending(validator.rules(), batch)
                        .await;
                }
            }
        });
    }

    // Offline retention + snapshot.
    {
        let validator = validator.clone();
        let interval = config.offline_backup_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                validator.offline().cleanup_expired();
                if let Err(e) = validator.offline().snapshot() {
                    warn!(error = %e, "offline snapshot failed");
                }
            }
        });
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
