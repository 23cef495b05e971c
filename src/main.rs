//! Courier message broker service.
//!
//! Main entry point. Loads configuration, connects the database pool,
//! runs migrations, and starts the dispatch scheduler, then waits for a
//! shutdown signal and drains in-flight deliveries.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{storage::Storage, RealClock};
use courier_dispatch::{Config, Dispatcher, Scheduler};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting courier message broker");

    let config = Config::load().context("failed to load configuration")?;
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        tick_interval_ms = config.tick_interval_ms,
        lease_timeout_seconds = config.lease_timeout_seconds,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    courier_core::storage::run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;
    info!("database migrations completed");

    let storage = Storage::new(pool.clone());
    let dispatch_config = config.dispatch_config();
    let dispatcher = Arc::new(
        Dispatcher::new(storage.clone(), dispatch_config.clone(), Arc::new(RealClock::new()))
            .context("failed to create dispatcher")?,
    );

    let scheduler = Scheduler::new(storage, dispatcher, dispatch_config);
    scheduler.start().await.context("failed to start scheduler")?;

    info!(active_queues = scheduler.active_queue_count(), "courier is dispatching");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    scheduler.shutdown().await.context("scheduler shutdown failed")?;

    pool.close().await;
    info!("database connections closed");

    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,courier=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with bounded connect retries.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for a shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received CTRL+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
