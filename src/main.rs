//! Leaseq queue worker service.
//!
//! Connects to PostgreSQL, ensures the queue table exists, and runs a worker
//! that claims records, hands them to the event loop, and completes them.
//! Stops gracefully on CTRL+C or SIGTERM.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use leaseq_core::{storage::PostgresStore, RealClock};
use leaseq_worker::{Completion, Delivery, Worker, WorkerEvent};
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log)?;

    info!("Starting leaseq worker");
    info!(
        database_url = %config.database_url_masked(),
        table = %config.queue_table,
        max_connections = config.database_max_connections,
        topics = ?config.topics,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let store = PostgresStore::new(db_pool.clone(), config.queue_table.clone())?;
    store.migrate().await.context("Failed to prepare queue table")?;
    info!(table = %store.table(), "Queue table ready");

    let (mut worker, mut events) =
        Worker::new(Arc::new(store), config.to_worker_config(), Arc::new(RealClock::new()))?;
    worker.listen();
    info!(owner = %worker.owner(), "Worker is listening for records");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received, starting graceful shutdown");
                break;
            }
            event = events.recv() => match event {
                Some(WorkerEvent::Data(delivery)) => {
                    tokio::spawn(process(delivery));
                }
                Some(WorkerEvent::Error(err)) if err.is_transient() => {
                    warn!(error = %err, "Transient worker error");
                }
                Some(WorkerEvent::Error(err)) => {
                    error!(error = %err, record_id = ?err.record(), "Worker error");
                }
                None => {
                    warn!("Event channel closed");
                    break;
                }
            },
        }
    }

    // Stop claiming before the receiver goes away so nothing new is leased.
    worker.pause_polling();
    drop(events);

    if let Err(e) = worker.shutdown().await {
        error!(error = %e, "Worker did not stop cleanly");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Leaseq shutdown complete");
    Ok(())
}

/// Handles a single claimed record and completes it.
async fn process(delivery: Delivery) {
    info!(
        record_id = %delivery.id(),
        topic = ?delivery.topic(),
        redelivered = delivery.redelivered(),
        bytes = delivery.payload().len(),
        "Processing record"
    );

    match delivery.remove().await {
        Completion::Deleted => debug!(record_id = %delivery.id(), "Record completed"),
        Completion::Requeued => {
            info!(record_id = %delivery.id(), "Record was resent while held, requeued");
        },
        Completion::Missing => warn!(record_id = %delivery.id(), "Record vanished before completion"),
        Completion::Failed => warn!(record_id = %delivery.id(), "Record completion failed"),
    }
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
