// Docket worker host
//
// Runs a worker pool and a recovery sweeper against PostgreSQL, forwarding
// each claimed entry to an HTTP handler endpoint.

pub mod config;
pub mod dispatch;
pub mod telemetry;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use docket_scheduler::{PostgresQueueStore, QueueStore, RecoverySweeper, WorkerPool};
use sqlx::postgres::PgPoolOptions;

pub use config::WorkerHostConfig;
pub use dispatch::HttpDispatcher;
pub use telemetry::{init_telemetry, TelemetryConfig};

/// Run the pool and sweeper until `shutdown` resolves, then drain
pub async fn run_until<F>(config: WorkerHostConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    config.pool.validate().context("Invalid pool configuration")?;

    let db = PgPoolOptions::new()
        .max_connections(config.effective_max_connections())
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let store = PostgresQueueStore::new(db);
    store
        .ensure_schema()
        .await
        .context("Failed to prepare queue schema")?;
    let store: Arc<dyn QueueStore> = Arc::new(store);

    let handler = HttpDispatcher::new(&config.handler_url, config.handler_timeout)?.into_handler();

    let pool = WorkerPool::new(store.clone(), handler, config.pool.clone());
    pool.start().await.context("Failed to start worker pool")?;

    let sweeper = RecoverySweeper::new(store, config.sweeper.clone()).start();

    tracing::info!(
        pool_size = config.pool.pool_size,
        handler_url = %config.handler_url,
        "Docket worker running"
    );

    shutdown.await;
    tracing::info!("Received shutdown signal");

    let report = pool
        .shutdown(config.pool.shutdown_timeout)
        .await
        .context("Failed to stop worker pool")?;
    sweeper.stop().await;

    tracing::info!(
        drained = report.drained,
        aborted = report.aborted,
        "Worker shutdown complete"
    );
    Ok(())
}
