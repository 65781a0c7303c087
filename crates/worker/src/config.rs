// Worker host configuration
// Decision: Runtime concurrency limits live in the queue_configuration table, not in env

use std::time::Duration;

use anyhow::{Context, Result};
use docket_scheduler::{SweeperConfig, WorkerPoolConfig};

/// Configuration for the worker host process
#[derive(Debug, Clone)]
pub struct WorkerHostConfig {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Maximum database connections
    pub db_max_connections: u32,
    /// Endpoint that executes one unit of work
    pub handler_url: String,
    /// Per-request timeout for the handler endpoint
    pub handler_timeout: Duration,
    pub pool: WorkerPoolConfig,
    pub sweeper: SweeperConfig,
}

impl WorkerHostConfig {
    /// Create configuration from environment variables
    ///
    /// `DATABASE_URL` and `DOCKET_HANDLER_URL` are required.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let handler_url =
            std::env::var("DOCKET_HANDLER_URL").context("DOCKET_HANDLER_URL not set")?;

        let db_max_connections = std::env::var("DOCKET_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let handler_timeout = std::env::var("DOCKET_HANDLER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));

        Ok(Self {
            database_url,
            db_max_connections,
            handler_url,
            handler_timeout,
            pool: WorkerPoolConfig::from_env(),
            sweeper: SweeperConfig::from_env(),
        })
    }

    /// Connections needed so every worker plus the supervisor and sweeper can hold one
    pub fn effective_max_connections(&self) -> u32 {
        let needed = u32::try_from(self.pool.pool_size)
            .unwrap_or(u32::MAX)
            .saturating_add(2);
        self.db_max_connections.max(needed)
    }
}
