//! Workers and the worker pool
//!
//! This module provides:
//! - [`Worker`] - Claim/execute/resolve loop
//! - [`WorkerPool`] - Fixed-size supervised pool of workers
//! - [`PollerConfig`] - Candidate batch size and idle backoff
//! - [`WorkHandler`] - The unit-of-work contract
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌──────────────────────────────┐  ┌─────────────────────┐  │
//! │  │ Worker slots 0..N            │  │  Supervisor (30s)   │  │
//! │  │ [w-0] [w-1] [w-2] ... [w-N]  │◀─│  health: replace    │  │
//! │  └──────────────┬───────────────┘  │  metrics: warn      │  │
//! │                 │                  └─────────────────────┘  │
//! │                 ▼                                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ select candidates → atomic claim → execute → resolve │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use docket_scheduler::worker::{handler_fn, WorkError, WorkerPool, WorkerPoolConfig};
//!
//! let pool = WorkerPool::new(
//!     store,
//!     handler_fn(|entry| async move {
//!         match analyze(&entry.work_ref).await {
//!             Ok(_) => Ok(()),
//!             Err(e) if e.is_transient() => Err(WorkError::retryable(e.to_string())),
//!             Err(e) => Err(WorkError::terminal(e.to_string())),
//!         }
//!     }),
//!     WorkerPoolConfig::from_env(),
//! );
//!
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown(Duration::from_secs(30)).await?;
//! ```

mod handler;
mod poller;
mod pool;
mod runner;

pub use handler::{handler_fn, WorkError, WorkHandler, WorkResult};
pub use poller::{IdleBackoff, PollerConfig};
pub use pool::{
    Anomaly, MetricsReport, PoolState, PoolStatus, ShutdownReport, WorkerPool, WorkerPoolConfig,
    WorkerPoolError,
};
pub use runner::{Iteration, Resolution, Worker, WorkerConfig, WorkerError};
