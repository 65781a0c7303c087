//! # Docket Scheduler
//!
//! A PostgreSQL-backed task queue with a supervised worker pool.
//!
//! ## Features
//!
//! - **Race-free claiming**: workers claim entries with one atomic conditional update
//! - **Concurrency ceilings**: per-owner, system-wide and distinct-owner caps read fresh from the store
//! - **Bounded retries**: transient failures re-queue with exponential backoff and jitter
//! - **Supervised pool**: dead workers are replaced, queue anomalies are logged
//! - **Recovery sweeper**: stalled entries are failed over on a fixed interval
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TaskQueue / ConcurrencyGuard                 │
//! │  (producers enqueue, cancel, read status, check admission)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        QueueStore                            │
//! │  (PostgreSQL: task_queue_entries, queue_configuration)      │
//! └─────────────────────────────────────────────────────────────┘
//!                 ▲                              ▲
//!                 │                              │
//! ┌───────────────────────────────┐  ┌──────────────────────────┐
//! │          WorkerPool            │  │     RecoverySweeper      │
//! │ (claim, execute, resolve)      │  │ (stalled + starved work) │
//! └───────────────────────────────┘  └──────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use docket_scheduler::prelude::*;
//!
//! let store: Arc<dyn QueueStore> = Arc::new(PostgresQueueStore::new(pool));
//! store.ensure_schema().await?;
//!
//! let queue = TaskQueue::new(Arc::clone(&store));
//! queue.enqueue(EnqueueRequest::new("uploads/report.pdf", "user-42")).await?;
//!
//! let workers = WorkerPool::new(
//!     Arc::clone(&store),
//!     handler_fn(|entry| async move { analyze(&entry.work_ref).await }),
//!     WorkerPoolConfig::from_env(),
//! );
//! workers.start().await?;
//!
//! let sweeper = RecoverySweeper::new(store, SweeperConfig::from_env()).start();
//! ```

pub mod guard;
pub mod persistence;
pub mod queue;
pub mod reliability;
mod serde_millis;
pub mod sweeper;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::guard::{Admission, AdmissionDetail, ConcurrencyGuard};
    pub use crate::persistence::{
        ConfigKey, EntryStatus, InMemoryQueueStore, PostgresQueueStore, QueueStatus, QueueStore,
        StoreError, TaskQueueEntry,
    };
    pub use crate::queue::{EnqueueRequest, QueueError, TaskQueue};
    pub use crate::reliability::RetryPolicy;
    pub use crate::sweeper::{RecoverySweeper, SweepReport, SweeperConfig, SweeperHandle};
    pub use crate::worker::{
        handler_fn, PoolState, PoolStatus, WorkError, WorkHandler, WorkerPool, WorkerPoolConfig,
        WorkerPoolError,
    };
}

// Re-export key types at crate root
pub use guard::{Admission, AdmissionDetail, ConcurrencyGuard, SystemCapacity};
pub use persistence::{
    ConfigEntry, ConfigKey, EntryStatus, InMemoryQueueStore, PostgresQueueStore, QueueLimits,
    QueueStatus, QueueStore, StatusCounts, StoreError, TaskQueueEntry, TimeoutPolicy,
};
pub use queue::{EnqueueRequest, QueueError, TaskQueue};
pub use reliability::RetryPolicy;
pub use sweeper::{RecoverySweeper, SweepReport, SweeperConfig, SweeperHandle};
pub use worker::{
    handler_fn, Anomaly, MetricsReport, PollerConfig, PoolState, PoolStatus, ShutdownReport,
    WorkError, WorkHandler, WorkResult, WorkerConfig, WorkerError, WorkerPool, WorkerPoolConfig,
    WorkerPoolError,
};
