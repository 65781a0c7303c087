//! Persistence layer for the task queue
//!
//! This module provides:
//! - [`QueueStore`] trait for entry and configuration persistence
//! - [`InMemoryQueueStore`] for testing
//! - [`PostgresQueueStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;
pub use store::{
    ActiveCounts, Candidate, ConfigEntry, ConfigKey, EntryStatus, Failure, NewEntry,
    QueueLimits, QueueStatus, QueueStore, StatusCounts, StoreError, TaskQueueEntry, TimeoutPolicy,
};
