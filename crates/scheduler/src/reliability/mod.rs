//! Reliability patterns for the scheduler
//!
//! This module provides:
//! - [`RetryPolicy`] - Backoff applied when a failed entry is re-queued

mod retry;

pub use retry::RetryPolicy;
