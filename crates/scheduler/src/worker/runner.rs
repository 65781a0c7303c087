//! Claim/execute/resolve loop
//!
//! A worker repeatedly selects candidates, claims one with an atomic
//! conditional update, runs the handler, and writes the outcome back under
//! the same worker id. Losing a claim race is normal and only traced.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::handler::{WorkError, WorkHandler, WorkResult};
use super::poller::{IdleBackoff, PollerConfig};
use crate::persistence::{EntryStatus, Failure, QueueStore, StoreError, TaskQueueEntry};
use crate::reliability::RetryPolicy;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Candidate batch size and idle backoff
    pub poller: PollerConfig,

    /// Backoff before a retried entry is claimable again
    pub retry: RetryPolicy,

    /// Consecutive store errors after which the worker gives up
    pub max_consecutive_errors: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poller: PollerConfig::default(),
            retry: RetryPolicy::default(),
            max_consecutive_errors: 5,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set retry backoff policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the consecutive store error limit
    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max.max(1);
        self
    }
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The store kept failing
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// How an executed entry ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Requeued,
    Failed,
    /// The entry was no longer held by this worker; the outcome was discarded
    Dropped,
}

/// Result of a single loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// Nothing could be claimed
    Idle,
    Processed {
        entry_id: Uuid,
        resolution: Resolution,
    },
}

/// A single cooperative worker
pub struct Worker {
    id: String,
    store: Arc<dyn QueueStore>,
    handler: WorkHandler,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn QueueStore>,
        handler: WorkHandler,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            handler,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until shutdown is signaled
    ///
    /// An in-flight execution always finishes before the loop observes
    /// shutdown. Returns an error only after `max_consecutive_errors`
    /// consecutive store failures.
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let mut backoff = IdleBackoff::new(self.config.poller.clone(), shutdown_rx);
        let mut consecutive_errors = 0u32;

        info!(worker_id = %self.id, "Worker started");

        loop {
            if backoff.is_shutdown() {
                break;
            }

            match self.run_once().await {
                Ok(Iteration::Processed { .. }) => {
                    consecutive_errors = 0;
                    backoff.reset();
                    continue;
                }
                Ok(Iteration::Idle) => {
                    consecutive_errors = 0;
                    backoff.increase();
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        worker_id = %self.id,
                        consecutive_errors,
                        error = %e,
                        "Worker iteration failed"
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        return Err(WorkerError::Store(e));
                    }
                    backoff.increase();
                }
            }

            if backoff.wait().await {
                break;
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    /// One claim/execute/resolve iteration
    pub async fn run_once(&self) -> Result<Iteration, StoreError> {
        let Some(entry) = self.claim_next().await? else {
            return Ok(Iteration::Idle);
        };

        let result = self.execute(&entry).await;
        let resolution = self.resolve(&entry, result).await?;

        Ok(Iteration::Processed {
            entry_id: entry.id,
            resolution,
        })
    }

    /// Select candidates and claim the first one not lost to a race
    async fn claim_next(&self) -> Result<Option<TaskQueueEntry>, StoreError> {
        let limits = self.store.load_limits().await?;
        let running = self.store.running_count().await?;
        if running >= u64::from(limits.system_max_concurrent) {
            trace!(worker_id = %self.id, running, "System at capacity");
            return Ok(None);
        }

        let candidates = self
            .store
            .list_candidates(&limits, self.config.poller.batch_size)
            .await?;

        for candidate in candidates {
            match self.store.claim(candidate.id, &self.id, &limits).await? {
                Some(entry) => {
                    debug!(
                        worker_id = %self.id,
                        entry_id = %entry.id,
                        owner_id = %entry.owner_id,
                        attempt = entry.attempts,
                        "Claimed entry"
                    );
                    return Ok(Some(entry));
                }
                None => {
                    debug!(worker_id = %self.id, entry_id = %candidate.id, "Claim race lost");
                }
            }
        }

        Ok(None)
    }

    /// Run the handler, converting a panic into a retryable failure
    #[instrument(skip(self, entry), fields(worker_id = %self.id, entry_id = %entry.id))]
    async fn execute(&self, entry: &TaskQueueEntry) -> WorkResult {
        let handler = Arc::clone(&self.handler);
        let claimed = entry.clone();

        match AssertUnwindSafe(async move { handler(claimed).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(entry_id = %entry.id, panic = %message, "Handler panicked");
                Err(WorkError::Retryable(format!("handler panicked: {message}")))
            }
        }
    }

    /// Write the outcome, conditional on this worker still holding the entry
    async fn resolve(
        &self,
        entry: &TaskQueueEntry,
        result: WorkResult,
    ) -> Result<Resolution, StoreError> {
        let resolution = match result {
            Ok(()) => {
                if self.store.complete(entry.id, &self.id).await? {
                    Resolution::Completed
                } else {
                    Resolution::Dropped
                }
            }
            Err(err) => {
                let failure = if err.is_retryable() {
                    Failure::retryable(err.message(), self.config.retry.retry_delay(entry.attempts))
                } else {
                    Failure::terminal(err.message())
                };

                match self.store.fail(entry.id, &self.id, &failure).await? {
                    Some(EntryStatus::Queued) => Resolution::Requeued,
                    Some(_) => Resolution::Failed,
                    None => Resolution::Dropped,
                }
            }
        };

        match resolution {
            Resolution::Completed => {
                info!(worker_id = %self.id, entry_id = %entry.id, "Entry completed");
            }
            Resolution::Requeued => {
                info!(
                    worker_id = %self.id,
                    entry_id = %entry.id,
                    attempt = entry.attempts,
                    max_attempts = entry.max_attempts,
                    "Entry failed, re-queued"
                );
            }
            Resolution::Failed => {
                warn!(
                    worker_id = %self.id,
                    entry_id = %entry.id,
                    attempt = entry.attempts,
                    "Entry failed permanently"
                );
            }
            Resolution::Dropped => {
                warn!(
                    worker_id = %self.id,
                    entry_id = %entry.id,
                    "Entry no longer held by this worker, outcome dropped"
                );
            }
        }

        Ok(resolution)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
