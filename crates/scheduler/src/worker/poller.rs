//! Idle backoff between claim iterations

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when work is available)
    #[serde(with = "crate::serde_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "crate::serde_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when nothing was claimed
    pub backoff_multiplier: f64,

    /// Maximum candidates read per iteration
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 20,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Idle backoff state for one worker
///
/// Grows the wait by `backoff_multiplier` on every empty iteration and resets
/// to the minimum after a claim.
pub struct IdleBackoff {
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl IdleBackoff {
    pub fn new(config: PollerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Record an iteration that claimed work
    pub fn reset(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    /// Record an iteration that found nothing to claim
    pub fn increase(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
        trace!(
            interval_ms = self.current_interval.as_millis() as u64,
            "Nothing claimed, backing off"
        );
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled before or during the wait.
    pub async fn wait(&mut self) -> bool {
        if self.is_shutdown() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            changed = self.shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                // A dropped sender also means shutdown
                changed.is_err() || *self.shutdown_rx.borrow()
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }
}
