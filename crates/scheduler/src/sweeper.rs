//! Recovery sweeper
//!
//! Runs independently of the worker pool. Each pass fails over running
//! entries that outlived their timeout and reports ready work that nobody has
//! picked up although the system has spare capacity. The sweeper never claims.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::guard::ConcurrencyGuard;
use crate::persistence::{EntryStatus, Failure, QueueStore, StoreError, TimeoutPolicy};
use crate::reliability::RetryPolicy;

/// Sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweeperConfig {
    /// Time between passes
    #[serde(with = "crate::serde_millis")]
    pub interval: Duration,

    /// Timeout for entries without an estimated duration
    #[serde(with = "crate::serde_millis")]
    pub default_timeout: Duration,

    /// Applied to `estimated_duration` to derive the timeout
    pub timeout_multiplier: f64,

    /// Floor for estimate-derived timeouts, so a tiny estimate never reclaims
    /// an entry whose worker is still busy
    #[serde(with = "crate::serde_millis")]
    pub min_timeout: Duration,

    /// How long ready work may wait before it counts as starved
    #[serde(with = "crate::serde_millis")]
    pub starvation_grace: Duration,

    /// Backoff for entries re-queued after a timeout
    pub retry: RetryPolicy,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            default_timeout: Duration::from_secs(1800),
            timeout_multiplier: 2.0,
            min_timeout: Duration::from_secs(60),
            starvation_grace: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

impl SweeperConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        let timeout_multiplier = std::env::var("DOCKET_TIMEOUT_MULTIPLIER")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|m| m.is_finite() && *m >= 1.0)
            .unwrap_or(defaults.timeout_multiplier);

        Self {
            interval: secs("DOCKET_SWEEP_INTERVAL_SECS").unwrap_or(defaults.interval),
            default_timeout: secs("DOCKET_DEFAULT_TIMEOUT_SECS").unwrap_or(defaults.default_timeout),
            min_timeout: secs("DOCKET_MIN_TIMEOUT_SECS").unwrap_or(defaults.min_timeout),
            starvation_grace: secs("DOCKET_STARVATION_GRACE_SECS")
                .unwrap_or(defaults.starvation_grace),
            timeout_multiplier,
            ..defaults
        }
    }

    /// Set the pass interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the default timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the estimate multiplier
    pub fn with_timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.timeout_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the floor for estimate-derived timeouts
    pub fn with_min_timeout(mut self, timeout: Duration) -> Self {
        self.min_timeout = timeout;
        self
    }

    /// Stall detection rules derived from this configuration
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            default_timeout: self.default_timeout,
            multiplier: self.timeout_multiplier,
            min_timeout: self.min_timeout,
        }
    }

    /// Set the starvation grace period
    pub fn with_starvation_grace(mut self, grace: Duration) -> Self {
        self.starvation_grace = grace;
        self
    }

    /// Set the re-queue backoff
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Stalled entries put back in the queue
    pub requeued: u64,
    /// Stalled entries failed because attempts were exhausted
    pub failed: u64,
    /// Ready entries waiting longer than the grace period
    pub starved: u64,
}

/// Periodic reconciliation of stalled and starved entries
#[derive(Clone)]
pub struct RecoverySweeper {
    store: Arc<dyn QueueStore>,
    guard: ConcurrencyGuard,
    config: SweeperConfig,
}

impl RecoverySweeper {
    pub fn new(store: Arc<dyn QueueStore>, config: SweeperConfig) -> Self {
        Self {
            guard: ConcurrencyGuard::new(Arc::clone(&store)),
            store,
            config,
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Run a single pass
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();

        let policy = self.config.timeout_policy();
        let stalled = self.store.list_stalled(&policy).await?;

        for entry in stalled {
            let Some(worker_id) = entry.worker_id.as_deref() else {
                continue;
            };
            let timeout = entry.timeout(&policy);
            let failure = Failure::retryable(
                format!("timed out after {}s", timeout.as_secs()),
                self.config.retry.retry_delay(entry.attempts),
            );

            match self.store.fail(entry.id, worker_id, &failure).await? {
                Some(EntryStatus::Queued) => {
                    report.requeued += 1;
                    warn!(
                        entry_id = %entry.id,
                        worker_id,
                        attempt = entry.attempts,
                        "Stalled entry re-queued"
                    );
                }
                Some(_) => {
                    report.failed += 1;
                    warn!(
                        entry_id = %entry.id,
                        worker_id,
                        attempt = entry.attempts,
                        "Stalled entry failed, attempts exhausted"
                    );
                }
                None => {
                    debug!(entry_id = %entry.id, "Stalled entry resolved concurrently");
                }
            }
        }

        report.starved = self.store.count_starved(self.config.starvation_grace).await?;
        if report.starved > 0 {
            let capacity = self.guard.system_capacity().await?;
            if capacity.has_spare() {
                warn!(
                    starved = report.starved,
                    running = capacity.running,
                    limit = capacity.limit,
                    "Ready work is waiting while the system has spare capacity"
                );
            }
        }

        Ok(report)
    }

    /// Spawn the periodic loop
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(interval_secs = interval.as_secs(), "Recovery sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep_once().await {
                            Ok(report) => {
                                if report.requeued > 0 || report.failed > 0 {
                                    info!(
                                        requeued = report.requeued,
                                        failed = report.failed,
                                        starved = report.starved,
                                        "Recovered stalled entries"
                                    );
                                }
                            }
                            Err(e) => {
                                error!("Recovery sweep failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Sweeper loop: shutdown requested");
                        break;
                    }
                }
            }

            info!("Recovery sweeper stopped");
        });

        SweeperHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// Handle to a running sweeper loop
pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the loop and wait for the current pass to finish
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!("Recovery sweeper task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
