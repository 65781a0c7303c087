//! Worker pool manager
//!
//! Owns a fixed number of worker slots, replaces workers that die, watches
//! queue metrics, and drives the pool lifecycle.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::handler::WorkHandler;
use super::runner::{Worker, WorkerConfig, WorkerError};
use crate::persistence::{QueueStatus, QueueStore, StoreError};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Number of worker slots
    pub pool_size: usize,

    /// Prefix for worker ids (generated if not provided)
    pub worker_id_prefix: String,

    /// Per-worker configuration
    pub worker: WorkerConfig,

    /// Supervisor tick for health and metrics checks
    #[serde(with = "crate::serde_millis")]
    pub health_check_interval: Duration,

    /// Queued count above which the supervisor warns
    pub backlog_warning_threshold: u64,

    /// Default graceful shutdown timeout
    #[serde(with = "crate::serde_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 20,
            worker_id_prefix: format!("worker-{}", Uuid::now_v7()),
            worker: WorkerConfig::default(),
            health_check_interval: Duration::from_secs(30),
            backlog_warning_threshold: 100,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let pool_size = env_parse("DOCKET_POOL_SIZE").unwrap_or(defaults.pool_size);
        let health_check_interval = env_parse("DOCKET_HEALTH_CHECK_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.health_check_interval);
        let backlog_warning_threshold = env_parse("DOCKET_BACKLOG_WARNING_THRESHOLD")
            .unwrap_or(defaults.backlog_warning_threshold);
        let shutdown_timeout = env_parse("DOCKET_SHUTDOWN_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_timeout);

        let mut worker = defaults.worker.clone();
        if let Some(batch_size) = env_parse("DOCKET_CLAIM_BATCH_SIZE") {
            worker.poller = worker.poller.with_batch_size(batch_size);
        }

        Self {
            pool_size,
            health_check_interval,
            backlog_warning_threshold,
            shutdown_timeout,
            worker,
            ..defaults
        }
    }

    /// Set the number of workers
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the worker id prefix
    pub fn with_worker_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_id_prefix = prefix.into();
        self
    }

    /// Set per-worker configuration
    pub fn with_worker(mut self, config: WorkerConfig) -> Self {
        self.worker = config;
        self
    }

    /// Set health check interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set backlog warning threshold
    pub fn with_backlog_warning_threshold(mut self, threshold: u64) -> Self {
        self.backlog_warning_threshold = threshold;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), WorkerPoolError> {
        if self.pool_size == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(WorkerPoolError::InvalidConfig(
                "health_check_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Pool lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by [`WorkerPool::status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub state: PoolState,
    pub pool_size: usize,
    pub live_workers: usize,
    pub dead_workers: usize,
    /// Worker replacements since the pool was last started
    pub restarts: u64,
    pub queue: QueueStatus,
}

/// Queue condition the supervisor reports but never corrects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    /// More queued entries than `backlog_warning_threshold`
    BacklogAboveThreshold,
    /// Claimable work exists while nothing is running
    ReadyWorkIdle,
    /// More running entries than `system_max_concurrent`
    RunningAboveSystemLimit,
}

/// Outcome of one supervisor metrics check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub queued: u64,
    pub running: u64,
    /// Queued entries whose backoff has elapsed
    pub ready: u64,
    pub anomalies: Vec<Anomaly>,
}

impl MetricsReport {
    fn evaluate(status: &QueueStatus, system_limit: u64, backlog_threshold: u64) -> Self {
        let mut report = Self {
            queued: status.counts.queued,
            running: status.counts.running,
            ready: status.ready,
            anomalies: Vec::new(),
        };

        if report.queued > backlog_threshold {
            report.anomalies.push(Anomaly::BacklogAboveThreshold);
        }
        if report.ready > 0 && report.running == 0 {
            report.anomalies.push(Anomaly::ReadyWorkIdle);
        }
        if report.running > system_limit {
            report.anomalies.push(Anomaly::RunningAboveSystemLimit);
        }

        report
    }

    pub fn has(&self, anomaly: Anomaly) -> bool {
        self.anomalies.contains(&anomaly)
    }

    pub fn is_healthy(&self) -> bool {
        self.anomalies.is_empty()
    }
}

/// Outcome of [`WorkerPool::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Workers that exited on their own
    pub drained: usize,
    /// Workers aborted after the timeout
    pub aborted: usize,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration rejected
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

struct WorkerSlot {
    index: usize,
    worker_id: String,
    restarts: u64,
    handle: JoinHandle<Result<(), WorkerError>>,
}

/// State shared between the pool handle and its supervisor
struct PoolShared {
    store: Arc<dyn QueueStore>,
    handler: WorkHandler,
    config: WorkerPoolConfig,
    slots: Mutex<Vec<WorkerSlot>>,
    generation: Mutex<u64>,
}

impl PoolShared {
    fn spawn_worker(
        &self,
        index: usize,
        restarts: u64,
        shutdown_rx: watch::Receiver<bool>,
    ) -> WorkerSlot {
        let generation = {
            let mut generation = self.generation.lock();
            *generation += 1;
            *generation
        };
        let worker_id = format!("{}-{index}-{generation}", self.config.worker_id_prefix);

        let worker = Worker::new(
            worker_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.handler),
            self.config.worker.clone(),
        );

        WorkerSlot {
            index,
            worker_id,
            restarts,
            handle: tokio::spawn(worker.run(shutdown_rx)),
        }
    }

    /// Replace every finished worker and log why it finished
    async fn health_check(&self, shutdown_rx: &watch::Receiver<bool>) {
        let finished: Vec<(usize, String, JoinHandle<Result<(), WorkerError>>)> = {
            let mut slots = self.slots.lock();
            let mut finished = Vec::new();
            for slot in slots.iter_mut().filter(|s| s.handle.is_finished()) {
                let replacement = self.spawn_worker(slot.index, slot.restarts + 1, shutdown_rx.clone());
                let old = std::mem::replace(slot, replacement);
                finished.push((old.index, old.worker_id, old.handle));
            }
            finished
        };

        for (slot, worker_id, handle) in finished {
            match handle.await {
                Ok(Ok(())) => {
                    warn!(slot, worker_id = %worker_id, "Worker exited unexpectedly, replaced");
                }
                Ok(Err(e)) => {
                    error!(slot, worker_id = %worker_id, error = %e, "Worker failed, replaced");
                }
                Err(e) if e.is_panic() => {
                    error!(slot, worker_id = %worker_id, "Worker panicked, replaced");
                }
                Err(e) => {
                    warn!(slot, worker_id = %worker_id, error = %e, "Worker cancelled, replaced");
                }
            }
        }
    }

    /// Surface queue anomalies; never corrects them
    async fn metrics_check(&self) -> Result<MetricsReport, StoreError> {
        let status = self.store.queue_status().await?;
        let limits = self.store.load_limits().await?;

        let report = MetricsReport::evaluate(
            &status,
            u64::from(limits.system_max_concurrent),
            self.config.backlog_warning_threshold,
        );

        debug!(
            queued = report.queued,
            running = report.running,
            ready = report.ready,
            "Queue metrics"
        );

        for anomaly in &report.anomalies {
            match anomaly {
                Anomaly::BacklogAboveThreshold => warn!(
                    queued = report.queued,
                    threshold = self.config.backlog_warning_threshold,
                    "Queue backlog above threshold"
                ),
                Anomaly::ReadyWorkIdle => error!(
                    ready = report.ready,
                    "Ready work is queued but nothing is running"
                ),
                Anomaly::RunningAboveSystemLimit => error!(
                    running = report.running,
                    limit = limits.system_max_concurrent,
                    "Running entries exceed system_max_concurrent"
                ),
            }
        }

        Ok(report)
    }

    fn restarts(&self) -> u64 {
        self.slots.lock().iter().map(|s| s.restarts).sum()
    }
}

async fn supervise(shared: Arc<PoolShared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.health_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                shared.health_check(&shutdown_rx).await;
                if let Err(e) = shared.metrics_check().await {
                    error!(error = %e, "Metrics check failed");
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("Supervisor: shutdown requested");
                break;
            }
        }
    }

    debug!("Supervisor exited");
}

struct Runtime {
    shutdown_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

/// Fixed-size pool of supervised workers
///
/// # Example
///
/// ```ignore
/// use docket_scheduler::{handler_fn, WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::new(
///     store,
///     handler_fn(|entry| async move {
///         analyze(&entry.work_ref).await?;
///         Ok(())
///     }),
///     WorkerPoolConfig::new(20),
/// );
///
/// pool.start().await?;
///
/// // ... later, graceful shutdown
/// pool.shutdown(Duration::from_secs(30)).await?;
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    state: RwLock<PoolState>,
    // Serializes start/shutdown
    runtime: tokio::sync::Mutex<Option<Runtime>>,
}

impl WorkerPool {
    /// Create a new, stopped worker pool
    pub fn new(store: Arc<dyn QueueStore>, handler: WorkHandler, config: WorkerPoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                store,
                handler,
                config,
                slots: Mutex::new(Vec::new()),
                generation: Mutex::new(0),
            }),
            state: RwLock::new(PoolState::Stopped),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    /// Start all workers and the supervisor
    ///
    /// A no-op if the pool is already running.
    #[instrument(skip(self), fields(pool_size = self.shared.config.pool_size))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            debug!("Worker pool already running");
            return Ok(());
        }

        self.shared.config.validate()?;
        *self.state.write() = PoolState::Starting;

        info!(
            pool_size = self.shared.config.pool_size,
            worker_id_prefix = %self.shared.config.worker_id_prefix,
            "Starting worker pool"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut slots = self.shared.slots.lock();
            slots.clear();
            for index in 0..self.shared.config.pool_size {
                slots.push(self.shared.spawn_worker(index, 0, shutdown_rx.clone()));
            }
        }

        let supervisor = tokio::spawn(supervise(Arc::clone(&self.shared), shutdown_rx));
        *runtime = Some(Runtime {
            shutdown_tx,
            supervisor,
        });
        *self.state.write() = PoolState::Running;

        info!("Worker pool running");
        Ok(())
    }

    /// Stop all workers, waiting up to `timeout` for in-flight work
    ///
    /// Idempotent; a no-op when the pool is not running.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration) -> Result<ShutdownReport, WorkerPoolError> {
        let mut runtime = self.runtime.lock().await;
        let Some(Runtime {
            shutdown_tx,
            supervisor,
        }) = runtime.take()
        else {
            debug!("Worker pool not running");
            return Ok(ShutdownReport::default());
        };

        *self.state.write() = PoolState::Stopping;
        info!("Initiating graceful shutdown");

        let deadline = tokio::time::Instant::now() + timeout;
        let _ = shutdown_tx.send(true);

        let supervisor_abort = supervisor.abort_handle();
        if tokio::time::timeout_at(deadline, supervisor).await.is_err() {
            supervisor_abort.abort();
        }

        let slots = std::mem::take(&mut *self.shared.slots.lock());
        let abort_handles: Vec<_> = slots.iter().map(|s| s.handle.abort_handle()).collect();
        let total = slots.len();

        let mut report = ShutdownReport {
            drained: total,
            aborted: 0,
        };
        let handles = slots.into_iter().map(|s| s.handle);
        if tokio::time::timeout_at(deadline, join_all(handles))
            .await
            .is_err()
        {
            for handle in abort_handles.iter().filter(|h| !h.is_finished()) {
                handle.abort();
                report.aborted += 1;
            }
            report.drained = total - report.aborted;
            warn!(aborted = report.aborted, "Shutdown timeout reached, workers aborted");
        }

        *self.state.write() = PoolState::Stopped;
        info!(drained = report.drained, aborted = report.aborted, "Worker pool stopped");
        Ok(report)
    }

    /// Shut down with the configured timeout
    pub async fn shutdown_default(&self) -> Result<ShutdownReport, WorkerPoolError> {
        self.shutdown(self.shared.config.shutdown_timeout).await
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        *self.state.read()
    }

    /// Pool and queue snapshot
    pub async fn status(&self) -> Result<PoolStatus, WorkerPoolError> {
        let queue = self.shared.store.queue_status().await?;
        let (live_workers, dead_workers) = {
            let slots = self.shared.slots.lock();
            let dead = slots.iter().filter(|s| s.handle.is_finished()).count();
            (slots.len() - dead, dead)
        };

        Ok(PoolStatus {
            state: self.state(),
            pool_size: self.shared.config.pool_size,
            live_workers,
            dead_workers,
            restarts: self.shared.restarts(),
            queue,
        })
    }

    /// Run the supervisor's metrics check now
    pub async fn check_metrics(&self) -> Result<MetricsReport, WorkerPoolError> {
        Ok(self.shared.metrics_check().await?)
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }
}
