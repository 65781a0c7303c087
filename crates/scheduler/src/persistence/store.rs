//! QueueStore trait definition

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Entry not found
    #[error("entry not found: {0}")]
    EntryNotFound(Uuid),

    /// Stored status or key could not be parsed
    #[error("invalid stored value: {0}")]
    InvalidValue(String),

    /// Configuration value rejected
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Schema migration error
    #[error("migration error: {0}")]
    Migration(String),
}

/// Entry status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting to be claimed
    Queued,

    /// Claimed by a worker and executing
    Running,

    /// Finished successfully
    Completed,

    /// Finished with a terminal failure or exhausted attempts
    Failed,

    /// Withdrawn by the producer before it was claimed
    Cancelled,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 5] = [
        EntryStatus::Queued,
        EntryStatus::Running,
        EntryStatus::Completed,
        EntryStatus::Failed,
        EntryStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the entry has reached a final state
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Queued | Self::Running => false,
            Self::Completed | Self::Failed | Self::Cancelled => true,
        }
    }

    /// Whether the entry occupies a concurrency slot for admission purposes
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Legal state machine edges
    pub fn can_transition_to(&self, next: EntryStatus) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running) | (Self::Queued, Self::Cancelled) => true,
            (Self::Running, Self::Completed)
            | (Self::Running, Self::Queued)
            | (Self::Running, Self::Failed) => true,
            (Self::Queued, _) | (Self::Running, _) => false,
            (Self::Completed, _) | (Self::Failed, _) | (Self::Cancelled, _) => false,
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::InvalidValue(format!("unknown entry status: {other}"))),
        }
    }
}

/// One unit of work submitted to the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueEntry {
    pub id: Uuid,
    pub work_ref: String,
    pub owner_id: String,
    pub priority: i32,
    pub status: EntryStatus,
    pub worker_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_message: Option<String>,
    pub estimated_duration: Option<Duration>,
    /// Earliest instant the entry may be claimed (pushed forward by retry backoff)
    pub available_at: DateTime<Utc>,
}

impl TaskQueueEntry {
    /// Whether another attempt may be started after the current one fails
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Timeout after which a running entry counts as stalled
    pub fn timeout(&self, policy: &TimeoutPolicy) -> Duration {
        policy.timeout_for(self.estimated_duration)
    }
}

/// How long a running entry may run before it counts as stalled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Timeout for entries without an estimated duration
    #[serde(with = "crate::serde_millis")]
    pub default_timeout: Duration,

    /// Applied to `estimated_duration` to derive the timeout
    pub multiplier: f64,

    /// Floor for estimate-derived timeouts
    #[serde(with = "crate::serde_millis")]
    pub min_timeout: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(1800),
            multiplier: 2.0,
            min_timeout: Duration::from_secs(60),
        }
    }
}

impl TimeoutPolicy {
    pub fn timeout_for(&self, estimate: Option<Duration>) -> Duration {
        match estimate {
            Some(estimate) => estimate
                .mul_f64(self.multiplier.max(1.0))
                .max(self.min_timeout),
            None => self.default_timeout,
        }
    }
}

/// Definition of an entry to be enqueued
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub work_ref: String,
    pub owner_id: String,
    pub priority: i32,
    pub max_attempts: u32,
    pub estimated_duration: Option<Duration>,
}

/// A queued entry eligible for a claim attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: Uuid,
    pub owner_id: String,
    pub priority: i32,
}

/// How a failed execution should be recorded
#[derive(Debug, Clone)]
pub struct Failure {
    pub message: String,

    /// Whether the entry may be re-queued if attempts remain
    pub retryable: bool,

    /// Delay before a re-queued entry becomes claimable again, measured on
    /// the store's clock
    pub retry_after: Duration,
}

impl Failure {
    pub fn retryable(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            retry_after,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            retry_after: Duration::ZERO,
        }
    }
}

/// Keys of the queue configuration table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    /// Ceiling on distinct owners with running work
    MaxConcurrentUsers,

    /// Per-owner cap
    OwnerMaxConcurrent,

    /// Global cap
    SystemMaxConcurrent,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 3] = [
        ConfigKey::MaxConcurrentUsers,
        ConfigKey::OwnerMaxConcurrent,
        ConfigKey::SystemMaxConcurrent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxConcurrentUsers => "max_concurrent_users",
            Self::OwnerMaxConcurrent => "owner_max_concurrent",
            Self::SystemMaxConcurrent => "system_max_concurrent",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::MaxConcurrentUsers => "Maximum number of distinct owners with running work",
            Self::OwnerMaxConcurrent => "Maximum running entries per owner",
            Self::SystemMaxConcurrent => "Maximum running entries across the system",
        }
    }

    pub fn default_value(&self) -> u32 {
        match self {
            Self::MaxConcurrentUsers => 10,
            Self::OwnerMaxConcurrent => 3,
            Self::SystemMaxConcurrent => 20,
        }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_concurrent_users" => Ok(Self::MaxConcurrentUsers),
            "owner_max_concurrent" => Ok(Self::OwnerMaxConcurrent),
            "system_max_concurrent" => Ok(Self::SystemMaxConcurrent),
            other => Err(StoreError::InvalidValue(format!("unknown configuration key: {other}"))),
        }
    }
}

/// A configuration row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: ConfigKey,
    pub value: u32,
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of the three concurrency limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLimits {
    pub max_concurrent_users: u32,
    pub owner_max_concurrent: u32,
    pub system_max_concurrent: u32,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_concurrent_users: ConfigKey::MaxConcurrentUsers.default_value(),
            owner_max_concurrent: ConfigKey::OwnerMaxConcurrent.default_value(),
            system_max_concurrent: ConfigKey::SystemMaxConcurrent.default_value(),
        }
    }
}

impl QueueLimits {
    /// Build limits from configuration rows, falling back to defaults for missing keys
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a ConfigEntry>) -> Self {
        let mut limits = Self::default();
        for entry in entries {
            match entry.key {
                ConfigKey::MaxConcurrentUsers => limits.max_concurrent_users = entry.value,
                ConfigKey::OwnerMaxConcurrent => limits.owner_max_concurrent = entry.value,
                ConfigKey::SystemMaxConcurrent => limits.system_max_concurrent = entry.value,
            }
        }
        limits
    }
}

/// Counts of entries holding or waiting for a slot (`Queued` + `Running`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCounts {
    pub system_active: u64,
    pub owner_active: u64,
    /// Distinct owners with at least one active entry
    pub active_owners: u64,
}

/// Per-status entry counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: EntryStatus, count: u64) {
        match status {
            EntryStatus::Queued => self.queued += count,
            EntryStatus::Running => self.running += count,
            EntryStatus::Completed => self.completed += count,
            EntryStatus::Failed => self.failed += count,
            EntryStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn get(&self, status: EntryStatus) -> u64 {
        match status {
            EntryStatus::Queued => self.queued,
            EntryStatus::Running => self.running,
            EntryStatus::Completed => self.completed,
            EntryStatus::Failed => self.failed,
            EntryStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.running + self.completed + self.failed + self.cancelled
    }
}

/// Aggregate queue status for observers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    #[serde(flatten)]
    pub counts: StatusCounts,

    /// Queued entries whose backoff has elapsed
    pub ready: u64,

    pub per_owner: BTreeMap<String, StatusCounts>,
}

/// Store for the task queue and its configuration
///
/// Implementations must be thread-safe and support concurrent access. Every
/// state transition is a conditional update; the boolean/`Option` results
/// report whether the row actually changed.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    // =========================================================================
    // Schema
    // =========================================================================

    /// Make sure tables exist (no-op for stores without a schema)
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    // =========================================================================
    // Producer Operations
    // =========================================================================

    /// Insert a new queued entry
    async fn enqueue(&self, entry: NewEntry) -> Result<Uuid, StoreError>;

    /// Load one entry
    async fn get_entry(&self, entry_id: Uuid) -> Result<TaskQueueEntry, StoreError>;

    /// Cancel an entry if it is still queued
    async fn cancel(&self, entry_id: Uuid) -> Result<bool, StoreError>;

    /// Aggregate status counters, with a per-owner breakdown
    async fn queue_status(&self) -> Result<QueueStatus, StoreError>;

    // =========================================================================
    // Configuration
    // =========================================================================

    /// All configuration rows
    async fn list_configuration(&self) -> Result<Vec<ConfigEntry>, StoreError>;

    /// Update one configuration value
    async fn set_configuration(&self, key: ConfigKey, value: u32)
        -> Result<ConfigEntry, StoreError>;

    /// Current limits, read fresh
    async fn load_limits(&self) -> Result<QueueLimits, StoreError> {
        let entries = self.list_configuration().await?;
        Ok(QueueLimits::from_entries(&entries))
    }

    // =========================================================================
    // Admission Counters
    // =========================================================================

    /// Queued + running counts, system-wide and for one owner
    async fn active_counts(&self, owner_id: &str) -> Result<ActiveCounts, StoreError>;

    /// Number of running entries across the system
    async fn running_count(&self) -> Result<u64, StoreError>;

    // =========================================================================
    // Worker Operations
    // =========================================================================

    /// Ready queued entries ordered by priority desc, queued_at asc, skipping
    /// owners already at `owner_max_concurrent` running entries
    async fn list_candidates(
        &self,
        limits: &QueueLimits,
        batch_size: usize,
    ) -> Result<Vec<Candidate>, StoreError>;

    /// Atomically move a queued entry to running under `worker_id`
    ///
    /// Returns `None` when zero rows changed: the entry is no longer queued,
    /// its attempts are exhausted, or a cap in `limits` would be exceeded.
    async fn claim(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        limits: &QueueLimits,
    ) -> Result<Option<TaskQueueEntry>, StoreError>;

    /// Mark a running entry completed if `worker_id` still holds it
    async fn complete(&self, entry_id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Record a failed execution if `worker_id` still holds the entry
    ///
    /// Returns the resulting status (`Queued` when retried, `Failed` otherwise),
    /// or `None` if the entry was not held by `worker_id`.
    async fn fail(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        failure: &Failure,
    ) -> Result<Option<EntryStatus>, StoreError>;

    // =========================================================================
    // Recovery Operations
    // =========================================================================

    /// Running entries whose run time exceeds their timeout
    async fn list_stalled(&self, policy: &TimeoutPolicy)
        -> Result<Vec<TaskQueueEntry>, StoreError>;

    /// Ready queued entries that have been claimable for longer than `grace`
    async fn count_starved(&self, grace: Duration) -> Result<u64, StoreError>;
}
