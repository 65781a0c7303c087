//! In-memory implementation of QueueStore for testing

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// In-memory implementation of QueueStore
///
/// This is primarily for testing. Every conditional update runs under the
/// store-wide write lock, which gives the same at-most-one-winner semantics
/// as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use docket_scheduler::InMemoryQueueStore;
///
/// let store = InMemoryQueueStore::new();
/// ```
pub struct InMemoryQueueStore {
    entries: RwLock<HashMap<Uuid, TaskQueueEntry>>,
    config: RwLock<BTreeMap<ConfigKey, ConfigEntry>>,
}

impl InMemoryQueueStore {
    /// Create a new in-memory store seeded with default limits
    pub fn new() -> Self {
        Self::with_limits(QueueLimits::default())
    }

    /// Create a new in-memory store seeded with the given limits
    pub fn with_limits(limits: QueueLimits) -> Self {
        let now = Utc::now();
        let config = ConfigKey::ALL
            .into_iter()
            .map(|key| {
                let value = match key {
                    ConfigKey::MaxConcurrentUsers => limits.max_concurrent_users,
                    ConfigKey::OwnerMaxConcurrent => limits.owner_max_concurrent,
                    ConfigKey::SystemMaxConcurrent => limits.system_max_concurrent,
                };
                (
                    key,
                    ConfigEntry {
                        key,
                        value,
                        description: key.description().to_string(),
                        updated_at: now,
                    },
                )
            })
            .collect();

        Self {
            entries: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
        }
    }

    /// Number of entries in the given status
    pub fn count_by_status(&self, status: EntryStatus) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    /// Running entries for one owner
    pub fn running_for_owner(&self, owner_id: &str) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.status == EntryStatus::Running && e.owner_id == owner_id)
            .count()
    }

    /// Snapshot of every entry
    pub fn entries(&self) -> Vec<TaskQueueEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Clear all entries (for testing)
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a failure against an entry the caller already verified it holds
fn apply_failure(entry: &mut TaskQueueEntry, failure: &Failure) -> EntryStatus {
    let now = Utc::now();
    entry.error_message = Some(failure.message.clone());
    entry.worker_id = None;

    if failure.retryable && entry.has_attempts_remaining() {
        entry.status = EntryStatus::Queued;
        entry.started_at = None;
        entry.available_at = now + chrono::Duration::from_std(failure.retry_after).unwrap_or_default();
    } else {
        entry.status = EntryStatus::Failed;
        entry.completed_at = Some(now);
    }

    entry.status
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, entry: NewEntry) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let now = Utc::now();

        self.entries.write().insert(
            id,
            TaskQueueEntry {
                id,
                work_ref: entry.work_ref,
                owner_id: entry.owner_id,
                priority: entry.priority,
                status: EntryStatus::Queued,
                worker_id: None,
                queued_at: now,
                started_at: None,
                completed_at: None,
                attempts: 0,
                max_attempts: entry.max_attempts,
                error_message: None,
                estimated_duration: entry.estimated_duration,
                available_at: now,
            },
        );
        Ok(id)
    }

    async fn get_entry(&self, entry_id: Uuid) -> Result<TaskQueueEntry, StoreError> {
        self.entries
            .read()
            .get(&entry_id)
            .cloned()
            .ok_or(StoreError::EntryNotFound(entry_id))
    }

    async fn cancel(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&entry_id)
            .ok_or(StoreError::EntryNotFound(entry_id))?;

        if entry.status != EntryStatus::Queued {
            return Ok(false);
        }

        entry.status = EntryStatus::Cancelled;
        entry.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn queue_status(&self) -> Result<QueueStatus, StoreError> {
        let now = Utc::now();
        let entries = self.entries.read();
        let mut status = QueueStatus::default();

        for entry in entries.values() {
            status.counts.add(entry.status, 1);
            status
                .per_owner
                .entry(entry.owner_id.clone())
                .or_default()
                .add(entry.status, 1);
            if entry.status == EntryStatus::Queued && entry.available_at <= now {
                status.ready += 1;
            }
        }

        Ok(status)
    }

    async fn list_configuration(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        Ok(self.config.read().values().cloned().collect())
    }

    async fn set_configuration(
        &self,
        key: ConfigKey,
        value: u32,
    ) -> Result<ConfigEntry, StoreError> {
        if value == 0 {
            return Err(StoreError::InvalidConfiguration(format!(
                "{key} must be at least 1"
            )));
        }

        let mut config = self.config.write();
        let entry = config.entry(key).or_insert_with(|| ConfigEntry {
            key,
            value,
            description: key.description().to_string(),
            updated_at: Utc::now(),
        });
        entry.value = value;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn active_counts(&self, owner_id: &str) -> Result<ActiveCounts, StoreError> {
        let entries = self.entries.read();
        let mut counts = ActiveCounts::default();
        let mut owners = HashSet::new();

        for entry in entries.values().filter(|e| e.status.is_active()) {
            counts.system_active += 1;
            if entry.owner_id == owner_id {
                counts.owner_active += 1;
            }
            owners.insert(entry.owner_id.as_str());
        }

        counts.active_owners = owners.len() as u64;
        Ok(counts)
    }

    async fn running_count(&self) -> Result<u64, StoreError> {
        Ok(self.count_by_status(EntryStatus::Running) as u64)
    }

    async fn list_candidates(
        &self,
        limits: &QueueLimits,
        batch_size: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let now = Utc::now();
        let entries = self.entries.read();

        let mut running_by_owner: HashMap<&str, u32> = HashMap::new();
        for entry in entries.values().filter(|e| e.status == EntryStatus::Running) {
            *running_by_owner.entry(entry.owner_id.as_str()).or_default() += 1;
        }

        // With the distinct-owner cap reached only owners already running can start
        let users_full = running_by_owner.len() as u32 >= limits.max_concurrent_users;

        let mut queued: Vec<&TaskQueueEntry> = entries
            .values()
            .filter(|e| e.status == EntryStatus::Queued && e.available_at <= now)
            .filter(|e| match running_by_owner.get(e.owner_id.as_str()) {
                Some(&running) => running < limits.owner_max_concurrent,
                None => !users_full,
            })
            .collect();

        queued.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.queued_at.cmp(&b.queued_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(queued
            .into_iter()
            .take(batch_size)
            .map(|e| Candidate {
                id: e.id,
                owner_id: e.owner_id.clone(),
                priority: e.priority,
            })
            .collect())
    }

    async fn claim(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        limits: &QueueLimits,
    ) -> Result<Option<TaskQueueEntry>, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.write();

        let Some(target) = entries.get(&entry_id) else {
            return Ok(None);
        };
        if target.status != EntryStatus::Queued
            || !target.has_attempts_remaining()
            || target.available_at > now
        {
            return Ok(None);
        }
        let owner_id = target.owner_id.clone();

        let mut system_running = 0u32;
        let mut owner_running = 0u32;
        let mut running_owners = HashSet::new();
        for entry in entries.values().filter(|e| e.status == EntryStatus::Running) {
            system_running += 1;
            if entry.owner_id == owner_id {
                owner_running += 1;
            }
            running_owners.insert(entry.owner_id.as_str());
        }

        if system_running >= limits.system_max_concurrent
            || owner_running >= limits.owner_max_concurrent
            || (owner_running == 0 && running_owners.len() as u32 >= limits.max_concurrent_users)
        {
            return Ok(None);
        }

        let Some(entry) = entries.get_mut(&entry_id) else {
            return Ok(None);
        };
        entry.status = EntryStatus::Running;
        entry.worker_id = Some(worker_id.to_string());
        entry.started_at = Some(now);
        entry.attempts += 1;

        Ok(Some(entry.clone()))
    }

    async fn complete(&self, entry_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&entry_id) else {
            return Err(StoreError::EntryNotFound(entry_id));
        };

        if entry.status != EntryStatus::Running || entry.worker_id.as_deref() != Some(worker_id) {
            return Ok(false);
        }

        entry.status = EntryStatus::Completed;
        entry.worker_id = None;
        entry.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn fail(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        failure: &Failure,
    ) -> Result<Option<EntryStatus>, StoreError> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&entry_id) else {
            return Err(StoreError::EntryNotFound(entry_id));
        };

        if entry.status != EntryStatus::Running || entry.worker_id.as_deref() != Some(worker_id) {
            return Ok(None);
        }

        Ok(Some(apply_failure(entry, failure)))
    }

    async fn list_stalled(
        &self,
        policy: &TimeoutPolicy,
    ) -> Result<Vec<TaskQueueEntry>, StoreError> {
        let now = Utc::now();
        let entries = self.entries.read();

        Ok(entries
            .values()
            .filter(|e| e.status == EntryStatus::Running)
            .filter(|e| {
                let Some(started_at) = e.started_at else {
                    return false;
                };
                let timeout = e.timeout(policy);
                let elapsed = (now - started_at).to_std().unwrap_or(Duration::ZERO);
                elapsed > timeout
            })
            .cloned()
            .collect())
    }

    async fn count_starved(&self, grace: Duration) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(grace).unwrap_or_default();

        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.status == EntryStatus::Queued && e.available_at <= cutoff)
            .count() as u64)
    }
}
