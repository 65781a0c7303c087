//! Producer-facing task queue API

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::guard::{Admission, ConcurrencyGuard};
use crate::persistence::{
    ConfigEntry, ConfigKey, NewEntry, QueueStatus, QueueStore, StoreError, TaskQueueEntry,
};

/// Facade errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Request rejected before reaching the store
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// A unit of work to submit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Opaque reference to the payload
    pub work_ref: String,
    pub owner_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, with = "crate::serde_millis::option")]
    pub estimated_duration: Option<Duration>,
}

fn default_max_attempts() -> u32 {
    3
}

impl EnqueueRequest {
    pub fn new(work_ref: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            work_ref: work_ref.into(),
            owner_id: owner_id.into(),
            priority: 0,
            max_attempts: default_max_attempts(),
            estimated_duration: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_estimated_duration(mut self, estimate: Duration) -> Self {
        self.estimated_duration = Some(estimate);
        self
    }

    fn validate(&self) -> Result<(), QueueError> {
        if self.work_ref.trim().is_empty() {
            return Err(QueueError::InvalidRequest("work_ref must not be empty".into()));
        }
        if self.owner_id.trim().is_empty() {
            return Err(QueueError::InvalidRequest("owner_id must not be empty".into()));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::InvalidRequest("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Task queue used by producers and observers
///
/// # Example
///
/// ```ignore
/// let queue = TaskQueue::new(store);
///
/// let id = queue
///     .enqueue(EnqueueRequest::new("uploads/report.pdf", "user-42").with_priority(5))
///     .await?;
///
/// let status = queue.get_status().await?;
/// ```
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
    guard: ConcurrencyGuard,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            guard: ConcurrencyGuard::new(Arc::clone(&store)),
            store,
        }
    }

    /// Insert a queued entry
    #[instrument(skip(self, request), fields(owner_id = %request.owner_id))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid, QueueError> {
        request.validate()?;

        let id = self
            .store
            .enqueue(NewEntry {
                work_ref: request.work_ref,
                owner_id: request.owner_id,
                priority: request.priority,
                max_attempts: request.max_attempts,
                estimated_duration: request.estimated_duration,
            })
            .await?;

        info!(entry_id = %id, priority = request.priority, "Entry enqueued");
        Ok(id)
    }

    /// Cancel an entry that has not been claimed yet
    ///
    /// Returns `false` if it already left the queued state.
    #[instrument(skip(self))]
    pub async fn cancel(&self, entry_id: Uuid) -> Result<bool, QueueError> {
        let cancelled = self.store.cancel(entry_id).await?;
        if cancelled {
            info!(%entry_id, "Entry cancelled");
        }
        Ok(cancelled)
    }

    pub async fn get_status(&self) -> Result<QueueStatus, QueueError> {
        Ok(self.store.queue_status().await?)
    }

    pub async fn get_entry(&self, entry_id: Uuid) -> Result<TaskQueueEntry, QueueError> {
        Ok(self.store.get_entry(entry_id).await?)
    }

    /// Advisory admission check for `owner_id`
    pub async fn admit(&self, owner_id: &str, requested: u32) -> Result<Admission, QueueError> {
        Ok(self.guard.admit(owner_id, requested).await?)
    }

    /// Update one concurrency limit; takes effect on the next claim
    #[instrument(skip(self))]
    pub async fn set_configuration(
        &self,
        key: ConfigKey,
        value: u32,
    ) -> Result<ConfigEntry, QueueError> {
        let entry = self.store.set_configuration(key, value).await?;
        info!(%key, value, "Queue configuration updated");
        Ok(entry)
    }

    pub async fn configuration(&self) -> Result<Vec<ConfigEntry>, QueueError> {
        Ok(self.store.list_configuration().await?)
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{EntryStatus, InMemoryQueueStore};

    fn queue() -> TaskQueue {
        TaskQueue::new(Arc::new(InMemoryQueueStore::new()))
    }

    #[tokio::test]
    async fn test_enqueue_and_get() {
        let queue = queue();
        let id = queue
            .enqueue(
                EnqueueRequest::new("uploads/a.pdf", "owner-a")
                    .with_priority(5)
                    .with_estimated_duration(Duration::from_secs(90)),
            )
            .await
            .unwrap();

        let entry = queue.get_entry(id).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Queued);
        assert_eq!(entry.priority, 5);
        assert_eq!(entry.max_attempts, 3);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.estimated_duration, Some(Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let queue = queue();

        for request in [
            EnqueueRequest::new("", "owner-a"),
            EnqueueRequest::new("uploads/a.pdf", "  "),
            EnqueueRequest::new("uploads/a.pdf", "owner-a").with_max_attempts(0),
        ] {
            assert!(matches!(
                queue.enqueue(request).await,
                Err(QueueError::InvalidRequest(_))
            ));
        }

        assert_eq!(queue.get_status().await.unwrap().counts.total(), 0);
    }

    #[tokio::test]
    async fn test_cancel() {
        let queue = queue();
        let id = queue
            .enqueue(EnqueueRequest::new("uploads/a.pdf", "owner-a"))
            .await
            .unwrap();

        assert!(queue.cancel(id).await.unwrap());
        assert!(!queue.cancel(id).await.unwrap());
        assert!(matches!(
            queue.cancel(Uuid::now_v7()).await,
            Err(QueueError::Store(StoreError::EntryNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_configuration() {
        let queue = queue();

        let entry = queue
            .set_configuration(ConfigKey::OwnerMaxConcurrent, 5)
            .await
            .unwrap();
        assert_eq!(entry.value, 5);

        let config = queue.configuration().await.unwrap();
        assert_eq!(config.len(), 3);
        assert!(queue
            .set_configuration(ConfigKey::SystemMaxConcurrent, 0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_admit_passthrough() {
        let queue = queue();
        let admission = queue.admit("owner-a", 1).await.unwrap();
        assert!(admission.allowed);
        assert_eq!(admission.detail.owner_limit, 3);
    }

    #[test]
    fn test_request_deserialize_defaults() {
        let request: EnqueueRequest =
            serde_json::from_str(r#"{"work_ref":"uploads/a.pdf","owner_id":"owner-a"}"#).unwrap();
        assert_eq!(request.priority, 0);
        assert_eq!(request.max_attempts, 3);
        assert_eq!(request.estimated_duration, None);
    }
}
