//! End-to-end scheduler scenarios against the in-memory store
//!
//! Run with: cargo test -p docket-scheduler --test scheduler_scenarios

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use uuid::Uuid;

use docket_scheduler::persistence::{
    ActiveCounts, Candidate, ConfigEntry, ConfigKey, EntryStatus, Failure, InMemoryQueueStore,
    NewEntry, QueueLimits, QueueStatus, QueueStore, StoreError, TaskQueueEntry, TimeoutPolicy,
};
use docket_scheduler::worker::{
    handler_fn, Iteration, PollerConfig, PoolState, Resolution, WorkError, WorkHandler, Worker,
    WorkerConfig, WorkerPool, WorkerPoolConfig,
};
use docket_scheduler::{EnqueueRequest, RecoverySweeper, RetryPolicy, SweeperConfig, TaskQueue};

// ============================================
// Helpers
// ============================================

fn limits(users: u32, owner: u32, system: u32) -> QueueLimits {
    QueueLimits {
        max_concurrent_users: users,
        owner_max_concurrent: owner,
        system_max_concurrent: system,
    }
}

fn worker_config() -> WorkerConfig {
    WorkerConfig::new()
        .with_retry(RetryPolicy::immediate())
        .with_poller(
            PollerConfig::new()
                .with_min_interval(Duration::from_millis(5))
                .with_max_interval(Duration::from_millis(20)),
        )
}

fn pool_config(size: usize) -> WorkerPoolConfig {
    WorkerPoolConfig::new(size)
        .with_worker_id_prefix("scenario")
        .with_worker(worker_config())
        .with_health_check_interval(Duration::from_millis(20))
}

fn ok_handler() -> WorkHandler {
    handler_fn(|_| async { Ok(()) })
}

/// Handler that blocks until the gate hands out a permit
fn gated_handler(gate: Arc<Semaphore>) -> WorkHandler {
    handler_fn(move |_| {
        let gate = Arc::clone(&gate);
        async move {
            match gate.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(e) => Err(WorkError::retryable(e.to_string())),
            }
        }
    })
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn distinct_running_owners(store: &InMemoryQueueStore) -> usize {
    store
        .entries()
        .into_iter()
        .filter(|e| e.status == EntryStatus::Running)
        .map(|e| e.owner_id)
        .collect::<HashSet<_>>()
        .len()
}

/// Store wrapper whose configuration reads fail while `failing` is set
struct FlakyStore {
    inner: InMemoryQueueStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryQueueStore::new(),
            failing: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for FlakyStore {
    async fn enqueue(&self, entry: NewEntry) -> Result<Uuid, StoreError> {
        self.inner.enqueue(entry).await
    }

    async fn get_entry(&self, entry_id: Uuid) -> Result<TaskQueueEntry, StoreError> {
        self.inner.get_entry(entry_id).await
    }

    async fn cancel(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        self.inner.cancel(entry_id).await
    }

    async fn queue_status(&self) -> Result<QueueStatus, StoreError> {
        self.inner.queue_status().await
    }

    async fn list_configuration(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        self.check()?;
        self.inner.list_configuration().await
    }

    async fn set_configuration(
        &self,
        key: ConfigKey,
        value: u32,
    ) -> Result<ConfigEntry, StoreError> {
        self.inner.set_configuration(key, value).await
    }

    async fn active_counts(&self, owner_id: &str) -> Result<ActiveCounts, StoreError> {
        self.inner.active_counts(owner_id).await
    }

    async fn running_count(&self) -> Result<u64, StoreError> {
        self.inner.running_count().await
    }

    async fn list_candidates(
        &self,
        limits: &QueueLimits,
        batch_size: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        self.inner.list_candidates(limits, batch_size).await
    }

    async fn claim(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        limits: &QueueLimits,
    ) -> Result<Option<TaskQueueEntry>, StoreError> {
        self.inner.claim(entry_id, worker_id, limits).await
    }

    async fn complete(&self, entry_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        self.inner.complete(entry_id, worker_id).await
    }

    async fn fail(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        failure: &Failure,
    ) -> Result<Option<EntryStatus>, StoreError> {
        self.inner.fail(entry_id, worker_id, failure).await
    }

    async fn list_stalled(
        &self,
        policy: &TimeoutPolicy,
    ) -> Result<Vec<TaskQueueEntry>, StoreError> {
        self.inner.list_stalled(policy).await
    }

    async fn count_starved(&self, grace: Duration) -> Result<u64, StoreError> {
        self.inner.count_starved(grace).await
    }
}

// ============================================
// Claim Race Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_two_workers_race_for_one_entry() {
    let store = Arc::new(InMemoryQueueStore::new());
    let queue = TaskQueue::new(store.clone());
    let id = queue
        .enqueue(EnqueueRequest::new("uploads/a.pdf", "owner-a"))
        .await
        .unwrap();

    let first = Worker::new("worker-1", store.clone(), ok_handler(), worker_config());
    let second = Worker::new("worker-2", store.clone(), ok_handler(), worker_config());

    let (a, b) = tokio::join!(first.run_once(), second.run_once());
    let outcomes = [a.unwrap(), b.unwrap()];

    let processed = outcomes
        .iter()
        .filter(|o| matches!(o, Iteration::Processed { .. }))
        .count();
    assert_eq!(processed, 1);
    assert!(outcomes.contains(&Iteration::Idle));

    let entry = store.get_entry(id).await.unwrap();
    assert_eq!(entry.status, EntryStatus::Completed);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_claim_under_contention() {
    let store = Arc::new(InMemoryQueueStore::new());
    let id = store
        .enqueue(NewEntry {
            work_ref: "uploads/a.pdf".into(),
            owner_id: "owner-a".into(),
            priority: 0,
            max_attempts: 3,
            estimated_duration: None,
        })
        .await
        .unwrap();
    let limits = store.load_limits().await.unwrap();

    let mut handles = Vec::new();
    for n in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim(id, &format!("worker-{n}"), &limits).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(store.get_entry(id).await.unwrap().attempts, 1);
}

// ============================================
// Cap Enforcement Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_owner_cap_leaves_fourth_entry_queued() {
    let store = Arc::new(InMemoryQueueStore::with_limits(limits(10, 3, 20)));
    let queue = TaskQueue::new(store.clone());
    for n in 0..4 {
        queue
            .enqueue(EnqueueRequest::new(format!("uploads/{n}.pdf"), "owner-a"))
            .await
            .unwrap();
    }

    let gate = Arc::new(Semaphore::new(0));
    let pool = WorkerPool::new(store.clone(), gated_handler(gate.clone()), pool_config(5));
    pool.start().await.unwrap();

    eventually("three entries running", || {
        store.count_by_status(EntryStatus::Running) == 3
    })
    .await;

    // Idle workers keep polling; the fourth entry must stay queued
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.count_by_status(EntryStatus::Running), 3);
    assert_eq!(store.count_by_status(EntryStatus::Queued), 1);

    gate.add_permits(4);
    eventually("all entries completed", || {
        store.count_by_status(EntryStatus::Completed) == 4
    })
    .await;

    pool.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_system_and_user_caps_hold() {
    let store = Arc::new(InMemoryQueueStore::with_limits(limits(2, 2, 3)));
    let queue = TaskQueue::new(store.clone());
    for owner in ["owner-a", "owner-b", "owner-c"] {
        for n in 0..3 {
            queue
                .enqueue(EnqueueRequest::new(format!("uploads/{owner}-{n}.pdf"), owner))
                .await
                .unwrap();
        }
    }

    let gate = Arc::new(Semaphore::new(0));
    let pool = WorkerPool::new(store.clone(), gated_handler(gate.clone()), pool_config(8));
    pool.start().await.unwrap();

    eventually("system cap reached", || {
        store.count_by_status(EntryStatus::Running) == 3
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.count_by_status(EntryStatus::Running), 3);
    assert!(distinct_running_owners(&store) <= 2);
    for owner in ["owner-a", "owner-b", "owner-c"] {
        assert!(store.running_for_owner(owner) <= 2);
    }

    // Release one at a time and keep checking the caps
    for _ in 0..9 {
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(store.count_by_status(EntryStatus::Running) <= 3);
        assert!(distinct_running_owners(&store) <= 2);
    }

    gate.add_permits(9);
    eventually("all entries completed", || {
        store.count_by_status(EntryStatus::Completed) == 9
    })
    .await;

    pool.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_running_owner_not_starved_behind_user_cap() {
    let store = Arc::new(InMemoryQueueStore::with_limits(limits(1, 3, 20)));
    let caps = store.load_limits().await.unwrap();

    let first = store
        .enqueue(NewEntry {
            work_ref: "uploads/a-1.pdf".into(),
            owner_id: "owner-a".into(),
            priority: 0,
            max_attempts: 3,
            estimated_duration: None,
        })
        .await
        .unwrap();
    store.claim(first, "other-worker", &caps).await.unwrap().unwrap();

    // A full batch of higher-priority work from owners the user cap blocks
    for n in 0..20 {
        store
            .enqueue(NewEntry {
                work_ref: format!("uploads/new-{n}.pdf"),
                owner_id: format!("new-owner-{n}"),
                priority: 10,
                max_attempts: 3,
                estimated_duration: None,
            })
            .await
            .unwrap();
    }
    let second = store
        .enqueue(NewEntry {
            work_ref: "uploads/a-2.pdf".into(),
            owner_id: "owner-a".into(),
            priority: 0,
            max_attempts: 3,
            estimated_duration: None,
        })
        .await
        .unwrap();

    let worker = Worker::new("worker-1", store.clone(), ok_handler(), worker_config());
    assert_eq!(
        worker.run_once().await.unwrap(),
        Iteration::Processed {
            entry_id: second,
            resolution: Resolution::Completed
        }
    );
    assert_eq!(store.count_by_status(EntryStatus::Queued), 20);
}

#[tokio::test]
async fn test_configuration_change_applies_to_next_claim() {
    let store = Arc::new(InMemoryQueueStore::with_limits(limits(10, 1, 20)));
    let queue = TaskQueue::new(store.clone());
    for n in 0..2 {
        queue
            .enqueue(EnqueueRequest::new(format!("uploads/{n}.pdf"), "owner-a"))
            .await
            .unwrap();
    }

    let gate = Arc::new(Semaphore::new(0));
    let pool = WorkerPool::new(store.clone(), gated_handler(gate.clone()), pool_config(3));
    pool.start().await.unwrap();

    eventually("one entry running", || {
        store.count_by_status(EntryStatus::Running) == 1
    })
    .await;

    queue
        .set_configuration(ConfigKey::OwnerMaxConcurrent, 2)
        .await
        .unwrap();

    eventually("second entry running", || {
        store.count_by_status(EntryStatus::Running) == 2
    })
    .await;

    gate.add_permits(2);
    pool.shutdown(Duration::from_secs(2)).await.unwrap();
}

// ============================================
// Retry Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_max_attempts_exhausted() {
    let store = Arc::new(InMemoryQueueStore::new());
    let queue = TaskQueue::new(store.clone());
    let id = queue
        .enqueue(EnqueueRequest::new("uploads/a.pdf", "owner-a").with_max_attempts(3))
        .await
        .unwrap();

    let pool = WorkerPool::new(
        store.clone(),
        handler_fn(|_| async { Err(WorkError::retryable("model unavailable")) }),
        pool_config(2),
    );
    pool.start().await.unwrap();

    eventually("entry failed", || store.count_by_status(EntryStatus::Failed) == 1).await;
    pool.shutdown(Duration::from_secs(2)).await.unwrap();

    let entry = queue.get_entry(id).await.unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.attempts, 3);
    assert_eq!(entry.error_message.as_deref(), Some("model unavailable"));
    assert!(entry.completed_at.is_some());
}

#[tokio::test]
async fn test_attempts_never_decrease() {
    let store = Arc::new(InMemoryQueueStore::new());
    let id = store
        .enqueue(NewEntry {
            work_ref: "uploads/a.pdf".into(),
            owner_id: "owner-a".into(),
            priority: 0,
            max_attempts: 4,
            estimated_duration: None,
        })
        .await
        .unwrap();

    let worker = Worker::new(
        "worker-1",
        store.clone(),
        handler_fn(|_| async { Err(WorkError::retryable("flaky")) }),
        worker_config(),
    );

    let mut last = 0;
    for _ in 0..4 {
        worker.run_once().await.unwrap();
        let attempts = store.get_entry(id).await.unwrap().attempts;
        assert!(attempts >= last);
        assert!(attempts <= 4);
        last = attempts;
    }

    assert_eq!(worker.run_once().await.unwrap(), Iteration::Idle);
    assert_eq!(store.get_entry(id).await.unwrap().status, EntryStatus::Failed);
}

// ============================================
// Recovery Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_stalled_entry_recovered_and_completed() {
    let store = Arc::new(InMemoryQueueStore::new());
    let queue = TaskQueue::new(store.clone());
    let id = queue
        .enqueue(
            EnqueueRequest::new("uploads/a.pdf", "owner-a")
                .with_estimated_duration(Duration::from_millis(5)),
        )
        .await
        .unwrap();

    // A worker that claims and then disappears
    let limits = store.load_limits().await.unwrap();
    store.claim(id, "vanished", &limits).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let sweeper = RecoverySweeper::new(
        store.clone(),
        SweeperConfig::new()
            .with_retry(RetryPolicy::immediate())
            .with_min_timeout(Duration::ZERO),
    );
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.requeued, 1);

    let worker = Worker::new("worker-1", store.clone(), ok_handler(), worker_config());
    let iteration = worker.run_once().await.unwrap();
    assert_eq!(
        iteration,
        Iteration::Processed {
            entry_id: id,
            resolution: Resolution::Completed
        }
    );

    let entry = store.get_entry(id).await.unwrap();
    assert_eq!(entry.attempts, 2);

    // The vanished worker's late outcome is dropped
    assert!(!store.complete(id, "vanished").await.unwrap());
}

#[tokio::test]
async fn test_late_outcome_after_sweep_is_dropped() {
    let store = Arc::new(InMemoryQueueStore::new());
    let id = store
        .enqueue(NewEntry {
            work_ref: "uploads/a.pdf".into(),
            owner_id: "owner-a".into(),
            priority: 0,
            max_attempts: 3,
            estimated_duration: Some(Duration::from_millis(5)),
        })
        .await
        .unwrap();

    let sweep_store = store.clone();
    let worker = Worker::new(
        "slow-worker",
        store.clone(),
        handler_fn(move |_| {
            let store = sweep_store.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                RecoverySweeper::new(
                    store,
                    SweeperConfig::new()
                        .with_retry(RetryPolicy::fixed(Duration::from_secs(60)))
                        .with_min_timeout(Duration::ZERO),
                )
                .sweep_once()
                .await
                .map(|_| ())
                .map_err(|e| WorkError::retryable(e.to_string()))
            }
        }),
        worker_config(),
    );

    let iteration = worker.run_once().await.unwrap();
    assert_eq!(
        iteration,
        Iteration::Processed {
            entry_id: id,
            resolution: Resolution::Dropped
        }
    );
    assert_eq!(store.get_entry(id).await.unwrap().status, EntryStatus::Queued);
}

// ============================================
// Lifecycle Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_idempotent_lifecycle() {
    let store = Arc::new(InMemoryQueueStore::new());
    let pool = WorkerPool::new(store.clone(), ok_handler(), pool_config(3));

    // Shutdown before start is a no-op
    let report = pool.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.drained + report.aborted, 0);

    pool.start().await.unwrap();
    pool.start().await.unwrap();
    assert_eq!(pool.state(), PoolState::Running);
    assert_eq!(pool.status().await.unwrap().live_workers, 3);

    let report = pool.shutdown(Duration::from_secs(2)).await.unwrap();
    assert_eq!(report.drained, 3);
    assert_eq!(report.aborted, 0);

    let report = pool.shutdown(Duration::from_secs(2)).await.unwrap();
    assert_eq!(report.drained + report.aborted, 0);
    assert_eq!(pool.state(), PoolState::Stopped);

    // A stopped pool can be started again
    pool.start().await.unwrap();
    let queue = TaskQueue::new(store.clone());
    queue
        .enqueue(EnqueueRequest::new("uploads/a.pdf", "owner-a"))
        .await
        .unwrap();
    eventually("entry completed", || {
        store.count_by_status(EntryStatus::Completed) == 1
    })
    .await;
    pool.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_start_and_shutdown_do_not_interleave() {
    let store = Arc::new(InMemoryQueueStore::new());
    let pool = Arc::new(WorkerPool::new(store, ok_handler(), pool_config(2)));

    let (a, b) = tokio::join!(pool.start(), pool.start());
    a.unwrap();
    b.unwrap();
    assert_eq!(pool.status().await.unwrap().live_workers, 2);

    let (a, b) = tokio::join!(
        pool.shutdown(Duration::from_secs(2)),
        pool.shutdown(Duration::from_secs(2))
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.drained + b.drained, 2);
    assert_eq!(pool.state(), PoolState::Stopped);
}

#[test_log::test(tokio::test)]
async fn test_shutdown_drains_in_flight_work() {
    let store = Arc::new(InMemoryQueueStore::new());
    let queue = TaskQueue::new(store.clone());
    let id = queue
        .enqueue(EnqueueRequest::new("uploads/a.pdf", "owner-a"))
        .await
        .unwrap();

    let pool = WorkerPool::new(
        store.clone(),
        handler_fn(|_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }),
        pool_config(2),
    );
    pool.start().await.unwrap();

    eventually("entry running", || {
        store.count_by_status(EntryStatus::Running) == 1
    })
    .await;

    let report = pool.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(report.drained, 2);
    assert_eq!(report.aborted, 0);
    assert_eq!(
        store.get_entry(id).await.unwrap().status,
        EntryStatus::Completed
    );
}

#[tokio::test]
async fn test_shutdown_timeout_aborts_stuck_workers() {
    let store = Arc::new(InMemoryQueueStore::new());
    let queue = TaskQueue::new(store.clone());
    queue
        .enqueue(EnqueueRequest::new("uploads/a.pdf", "owner-a"))
        .await
        .unwrap();

    let pool = WorkerPool::new(
        store.clone(),
        handler_fn(|_| async {
            std::future::pending::<()>().await;
            Ok(())
        }),
        pool_config(2),
    );
    pool.start().await.unwrap();

    eventually("entry running", || {
        store.count_by_status(EntryStatus::Running) == 1
    })
    .await;

    let report = pool.shutdown(Duration::from_millis(100)).await.unwrap();
    assert_eq!(report.aborted, 1);
    assert_eq!(report.drained, 1);
    assert_eq!(pool.state(), PoolState::Stopped);

    // The abandoned entry is left for the sweeper
    assert_eq!(store.count_by_status(EntryStatus::Running), 1);
}

// ============================================
// Supervision Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_dead_workers_are_replaced() {
    let store = Arc::new(FlakyStore::new());
    store.failing.store(true, Ordering::SeqCst);

    let config = pool_config(2).with_worker(worker_config().with_max_consecutive_errors(1));
    let pool = WorkerPool::new(store.clone(), ok_handler(), config);
    pool.start().await.unwrap();

    let mut restarts = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while restarts == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no worker was replaced");
        tokio::time::sleep(Duration::from_millis(10)).await;
        restarts = pool.status().await.unwrap().restarts;
    }

    store.failing.store(false, Ordering::SeqCst);
    let id = store
        .enqueue(NewEntry {
            work_ref: "uploads/a.pdf".into(),
            owner_id: "owner-a".into(),
            priority: 0,
            max_attempts: 3,
            estimated_duration: None,
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let entry = store.get_entry(id).await.unwrap();
        if entry.status == EntryStatus::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "replacement workers never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = pool.status().await.unwrap();
    assert_eq!(status.pool_size, 2);
    assert!(status.restarts >= 1);

    pool.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_status_reports_queue_counts() {
    let store = Arc::new(InMemoryQueueStore::new());
    let queue = TaskQueue::new(store.clone());
    for owner in ["owner-a", "owner-b"] {
        queue
            .enqueue(EnqueueRequest::new(format!("uploads/{owner}.pdf"), owner))
            .await
            .unwrap();
    }
    let cancelled = queue
        .enqueue(EnqueueRequest::new("uploads/c.pdf", "owner-a"))
        .await
        .unwrap();
    queue.cancel(cancelled).await.unwrap();

    let pool = WorkerPool::new(store.clone(), ok_handler(), pool_config(1));
    let status = pool.status().await.unwrap();
    assert_eq!(status.state, PoolState::Stopped);
    assert_eq!(status.live_workers, 0);
    assert_eq!(status.queue.counts.queued, 2);
    assert_eq!(status.queue.counts.cancelled, 1);
    assert_eq!(status.queue.per_owner["owner-a"].queued, 1);
    assert_eq!(status.queue.per_owner["owner-a"].cancelled, 1);
}
