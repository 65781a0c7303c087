//! PostgreSQL implementation of QueueStore
//!
//! Production persistence using PostgreSQL with:
//! - Atomic conditional claims (rows affected decides the race)
//! - Cap checks evaluated inside the claiming statement
//! - Embedded sqlx migrations for the schema

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;

/// Advisory lock key serializing claim transactions ("docket" in ASCII)
const CLAIM_LOCK_KEY: i64 = 0x646f_636b_6574;

const ENTRY_COLUMNS: &str = "id, work_ref, owner_id, priority, status, worker_id, queued_at, \
     started_at, completed_at, attempts, max_attempts, error_message, estimated_duration_ms, \
     available_at";

/// PostgreSQL implementation of QueueStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use docket_scheduler::PostgresQueueStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/docket").await?;
/// let store = PostgresQueueStore::new(pool);
/// store.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
}

impl PostgresQueueStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn entry_exists(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS one FROM task_queue_entries WHERE id = $1")
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error("check entry"))?;
        Ok(row.is_some())
    }
}

fn database_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", operation, e);
        StoreError::Database(e.to_string())
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn count(row: &PgRow, column: &str) -> u64 {
    row.get::<i64, _>(column).max(0) as u64
}

fn entry_from_row(row: &PgRow) -> Result<TaskQueueEntry, StoreError> {
    let status: String = row.get("status");
    let estimated_ms: Option<i64> = row.get("estimated_duration_ms");

    Ok(TaskQueueEntry {
        id: row.get("id"),
        work_ref: row.get("work_ref"),
        owner_id: row.get("owner_id"),
        priority: row.get("priority"),
        status: status.parse()?,
        worker_id: row.get("worker_id"),
        queued_at: row.get("queued_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        attempts: row.get::<i32, _>("attempts").max(0) as u32,
        max_attempts: row.get::<i32, _>("max_attempts").max(0) as u32,
        error_message: row.get("error_message"),
        estimated_duration: estimated_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
        available_at: row.get("available_at"),
    })
}

fn config_from_row(row: &PgRow) -> Result<ConfigEntry, StoreError> {
    let key: String = row.get("key");
    Ok(ConfigEntry {
        key: key.parse()?,
        value: row.get::<i32, _>("value").max(0) as u32,
        description: row.get("description"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self))]
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Migration(e.to_string())
            })?;

        debug!("task queue schema is up to date");
        Ok(())
    }

    #[instrument(skip(self, entry), fields(owner_id = %entry.owner_id))]
    async fn enqueue(&self, entry: NewEntry) -> Result<Uuid, StoreError> {
        let entry_id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO task_queue_entries (
                id, work_ref, owner_id, priority, max_attempts, estimated_duration_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry_id)
        .bind(&entry.work_ref)
        .bind(&entry.owner_id)
        .bind(entry.priority)
        .bind(entry.max_attempts as i32)
        .bind(entry.estimated_duration.map(|d| d.as_millis() as i64))
        .execute(&self.pool)
        .await
        .map_err(database_error("enqueue entry"))?;

        debug!(%entry_id, "enqueued entry");
        Ok(entry_id)
    }

    #[instrument(skip(self))]
    async fn get_entry(&self, entry_id: Uuid) -> Result<TaskQueueEntry, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM task_queue_entries WHERE id = $1"
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("load entry"))?
        .ok_or(StoreError::EntryNotFound(entry_id))?;

        entry_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn cancel(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE task_queue_entries
            SET status = 'cancelled',
                completed_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .map_err(database_error("cancel entry"))?;

        if result.rows_affected() == 1 {
            debug!(%entry_id, "cancelled entry");
            return Ok(true);
        }

        if !self.entry_exists(entry_id).await? {
            return Err(StoreError::EntryNotFound(entry_id));
        }
        Ok(false)
    }

    #[instrument(skip(self))]
    async fn queue_status(&self) -> Result<QueueStatus, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT owner_id, status, COUNT(*) AS count
            FROM task_queue_entries
            GROUP BY owner_id, status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("load queue status"))?;

        let mut status = QueueStatus::default();
        for row in rows {
            let owner_id: String = row.get("owner_id");
            let entry_status: EntryStatus = row.get::<String, _>("status").parse()?;
            let n = count(&row, "count");

            status.counts.add(entry_status, n);
            status.per_owner.entry(owner_id).or_default().add(entry_status, n);
        }

        let ready = sqlx::query(
            r#"
            SELECT COUNT(*) AS ready
            FROM task_queue_entries
            WHERE status = 'queued' AND available_at <= NOW()
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(database_error("count ready entries"))?;
        status.ready = count(&ready, "ready");

        Ok(status)
    }

    #[instrument(skip(self))]
    async fn list_configuration(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key, value, description, updated_at
            FROM queue_configuration
            ORDER BY key
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("load configuration"))?;

        rows.iter().map(config_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn set_configuration(
        &self,
        key: ConfigKey,
        value: u32,
    ) -> Result<ConfigEntry, StoreError> {
        if value == 0 || value > i32::MAX as u32 {
            return Err(StoreError::InvalidConfiguration(format!(
                "{key} must be between 1 and {}",
                i32::MAX
            )));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO queue_configuration (key, value, description, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                updated_at = NOW()
            RETURNING key, value, description, updated_at
            "#,
        )
        .bind(key.as_str())
        .bind(value as i32)
        .bind(key.description())
        .fetch_one(&self.pool)
        .await
        .map_err(database_error("update configuration"))?;

        debug!(%key, value, "updated configuration");
        config_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn active_counts(&self, owner_id: &str) -> Result<ActiveCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS system_active,
                   COUNT(*) FILTER (WHERE owner_id = $1) AS owner_active,
                   COUNT(DISTINCT owner_id) AS active_owners
            FROM task_queue_entries
            WHERE status IN ('queued', 'running')
            "#,
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await
        .map_err(database_error("count active entries"))?;

        Ok(ActiveCounts {
            system_active: count(&row, "system_active"),
            owner_active: count(&row, "owner_active"),
            active_owners: count(&row, "active_owners"),
        })
    }

    async fn running_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS running FROM task_queue_entries WHERE status = 'running'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(database_error("count running entries"))?;

        Ok(count(&row, "running"))
    }

    #[instrument(skip(self, limits))]
    async fn list_candidates(
        &self,
        limits: &QueueLimits,
        batch_size: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.owner_id, e.priority
            FROM task_queue_entries e
            WHERE e.status = 'queued'
              AND e.available_at <= NOW()
              AND (
                  SELECT COUNT(*)
                  FROM task_queue_entries r
                  WHERE r.status = 'running' AND r.owner_id = e.owner_id
              ) < $1
              AND (
                  EXISTS (
                      SELECT 1 FROM task_queue_entries r
                      WHERE r.status = 'running' AND r.owner_id = e.owner_id
                  )
                  OR (
                      SELECT COUNT(DISTINCT r.owner_id) FROM task_queue_entries r
                      WHERE r.status = 'running'
                  ) < $3
              )
            ORDER BY e.priority DESC, e.queued_at ASC, e.id ASC
            LIMIT $2
            "#,
        )
        .bind(limits.owner_max_concurrent as i64)
        .bind(batch_size as i64)
        .bind(limits.max_concurrent_users as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("list candidates"))?;

        Ok(rows
            .iter()
            .map(|row| Candidate {
                id: row.get("id"),
                owner_id: row.get("owner_id"),
                priority: row.get("priority"),
            })
            .collect())
    }

    #[instrument(skip(self, limits))]
    async fn claim(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        limits: &QueueLimits,
    ) -> Result<Option<TaskQueueEntry>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(database_error("begin claim"))?;

        // Serialize claimers so the cap subqueries below see every committed claim
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLAIM_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(database_error("acquire claim lock"))?;

        // clock_timestamp(), not NOW(): the transaction may have waited on the lock
        let row = sqlx::query(&format!(
            r#"
            UPDATE task_queue_entries t
            SET status = 'running',
                worker_id = $2,
                started_at = clock_timestamp(),
                attempts = t.attempts + 1
            WHERE t.id = $1
              AND t.status = 'queued'
              AND t.attempts < t.max_attempts
              AND t.available_at <= clock_timestamp()
              AND (
                  SELECT COUNT(*) FROM task_queue_entries r WHERE r.status = 'running'
              ) < $3
              AND (
                  SELECT COUNT(*) FROM task_queue_entries r
                  WHERE r.status = 'running' AND r.owner_id = t.owner_id
              ) < $4
              AND (
                  EXISTS (
                      SELECT 1 FROM task_queue_entries r
                      WHERE r.status = 'running' AND r.owner_id = t.owner_id
                  )
                  OR (
                      SELECT COUNT(DISTINCT r.owner_id) FROM task_queue_entries r
                      WHERE r.status = 'running'
                  ) < $5
              )
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(entry_id)
        .bind(worker_id)
        .bind(limits.system_max_concurrent as i64)
        .bind(limits.owner_max_concurrent as i64)
        .bind(limits.max_concurrent_users as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(database_error("claim entry"))?;

        tx.commit().await.map_err(database_error("commit claim"))?;

        match row {
            Some(row) => {
                let entry = entry_from_row(&row)?;
                debug!(%entry_id, worker_id, attempts = entry.attempts, "claimed entry");
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn complete(&self, entry_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE task_queue_entries
            SET status = 'completed',
                worker_id = NULL,
                completed_at = NOW()
            WHERE id = $1 AND status = 'running' AND worker_id = $2
            "#,
        )
        .bind(entry_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(database_error("complete entry"))?;

        if result.rows_affected() == 1 {
            debug!(%entry_id, "completed entry");
            return Ok(true);
        }

        if !self.entry_exists(entry_id).await? {
            return Err(StoreError::EntryNotFound(entry_id));
        }
        Ok(false)
    }

    #[instrument(skip(self, failure), fields(retryable = failure.retryable))]
    async fn fail(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        failure: &Failure,
    ) -> Result<Option<EntryStatus>, StoreError> {
        // All SET expressions see the pre-update row, so the retry decision is
        // made once against the attempts value the claim wrote.
        let row = sqlx::query(
            r#"
            UPDATE task_queue_entries
            SET status = CASE WHEN $3 AND attempts < max_attempts THEN 'queued' ELSE 'failed' END,
                worker_id = NULL,
                started_at = CASE WHEN $3 AND attempts < max_attempts THEN NULL ELSE started_at END,
                completed_at = CASE WHEN $3 AND attempts < max_attempts THEN NULL ELSE NOW() END,
                available_at = CASE WHEN $3 AND attempts < max_attempts
                    THEN NOW() + $5::float8 * INTERVAL '1 millisecond'
                    ELSE available_at END,
                error_message = $4
            WHERE id = $1 AND status = 'running' AND worker_id = $2
            RETURNING status
            "#,
        )
        .bind(entry_id)
        .bind(worker_id)
        .bind(failure.retryable)
        .bind(&failure.message)
        .bind(millis(failure.retry_after))
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("fail entry"))?;

        match row {
            Some(row) => {
                let status: EntryStatus = row.get::<String, _>("status").parse()?;
                debug!(%entry_id, %status, "recorded failure");
                Ok(Some(status))
            }
            None => {
                if !self.entry_exists(entry_id).await? {
                    return Err(StoreError::EntryNotFound(entry_id));
                }
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    async fn list_stalled(
        &self,
        policy: &TimeoutPolicy,
    ) -> Result<Vec<TaskQueueEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM task_queue_entries
            WHERE status = 'running'
              AND started_at IS NOT NULL
              AND started_at
                  + COALESCE(
                        GREATEST(estimated_duration_ms * $2::float8, $3::float8),
                        $1::float8
                    ) * INTERVAL '1 millisecond'
                  < NOW()
            ORDER BY started_at ASC
            "#
        ))
        .bind(millis(policy.default_timeout))
        .bind(policy.multiplier.max(1.0))
        .bind(millis(policy.min_timeout))
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("list stalled entries"))?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn count_starved(&self, grace: Duration) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS starved
            FROM task_queue_entries
            WHERE status = 'queued'
              AND available_at <= NOW() - $1::float8 * INTERVAL '1 millisecond'
            "#,
        )
        .bind(millis(grace))
        .fetch_one(&self.pool)
        .await
        .map_err(database_error("count starved entries"))?;

        Ok(count(&row, "starved"))
    }
}
