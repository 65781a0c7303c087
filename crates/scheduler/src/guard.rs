//! Concurrency guard
//!
//! Answers "may this owner start `requested` more entries right now?" from a
//! fresh read of the store. The answer is advisory: the claim statement
//! re-checks the caps atomically.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::persistence::{ActiveCounts, QueueLimits, QueueStore, StoreError};

/// Counters and limits behind an admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDetail {
    pub system_active: u64,
    pub system_limit: u32,
    pub owner_active: u64,
    pub owner_limit: u32,
    /// Distinct owners with queued or running entries
    pub active_owners: u64,
    pub max_concurrent_users: u32,
}

impl fmt::Display for AdmissionDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} slots used ({}/{} system)",
            self.owner_active, self.owner_limit, self.system_active, self.system_limit
        )
    }
}

/// Result of [`ConcurrencyGuard::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,
    pub detail: AdmissionDetail,
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.allowed { "allowed" } else { "rejected" };
        write!(f, "{verdict}: {}", self.detail)
    }
}

/// Running entries against the system cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCapacity {
    pub running: u64,
    pub limit: u32,
}

impl SystemCapacity {
    pub fn has_spare(&self) -> bool {
        self.running < u64::from(self.limit)
    }

    pub fn spare(&self) -> u64 {
        u64::from(self.limit).saturating_sub(self.running)
    }
}

/// Pure admission rule
pub fn evaluate(counts: ActiveCounts, limits: &QueueLimits, requested: u32) -> Admission {
    let requested = u64::from(requested);
    let allowed = counts.system_active + requested <= u64::from(limits.system_max_concurrent)
        && counts.owner_active + requested <= u64::from(limits.owner_max_concurrent);

    Admission {
        allowed,
        detail: AdmissionDetail {
            system_active: counts.system_active,
            system_limit: limits.system_max_concurrent,
            owner_active: counts.owner_active,
            owner_limit: limits.owner_max_concurrent,
            active_owners: counts.active_owners,
            max_concurrent_users: limits.max_concurrent_users,
        },
    }
}

/// Read-only admission checks against the queue store
#[derive(Clone)]
pub struct ConcurrencyGuard {
    store: Arc<dyn QueueStore>,
}

impl ConcurrencyGuard {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Decide whether `owner_id` may start `requested` more entries
    ///
    /// Counts queued and running entries; limits are read fresh on every call.
    #[instrument(skip(self))]
    pub async fn admit(&self, owner_id: &str, requested: u32) -> Result<Admission, StoreError> {
        let limits = self.store.load_limits().await?;
        let counts = self.store.active_counts(owner_id).await?;
        let admission = evaluate(counts, &limits, requested);

        debug!(
            owner_id,
            allowed = admission.allowed,
            detail = %admission.detail,
            "Admission evaluated"
        );

        Ok(admission)
    }

    /// Running entries against `system_max_concurrent`
    pub async fn system_capacity(&self) -> Result<SystemCapacity, StoreError> {
        let limits = self.store.load_limits().await?;
        let running = self.store.running_count().await?;
        Ok(SystemCapacity {
            running,
            limit: limits.system_max_concurrent,
        })
    }
}
