//! Durable TTL expiration scheduling.
//!
//! Every add-with-TTL produces one expiration entry. The entry is persisted
//! to an [`ExpirationLog`] *before* the add is acknowledged, survives process
//! restarts, and is delivered to the removal callback at least once; the
//! callback is required to be idempotent, which together yields effective
//! exactly-once execution.

pub mod journal;
pub mod scheduler;

pub use journal::{FileExpirationLog, MemoryExpirationLog};
pub use scheduler::{ExpirationScheduler, ExpireHandler, SchedulerSettings};

use chrono::{DateTime, Utc};
use cohort_core::CohortResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a scheduled expiration.
///
/// `Pending -> Done` when the removal callback succeeds, or
/// `Pending -> Cancelled` when the link is manually removed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationStatus {
    Pending,
    Done,
    Cancelled,
}

/// One scheduled future removal, tied to one TTL-bearing assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirationEntry {
    pub id: Uuid,
    pub user_id: i64,
    pub segment_slug: String,
    pub fire_at: DateTime<Utc>,
    pub status: ExpirationStatus,
}

impl ExpirationEntry {
    pub fn new(user_id: i64, segment_slug: impl Into<String>, fire_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            segment_slug: segment_slug.into(),
            fire_at,
            status: ExpirationStatus::Pending,
        }
    }
}

/// Durable record of scheduled expirations.
///
/// An in-memory-only timer set is insufficient here: entries must outlive
/// the process so pending removals can be recovered after a restart.
pub trait ExpirationLog: Send + Sync {
    /// Persist a new entry. Must be durable before returning, since the
    /// caller acknowledges the add to its client right after.
    fn append(&self, entry: &ExpirationEntry) -> CohortResult<()>;

    /// Record a status transition for an existing entry.
    fn mark(&self, id: Uuid, status: ExpirationStatus) -> CohortResult<()>;

    /// All entries still pending, in no particular order. Called on startup
    /// to rebuild the in-memory timer state.
    fn load_pending(&self) -> CohortResult<Vec<ExpirationEntry>>;
}
