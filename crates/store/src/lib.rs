//! Membership store contract and reference implementation.
//!
//! The store is the single source of truth for segment definitions,
//! segment-user links and the append-only history log. The orchestrator
//! only ever talks to the `MembershipStore` trait; a relational backend
//! slots in behind the same seam.

pub mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cohort_core::types::{HistoryRecord, Segment, User};
use cohort_core::CohortResult;

/// Durable mapping of segment-user links plus the history log.
///
/// Mutation semantics:
/// - `add_user_segments` skips unknown slugs and already-present links
///   (conflicting inserts are no-ops, not errors);
/// - `remove_user_segments` skips absent links;
/// - both return the slugs actually affected so callers can write one
///   history row per real transition.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Create a segment. Fails with `Duplicate` when the slug is taken.
    async fn create_segment(&self, slug: &str) -> CohortResult<Segment>;

    /// Delete a segment by slug, cascading to all of its membership links.
    /// Fails with `NotFound` when no such segment exists.
    async fn delete_segment(&self, slug: &str) -> CohortResult<()>;

    /// Create a user with a store-assigned id.
    async fn create_user(&self) -> CohortResult<User>;

    async fn user_exists(&self, user_id: i64) -> CohortResult<bool>;

    /// All known user ids, used by the auto-assign sampler.
    async fn list_user_ids(&self) -> CohortResult<Vec<i64>>;

    /// Link the user to each existing segment in `slugs`. Returns the slugs
    /// that were newly linked.
    async fn add_user_segments(&self, user_id: i64, slugs: &[String]) -> CohortResult<Vec<String>>;

    /// Unlink the user from each segment in `slugs`. Returns the slugs that
    /// were actually unlinked.
    async fn remove_user_segments(
        &self,
        user_id: i64,
        slugs: &[String],
    ) -> CohortResult<Vec<String>>;

    /// Slugs of all segments the user currently belongs to.
    async fn list_user_segments(&self, user_id: i64) -> CohortResult<Vec<String>>;

    /// Append one history row. The log is append-only.
    async fn append_history(&self, record: HistoryRecord) -> CohortResult<()>;

    /// History rows for the user with `executed_at` in `[from, to)`,
    /// ordered by `executed_at`.
    async fn list_history(
        &self,
        user_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CohortResult<Vec<HistoryRecord>>;
}
