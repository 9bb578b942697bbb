//! Domain types shared across the workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A named tag representing a cohort of users.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Segment {
    pub id: Uuid,
    /// Unique human-readable key, e.g. `DISCOUNT_30_PERCENT`.
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: i64,
    pub created_at: DateTime<Utc>,
}

/// Direction of a single membership transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MembershipOp {
    Added,
    Removed,
}

impl std::fmt::Display for MembershipOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipOp::Added => write!(f, "added"),
            MembershipOp::Removed => write!(f, "removed"),
        }
    }
}

/// Immutable audit entry for one membership transition. Appended for every
/// manual or TTL-triggered change, never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HistoryRecord {
    pub user_id: i64,
    pub segment_slug: String,
    pub operation: MembershipOp,
    pub executed_at: DateTime<Utc>,
}
