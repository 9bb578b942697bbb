//! In-memory membership store backed by DashMap for lock-free concurrent
//! access. Reference implementation of the store contract; membership and
//! history live in process memory, durability is the scheduler journal's
//! concern.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use cohort_core::types::{HistoryRecord, Segment, User};
use cohort_core::{CohortError, CohortResult};

use crate::MembershipStore;

pub struct InMemoryStore {
    segments: DashMap<String, Segment>,
    users: DashMap<i64, User>,
    /// user id -> slugs of segments the user belongs to.
    links: DashMap<i64, HashSet<String>>,
    history: Mutex<Vec<HistoryRecord>>,
    next_user_id: AtomicI64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            segments: DashMap::new(),
            users: DashMap::new(),
            links: DashMap::new(),
            history: Mutex::new(Vec::new()),
            next_user_id: AtomicI64::new(1),
        }
    }

    /// Seed `count` users, for tests and local runs.
    pub fn seed_users(&self, count: usize) -> Vec<i64> {
        (0..count)
            .map(|_| {
                let id = self.next_user_id.fetch_add(1, Ordering::SeqCst);
                self.users.insert(
                    id,
                    User {
                        id,
                        created_at: Utc::now(),
                    },
                );
                id
            })
            .collect()
    }
}

#[async_trait]
impl MembershipStore for InMemoryStore {
    async fn create_segment(&self, slug: &str) -> CohortResult<Segment> {
        match self.segments.entry(slug.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CohortError::Duplicate(slug.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let segment = Segment {
                    id: Uuid::new_v4(),
                    slug: slug.to_string(),
                    created_at: Utc::now(),
                };
                vacant.insert(segment.clone());
                Ok(segment)
            }
        }
    }

    async fn delete_segment(&self, slug: &str) -> CohortResult<()> {
        if self.segments.remove(slug).is_none() {
            return Err(CohortError::NotFound(format!("segment {slug}")));
        }
        // Cascade: drop the link from every user that carries it.
        for mut entry in self.links.iter_mut() {
            entry.value_mut().remove(slug);
        }
        Ok(())
    }

    async fn create_user(&self) -> CohortResult<User> {
        let id = self.next_user_id.fetch_add(1, Ordering::SeqCst);
        let user = User {
            id,
            created_at: Utc::now(),
        };
        self.users.insert(id, user.clone());
        Ok(user)
    }

    async fn user_exists(&self, user_id: i64) -> CohortResult<bool> {
        Ok(self.users.contains_key(&user_id))
    }

    async fn list_user_ids(&self) -> CohortResult<Vec<i64>> {
        Ok(self.users.iter().map(|u| *u.key()).collect())
    }

    async fn add_user_segments(&self, user_id: i64, slugs: &[String]) -> CohortResult<Vec<String>> {
        let mut user_links = self.links.entry(user_id).or_default();
        let mut added = Vec::new();
        for slug in slugs {
            // Unknown slugs are skipped, matching the join against the
            // segments table a relational store would do.
            if !self.segments.contains_key(slug) {
                continue;
            }
            if user_links.insert(slug.clone()) {
                added.push(slug.clone());
            }
        }
        Ok(added)
    }

    async fn remove_user_segments(
        &self,
        user_id: i64,
        slugs: &[String],
    ) -> CohortResult<Vec<String>> {
        let mut removed = Vec::new();
        if let Some(mut user_links) = self.links.get_mut(&user_id) {
            for slug in slugs {
                if user_links.remove(slug) {
                    removed.push(slug.clone());
                }
            }
        }
        Ok(removed)
    }

    async fn list_user_segments(&self, user_id: i64) -> CohortResult<Vec<String>> {
        let mut slugs: Vec<String> = self
            .links
            .get(&user_id)
            .map(|links| links.iter().cloned().collect())
            .unwrap_or_default();
        slugs.sort();
        Ok(slugs)
    }

    async fn append_history(&self, record: HistoryRecord) -> CohortResult<()> {
        self.history.lock().push(record);
        Ok(())
    }

    async fn list_history(
        &self,
        user_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CohortResult<Vec<HistoryRecord>> {
        let mut records: Vec<HistoryRecord> = self
            .history
            .lock()
            .iter()
            .filter(|r| r.user_id == user_id && r.executed_at >= from && r.executed_at < to)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.executed_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cohort_core::types::MembershipOp;

    fn slugs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn create_segment_rejects_duplicate_slug() {
        let store = InMemoryStore::new();
        store.create_segment("promo").await.unwrap();
        let err = store.create_segment("promo").await.unwrap_err();
        assert!(matches!(err, CohortError::Duplicate(_)));
    }

    #[tokio::test]
    async fn add_is_idempotent_per_link() {
        let store = InMemoryStore::new();
        store.create_segment("promo").await.unwrap();
        let user = store.create_user().await.unwrap();

        let first = store
            .add_user_segments(user.id, &slugs(&["promo"]))
            .await
            .unwrap();
        assert_eq!(first, slugs(&["promo"]));

        let second = store
            .add_user_segments(user.id, &slugs(&["promo"]))
            .await
            .unwrap();
        assert!(second.is_empty());

        let listed = store.list_user_segments(user.id).await.unwrap();
        assert_eq!(listed, slugs(&["promo"]));
    }

    #[tokio::test]
    async fn add_skips_unknown_slugs() {
        let store = InMemoryStore::new();
        store.create_segment("promo").await.unwrap();
        let user = store.create_user().await.unwrap();

        let added = store
            .add_user_segments(user.id, &slugs(&["promo", "ghost"]))
            .await
            .unwrap();
        assert_eq!(added, slugs(&["promo"]));
    }

    #[tokio::test]
    async fn remove_absent_link_is_noop() {
        let store = InMemoryStore::new();
        store.create_segment("promo").await.unwrap();
        let user = store.create_user().await.unwrap();

        let removed = store
            .remove_user_segments(user.id, &slugs(&["promo"]))
            .await
            .unwrap();
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn delete_segment_cascades_links() {
        let store = InMemoryStore::new();
        store.create_segment("promo").await.unwrap();
        let user = store.create_user().await.unwrap();
        store
            .add_user_segments(user.id, &slugs(&["promo"]))
            .await
            .unwrap();

        store.delete_segment("promo").await.unwrap();
        assert!(store.list_user_segments(user.id).await.unwrap().is_empty());

        let err = store.delete_segment("promo").await.unwrap_err();
        assert!(matches!(err, CohortError::NotFound(_)));
    }

    #[tokio::test]
    async fn history_filter_is_half_open() {
        let store = InMemoryStore::new();
        let at = |y, m, d| Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap();
        for (month, day) in [(7, 31), (8, 1), (8, 31), (9, 1)] {
            store
                .append_history(HistoryRecord {
                    user_id: 7,
                    segment_slug: "promo".into(),
                    operation: MembershipOp::Added,
                    executed_at: at(2023, month, day),
                })
                .await
                .unwrap();
        }

        let from = Utc.with_ymd_and_hms(2023, 8, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2023, 9, 1, 0, 0, 0).unwrap();
        let records = store.list_history(7, from, to).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.windows(2).all(|w| w[0].executed_at <= w[1].executed_at));
    }
}
