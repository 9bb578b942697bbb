//! Segment orchestrator.
//!
//! Coordinates the membership store, the sampler and the expiration
//! scheduler. Every store call is bounded by a request timeout; the
//! scheduler enqueue is durable before an add is acknowledged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use cohort_core::types::{HistoryRecord, MembershipOp, Segment, User};
use cohort_core::{CohortError, CohortResult};
use cohort_scheduler::{ExpirationScheduler, ExpireHandler};
use cohort_store::MembershipStore;

use crate::report::{Report, ReportWriter};
use crate::sampler::CohortSampler;

/// Outcome of one `update_user_segments` call. `added` and `removed` count
/// rows actually changed; already-present and absent links are no-ops.
#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
pub struct UpdateSummary {
    /// Effective user id: differs from the requested one when the user was
    /// created lazily during the call.
    pub user_id: i64,
    pub added: u64,
    pub removed: u64,
}

pub struct SegmentService {
    store: Arc<dyn MembershipStore>,
    scheduler: Arc<ExpirationScheduler>,
    sampler: Arc<dyn CohortSampler>,
    reports: ReportWriter,
    store_timeout: Duration,
    /// Fires whose removal committed but whose history row is still owed.
    /// The refire retries only the append for these pairs.
    owed_history: DashMap<(i64, String), ()>,
}

impl SegmentService {
    pub fn new(
        store: Arc<dyn MembershipStore>,
        scheduler: Arc<ExpirationScheduler>,
        sampler: Arc<dyn CohortSampler>,
        reports: ReportWriter,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            sampler,
            reports,
            store_timeout,
            owed_history: DashMap::new(),
        }
    }

    /// Bound a store call by the configured request timeout. Timeouts cancel
    /// the in-flight call; already-durable scheduler entries stay put.
    async fn store_call<T>(
        &self,
        fut: impl std::future::Future<Output = CohortResult<T>>,
    ) -> CohortResult<T> {
        let ms = self.store_timeout.as_millis() as u64;
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CohortError::Timeout(ms)),
        }
    }

    async fn record_history(
        &self,
        user_id: i64,
        slug: &str,
        operation: MembershipOp,
    ) -> CohortResult<()> {
        self.store_call(self.store.append_history(HistoryRecord {
            user_id,
            segment_slug: slug.to_string(),
            operation,
            executed_at: Utc::now(),
        }))
        .await
    }

    /// Create a segment, optionally auto-assigning it to a random share of
    /// the existing user base. Auto-assignment is best-effort: its failure
    /// is logged and reported but never rolls the creation back.
    pub async fn create_segment(
        &self,
        slug: &str,
        auto_assign_percent: i64,
    ) -> CohortResult<Segment> {
        validate_slug(slug)?;
        if !(0..=100).contains(&auto_assign_percent) {
            return Err(CohortError::Invalid(format!(
                "auto_assign_percent must be within 0..=100, got {auto_assign_percent}"
            )));
        }

        let segment = self.store_call(self.store.create_segment(slug)).await?;
        info!(slug, "Segment created");

        if auto_assign_percent > 0 {
            match self.auto_assign(slug, auto_assign_percent).await {
                Ok(assigned) => {
                    info!(slug, assigned, "Segment auto-assigned to sampled users")
                }
                Err(e) => {
                    warn!(error = %e, slug, "Auto-assignment failed, segment creation stands")
                }
            }
        }

        Ok(segment)
    }

    async fn auto_assign(&self, slug: &str, percent: i64) -> CohortResult<u64> {
        let users = self.store_call(self.store.list_user_ids()).await?;
        let chosen = self.sampler.select_percent(&users, percent);
        let slugs = [slug.to_string()];

        let mut assigned = 0u64;
        let mut failed = 0u64;
        for user_id in chosen {
            match self.store_call(self.store.add_user_segments(user_id, &slugs)).await {
                Ok(added) if !added.is_empty() => {
                    assigned += 1;
                    if let Err(e) = self.record_history(user_id, slug, MembershipOp::Added).await {
                        warn!(error = %e, user_id, slug, "History append failed for auto-assign");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    failed += 1;
                    warn!(error = %e, user_id, slug, "Auto-assign add failed");
                }
            }
        }
        if failed > 0 {
            warn!(slug, failed, "Auto-assignment partially failed");
        }
        Ok(assigned)
    }

    /// Delete a segment by slug, cascading link removal. Pending expirations
    /// for the segment are left alone; they fire into no-ops.
    pub async fn delete_segment(&self, slug: &str) -> CohortResult<()> {
        validate_slug(slug)?;
        self.store_call(self.store.delete_segment(slug)).await?;
        info!(slug, "Segment deleted");
        Ok(())
    }

    pub async fn create_user(&self) -> CohortResult<User> {
        let user = self.store_call(self.store.create_user()).await?;
        info!(user_id = user.id, "User created");
        Ok(user)
    }

    pub async fn list_user_segments(&self, user_id: i64) -> CohortResult<Vec<String>> {
        validate_user_id(user_id)?;
        self.store_call(self.store.list_user_segments(user_id)).await
    }

    /// Add and/or remove segments for one user.
    ///
    /// Adds are applied before deletes. Each actually-changed link yields a
    /// history row; each requested add with `ttl_seconds > 0` yields one
    /// durable expiration entry, persisted before this method returns.
    /// Failures after the add batch committed surface as `PartialUpdate`
    /// carrying the committed add count.
    pub async fn update_user_segments(
        &self,
        user_id: i64,
        add_slugs: &[String],
        ttl_seconds: i64,
        delete_slugs: &[String],
    ) -> CohortResult<UpdateSummary> {
        validate_user_id(user_id)?;
        if ttl_seconds < 0 {
            return Err(CohortError::Invalid(format!(
                "ttl_seconds must be non-negative, got {ttl_seconds}"
            )));
        }
        for slug in add_slugs.iter().chain(delete_slugs) {
            validate_slug(slug)?;
        }

        // The store assigns ids; when the user did not exist, everything
        // below must use the id creation returned, not the requested one.
        let user_id = self.ensure_user(user_id).await?;

        let mut added = 0u64;
        if !add_slugs.is_empty() {
            let added_slugs = self
                .store_call(self.store.add_user_segments(user_id, add_slugs))
                .await?;
            added = added_slugs.len() as u64;

            for slug in &added_slugs {
                self.record_history(user_id, slug, MembershipOp::Added)
                    .await
                    .map_err(|e| partial(added, &format!("history append for {slug}"), e))?;
            }

            if ttl_seconds > 0 {
                let ttl = Duration::from_secs(ttl_seconds as u64);
                for slug in add_slugs {
                    self.scheduler
                        .schedule(user_id, slug, ttl)
                        .map_err(|e| partial(added, &format!("expiration persist for {slug}"), e))?;
                }
            }
        }

        let mut removed = 0u64;
        if !delete_slugs.is_empty() {
            let removed_slugs = self
                .store_call(self.store.remove_user_segments(user_id, delete_slugs))
                .await
                .map_err(|e| partial(added, "segment removal", e))?;
            removed = removed_slugs.len() as u64;

            for slug in &removed_slugs {
                self.record_history(user_id, slug, MembershipOp::Removed)
                    .await
                    .map_err(|e| partial(added, &format!("history append for {slug}"), e))?;
                // A cancel failure is not fatal: the orphaned entry fires
                // into an idempotent no-op removal later.
                if let Err(e) = self.scheduler.cancel(user_id, slug) {
                    warn!(error = %e, user_id, slug, "Failed to cancel pending expiration");
                }
            }
        }

        info!(user_id, added, removed, "User segments updated");
        Ok(UpdateSummary {
            user_id,
            added,
            removed,
        })
    }

    async fn ensure_user(&self, user_id: i64) -> CohortResult<i64> {
        if self.store_call(self.store.user_exists(user_id)).await? {
            return Ok(user_id);
        }
        let user = self.store_call(self.store.create_user()).await?;
        info!(requested = user_id, assigned = user.id, "Unknown user created lazily");
        Ok(user.id)
    }

    /// Export the user's membership history for one calendar month as CSV.
    pub async fn user_history_report(
        &self,
        user_id: i64,
        month: u32,
        year: i32,
    ) -> CohortResult<Report> {
        validate_user_id(user_id)?;
        if !(1..=12).contains(&month) {
            return Err(CohortError::Invalid(format!(
                "month must be within 1..=12, got {month}"
            )));
        }
        if !(1970..=9999).contains(&year) {
            return Err(CohortError::Invalid(format!("implausible year {year}")));
        }

        let from = Utc
            .with_ymd_and_hms(year, month, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| CohortError::Invalid(format!("bad month {year}-{month}")))?;
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let to = Utc
            .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| CohortError::Invalid(format!("bad month {year}-{month}")))?;

        let records = self
            .store_call(self.store.list_history(user_id, from, to))
            .await?;

        let report = self.reports.write(user_id, &records)?;
        info!(user_id, month, year, file = %report.file_name, "History report generated");
        Ok(report)
    }

    /// Resolve a previously generated report file for download.
    pub fn report_path(&self, file_name: &str) -> CohortResult<std::path::PathBuf> {
        self.reports.resolve(file_name)
    }
}

/// Removal path for fired expirations: remove-if-present straight against
/// the store, skipping request validation — user and slug were validated
/// when the expiration was enqueued.
#[async_trait]
impl ExpireHandler for SegmentService {
    async fn on_expire(&self, user_id: i64, segment_slug: &str) -> CohortResult<()> {
        let key = (user_id, segment_slug.to_string());

        if self.owed_history.remove(&key).is_none() {
            let removed = self
                .store
                .remove_user_segments(user_id, &[segment_slug.to_string()])
                .await?;
            if removed.is_empty() {
                // Link already gone (manual removal or segment delete cascade).
                return Ok(());
            }
        }

        if let Err(e) = self
            .record_history(user_id, segment_slug, MembershipOp::Removed)
            .await
        {
            // The removal is committed; flag the owed row so the refire
            // skips the remove and retries only the append.
            self.owed_history.insert(key, ());
            return Err(e);
        }

        info!(user_id, segment_slug, "Segment assignment expired");
        Ok(())
    }
}

fn validate_slug(slug: &str) -> CohortResult<()> {
    if slug.trim().is_empty() {
        return Err(CohortError::Invalid("slug must not be empty".into()));
    }
    if slug.len() > 255 {
        return Err(CohortError::Invalid("slug exceeds 255 characters".into()));
    }
    Ok(())
}

fn validate_user_id(user_id: i64) -> CohortResult<()> {
    if user_id <= 0 {
        return Err(CohortError::Invalid(format!(
            "user id must be positive, got {user_id}"
        )));
    }
    Ok(())
}

fn partial(added: u64, step: &str, e: CohortError) -> CohortError {
    CohortError::PartialUpdate {
        added,
        reason: format!("{step} failed: {e}"),
    }
}
