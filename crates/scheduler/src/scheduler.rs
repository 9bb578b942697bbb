//! Timer worker delivering due expirations to the removal callback.
//!
//! The scheduler keeps an in-memory mirror of pending entries and scans it
//! on a fixed tick. The journal remains the source of truth: entries are
//! appended there before `schedule` returns and marked settled only after
//! the callback has succeeded, so a crash between the two results in a
//! duplicate fire rather than a lost one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cohort_core::config::SchedulerConfig;
use cohort_core::CohortResult;

use crate::{ExpirationEntry, ExpirationLog, ExpirationStatus};

/// Removal callback invoked when an expiration fires.
///
/// Implementations must be idempotent: a fire against a link that was
/// already removed has to succeed as a no-op. Errors trigger a retry with
/// backoff; the entry is never dropped.
#[async_trait]
pub trait ExpireHandler: Send + Sync {
    async fn on_expire(&self, user_id: i64, segment_slug: &str) -> CohortResult<()>;
}

/// Runtime knobs for the worker loop.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
        }
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(cfg.tick_interval_ms),
            retry_base: Duration::from_millis(cfg.retry_base_ms),
            retry_max: Duration::from_millis(cfg.retry_max_ms),
        }
    }
}

struct PendingExpiration {
    entry: ExpirationEntry,
    next_attempt_at: DateTime<Utc>,
    attempts: u32,
}

pub struct ExpirationScheduler {
    log: Arc<dyn ExpirationLog>,
    pending: DashMap<Uuid, PendingExpiration>,
    settings: SchedulerSettings,
}

impl ExpirationScheduler {
    /// Build a scheduler over an expiration log, reloading every entry the
    /// log still holds as pending. Entries whose `fire_at` already elapsed
    /// fire on the first tick (catch-up); the rest wait out their remaining
    /// delay.
    pub fn recover(log: Arc<dyn ExpirationLog>, settings: SchedulerSettings) -> CohortResult<Self> {
        let entries = log.load_pending()?;
        let recovered = entries.len();

        let pending = DashMap::new();
        for entry in entries {
            pending.insert(
                entry.id,
                PendingExpiration {
                    next_attempt_at: entry.fire_at,
                    attempts: 0,
                    entry,
                },
            );
        }

        if recovered > 0 {
            info!(recovered, "Recovered pending expirations from journal");
        }

        Ok(Self {
            log,
            pending,
            settings,
        })
    }

    /// Persist and arm one future removal. The journal write completes
    /// before this returns, so the caller may safely acknowledge the add.
    pub fn schedule(
        &self,
        user_id: i64,
        segment_slug: &str,
        ttl: Duration,
    ) -> CohortResult<ExpirationEntry> {
        // TTLs beyond ten years are clamped rather than rejected.
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650));
        let fire_at = Utc::now() + ttl.min(chrono::Duration::days(3650));
        let entry = ExpirationEntry::new(user_id, segment_slug, fire_at);

        self.log.append(&entry)?;
        self.pending.insert(
            entry.id,
            PendingExpiration {
                next_attempt_at: fire_at,
                attempts: 0,
                entry: entry.clone(),
            },
        );

        debug!(
            user_id,
            segment_slug,
            fire_at = %fire_at,
            "Expiration scheduled"
        );
        Ok(entry)
    }

    /// Cancel all pending expirations for a (user, segment) pair. Called on
    /// manual removal so a stale fire cannot delete a re-added link.
    pub fn cancel(&self, user_id: i64, segment_slug: &str) -> CohortResult<usize> {
        let ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|p| p.entry.user_id == user_id && p.entry.segment_slug == segment_slug)
            .map(|p| *p.key())
            .collect();

        for id in &ids {
            self.log.mark(*id, ExpirationStatus::Cancelled)?;
            self.pending.remove(id);
        }

        if !ids.is_empty() {
            debug!(user_id, segment_slug, cancelled = ids.len(), "Expirations cancelled");
        }
        Ok(ids.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Deliver every due entry once. Returns the number of entries settled
    /// as done. Exposed so tests can drive time deterministically; the
    /// background loop calls this on every tick.
    pub async fn tick_once(&self, handler: &dyn ExpireHandler) -> usize {
        let now = Utc::now();
        let due: Vec<(Uuid, i64, String)> = self
            .pending
            .iter()
            .filter(|p| p.next_attempt_at <= now)
            .map(|p| (*p.key(), p.entry.user_id, p.entry.segment_slug.clone()))
            .collect();

        let mut fired = 0;
        for (id, user_id, slug) in due {
            // The entry may have been cancelled since the scan.
            if !self.pending.contains_key(&id) {
                continue;
            }

            match handler.on_expire(user_id, &slug).await {
                Ok(()) => match self.log.mark(id, ExpirationStatus::Done) {
                    Ok(()) => {
                        self.pending.remove(&id);
                        fired += 1;
                        debug!(user_id, segment_slug = %slug, "Expiration fired");
                    }
                    Err(e) => {
                        // Callback succeeded but the journal write failed.
                        // Keep the entry pending: the next fire is a no-op
                        // thanks to the idempotent remove.
                        warn!(error = %e, user_id, segment_slug = %slug,
                            "Failed to settle expiration, will refire");
                        self.defer(id, now);
                    }
                },
                Err(e) => {
                    warn!(error = %e, user_id, segment_slug = %slug,
                        "Expiration callback failed, retrying with backoff");
                    self.defer(id, now);
                }
            }
        }
        fired
    }

    /// Push an entry's next attempt into the future with exponential backoff.
    fn defer(&self, id: Uuid, now: DateTime<Utc>) {
        if let Some(mut p) = self.pending.get_mut(&id) {
            p.attempts = p.attempts.saturating_add(1);
            let exp = p.attempts.min(16).saturating_sub(1);
            let delay_ms = (self.settings.retry_base.as_millis() as u64)
                .saturating_mul(1u64 << exp)
                .min(self.settings.retry_max.as_millis() as u64);
            p.next_attempt_at = now + chrono::Duration::milliseconds(delay_ms as i64);
        }
    }

    /// Spawn the background worker loop. Each enqueue is non-blocking from
    /// the request path's perspective; firing happens here.
    pub fn run(self: &Arc<Self>, handler: Arc<dyn ExpireHandler>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.settings.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                scheduler.tick_once(handler.as_ref()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{FileExpirationLog, MemoryExpirationLog};
    use cohort_core::CohortError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Test double recording every fire; optionally fails the first N calls.
    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<(i64, String)>>,
        fail_first: AtomicU32,
    }

    impl RecordingHandler {
        fn failing(times: u32) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(times),
            }
        }

        fn calls(&self) -> Vec<(i64, String)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ExpireHandler for RecordingHandler {
        async fn on_expire(&self, user_id: i64, segment_slug: &str) -> CohortResult<()> {
            self.calls.lock().push((user_id, segment_slug.to_string()));
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(CohortError::Store("injected failure".into()));
            }
            Ok(())
        }
    }

    fn fast_settings() -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: Duration::from_millis(10),
            retry_base: Duration::from_millis(20),
            retry_max: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn due_entry_fires_once() {
        let log = Arc::new(MemoryExpirationLog::new());
        let scheduler = ExpirationScheduler::recover(log.clone(), fast_settings()).unwrap();
        let handler = RecordingHandler::default();

        let entry = scheduler.schedule(42, "promo", Duration::ZERO).unwrap();
        assert_eq!(scheduler.tick_once(&handler).await, 1);
        assert_eq!(handler.calls(), vec![(42, "promo".to_string())]);
        assert_eq!(log.status_of(entry.id), Some(ExpirationStatus::Done));

        // Nothing left to deliver.
        assert_eq!(scheduler.tick_once(&handler).await, 0);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn future_entry_does_not_fire_early() {
        let log = Arc::new(MemoryExpirationLog::new());
        let scheduler = ExpirationScheduler::recover(log, fast_settings()).unwrap();
        let handler = RecordingHandler::default();

        scheduler.schedule(42, "promo", Duration::from_secs(3600)).unwrap();
        assert_eq!(scheduler.tick_once(&handler).await, 0);
        assert!(handler.calls().is_empty());
        assert_eq!(scheduler.pending_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_entry_never_fires() {
        let log = Arc::new(MemoryExpirationLog::new());
        let scheduler = ExpirationScheduler::recover(log.clone(), fast_settings()).unwrap();
        let handler = RecordingHandler::default();

        let entry = scheduler.schedule(42, "promo", Duration::ZERO).unwrap();
        assert_eq!(scheduler.cancel(42, "promo").unwrap(), 1);
        assert_eq!(log.status_of(entry.id), Some(ExpirationStatus::Cancelled));

        assert_eq!(scheduler.tick_once(&handler).await, 0);
        assert!(handler.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_callback_retries_with_backoff() {
        let log = Arc::new(MemoryExpirationLog::new());
        let scheduler = ExpirationScheduler::recover(log.clone(), fast_settings()).unwrap();
        let handler = RecordingHandler::failing(1);

        let entry = scheduler.schedule(42, "promo", Duration::ZERO).unwrap();

        // First delivery fails; entry stays pending.
        assert_eq!(scheduler.tick_once(&handler).await, 0);
        assert_eq!(scheduler.pending_count(), 1);
        assert_eq!(log.status_of(entry.id), Some(ExpirationStatus::Pending));

        // Immediately after, the entry is deferred by the backoff window.
        assert_eq!(scheduler.tick_once(&handler).await, 0);
        assert_eq!(handler.calls().len(), 1);

        // After the backoff elapses, delivery succeeds.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(scheduler.tick_once(&handler).await, 1);
        assert_eq!(handler.calls().len(), 2);
        assert_eq!(log.status_of(entry.id), Some(ExpirationStatus::Done));
    }

    #[tokio::test]
    async fn restart_recovers_and_fires_overdue_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expirations.journal");

        // First process: schedule and crash before firing.
        {
            let log = Arc::new(FileExpirationLog::open(&path).unwrap());
            let scheduler = ExpirationScheduler::recover(log, fast_settings()).unwrap();
            scheduler.schedule(42, "promo", Duration::ZERO).unwrap();
            scheduler.schedule(42, "later", Duration::from_secs(3600)).unwrap();
        }

        // Second process: overdue entry catches up on the first tick, the
        // future one stays armed.
        let log = Arc::new(FileExpirationLog::open(&path).unwrap());
        let scheduler = ExpirationScheduler::recover(log, fast_settings()).unwrap();
        assert_eq!(scheduler.pending_count(), 2);

        let handler = RecordingHandler::default();
        assert_eq!(scheduler.tick_once(&handler).await, 1);
        assert_eq!(handler.calls(), vec![(42, "promo".to_string())]);
        assert_eq!(scheduler.pending_count(), 1);
    }

    #[tokio::test]
    async fn background_loop_delivers_without_explicit_ticks() {
        let log = Arc::new(MemoryExpirationLog::new());
        let scheduler =
            Arc::new(ExpirationScheduler::recover(log.clone(), fast_settings()).unwrap());
        let handler = Arc::new(RecordingHandler::default());

        let entry = scheduler
            .schedule(7, "flash-sale", Duration::from_millis(30))
            .unwrap();
        let worker = scheduler.run(handler.clone());

        tokio::time::timeout(Duration::from_secs(2), async {
            while log.status_of(entry.id) != Some(ExpirationStatus::Done) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("expiration should fire via the background loop");

        worker.abort();
        assert_eq!(handler.calls(), vec![(7, "flash-sale".to_string())]);
    }
}
