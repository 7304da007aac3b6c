//! Caller-facing scheduling operations
//!
//! [`PostScheduler`] owns one [`DispatchEngine`] wired to an
//! [`ExecutionCoordinator`] and keeps the engine's job table in step with the
//! post store. The store remains the source of truth: every operation that
//! changes a post goes through its compare-and-set, and the engine entry is
//! rolled back when the store refuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::coordinator::ExecutionCoordinator;
use crate::engine::{CancelOutcome, DispatchEngine, EngineConfig, ScheduleOutcome, ScheduledJob};
use crate::error::{Result, SchedcastError};
use crate::events::{EventBus, EventReceiver};
use crate::platforms::PublisherRegistry;
use crate::scheduling::parse_schedule;
use crate::store::{PostStore, Transition};
use crate::types::{to_millis, Post, PostStatus};

/// What a reconcile pass changed in the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    /// Pending posts whose entry was missing or had a stale fire time
    pub scheduled: usize,
    /// Entries dropped because their post is no longer pending
    pub cancelled: usize,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.scheduled == 0 && self.cancelled == 0
    }
}

pub struct PostScheduler {
    store: Arc<dyn PostStore>,
    engine: DispatchEngine,
    coordinator: Arc<ExecutionCoordinator>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl PostScheduler {
    pub fn new(
        store: Arc<dyn PostStore>,
        publishers: PublisherRegistry,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let events = EventBus::default();
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&store),
            Arc::new(publishers),
            Arc::clone(&clock),
            events.clone(),
        ));
        let engine = DispatchEngine::new(
            coordinator.clone(),
            Arc::clone(&clock),
            events.clone(),
            config,
        );

        Self {
            store,
            engine,
            coordinator,
            clock,
            events,
        }
    }

    /// Start the engine's fire loop
    pub fn start(&self) {
        self.engine.start();
    }

    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn PostStore> {
        &self.store
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Persist a new post and schedule it at its `scheduled_at`
    pub async fn create_post(&self, post: Post) -> Result<String> {
        let post_id = self.store.create(&post).await?;
        self.engine.schedule(&post_id, to_millis(post.scheduled_at));
        Ok(post_id)
    }

    /// Schedule or reschedule a pending post
    ///
    /// Returns `TooLate` if the post has already fired or reached a terminal
    /// status.
    ///
    /// # Errors
    ///
    /// `NotFound` if the post does not exist; store errors are propagated
    /// after the engine entry is put back the way it was.
    pub async fn schedule_post(
        &self,
        post_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<ScheduleOutcome> {
        let fire_at = to_millis(fire_at);
        let post = self
            .store
            .get(post_id)
            .await?
            .ok_or_else(|| SchedcastError::NotFound(post_id.to_string()))?;

        if post.status.is_terminal() || post.is_claimed() {
            info!(post_id, status = %post.status, "Reschedule rejected: post already fired");
            return Ok(ScheduleOutcome::TooLate);
        }

        let previous = self.engine.fire_time(post_id);
        let outcome = self.engine.schedule(post_id, fire_at);
        if outcome == ScheduleOutcome::TooLate {
            return Ok(outcome);
        }

        let transition = match self.store.reschedule(post_id, fire_at).await {
            Ok(transition) => transition,
            Err(e) => {
                self.restore_entry(post_id, previous);
                return Err(e);
            }
        };

        match transition {
            Transition::Applied => Ok(outcome),
            Transition::NotPending(status) => {
                self.engine.cancel(post_id);
                info!(post_id, %status, "Reschedule lost race with a status change");
                Ok(ScheduleOutcome::TooLate)
            }
            Transition::InFlight => {
                self.engine.cancel(post_id);
                info!(post_id, "Reschedule lost race with a run claiming the post");
                Ok(ScheduleOutcome::TooLate)
            }
            Transition::NotFound => {
                self.engine.cancel(post_id);
                Err(SchedcastError::NotFound(post_id.to_string()))
            }
        }
    }

    /// Reschedule a pending post to a time expression such as `"2h"`,
    /// `"tomorrow"` or an RFC 3339 timestamp, read relative to the
    /// scheduler's clock
    pub async fn reschedule_post(&self, post_id: &str, when: &str) -> Result<ScheduleOutcome> {
        let fire_at = parse_schedule(when, self.clock.now())?;
        self.schedule_post(post_id, fire_at).await
    }

    /// Cancel a pending post
    ///
    /// `TooLate` means an execution already claimed the post (or it is
    /// already terminal); that run will write the final status.
    pub async fn cancel_post(&self, post_id: &str) -> Result<CancelOutcome> {
        let previous = self.engine.fire_time(post_id);
        if self.engine.cancel(post_id) == CancelOutcome::TooLate {
            return Ok(CancelOutcome::TooLate);
        }

        let transition = match self.store.cancel(post_id).await {
            Ok(transition) => transition,
            Err(e) => {
                self.restore_entry(post_id, previous);
                return Err(e);
            }
        };

        match transition {
            Transition::Applied => Ok(CancelOutcome::Cancelled),
            Transition::NotPending(status) => {
                debug!(post_id, %status, "Cancel: post already terminal");
                Ok(CancelOutcome::TooLate)
            }
            Transition::InFlight => {
                info!(post_id, "Cancel too late: another run holds the post");
                Ok(CancelOutcome::TooLate)
            }
            Transition::NotFound => {
                warn!(post_id, "Cancel requested for unknown post");
                Ok(CancelOutcome::NotScheduled)
            }
        }
    }

    /// Put the engine entry back after the store refused a change
    fn restore_entry(&self, post_id: &str, previous: Option<DateTime<Utc>>) {
        match previous {
            Some(fire_at) => {
                self.engine.schedule(post_id, fire_at);
            }
            None => {
                self.engine.cancel(post_id);
            }
        }
    }

    /// Current schedule entries ordered by fire time
    pub fn scheduled(&self) -> Vec<ScheduledJob> {
        self.engine.entries()
    }

    /// Register every pending post from the store with the engine
    ///
    /// Posts whose fire time has already passed fire on the next tick. A
    /// pending post still claimed by a run this scheduler is not running was
    /// interrupted mid-publish; it is marked `Failed` rather than published a
    /// second time.
    pub async fn restore_pending(&self) -> Result<usize> {
        let pending = self.store.list(Some(PostStatus::Pending)).await?;
        let mut restored = 0;
        let mut abandoned = 0;

        for post in &pending {
            if post.is_claimed() {
                if !self.engine.is_in_flight(&post.id)
                    && self.store.abandon(&post.id, self.clock.now()).await?
                {
                    warn!(post_id = %post.id, "Interrupted run left the post claimed; marked failed");
                    abandoned += 1;
                }
                continue;
            }
            if self.engine.schedule(&post.id, post.scheduled_at).is_accepted() {
                restored += 1;
            }
        }

        info!(restored, abandoned, "Restored pending posts");
        Ok(restored)
    }

    /// Bring the engine in line with the store
    ///
    /// Pending posts whose entry is missing or carries a different fire time
    /// are (re)scheduled; entries whose post has left `Pending` or vanished
    /// are cancelled. Posts with an execution in flight, here or in another
    /// process, are left alone.
    ///
    /// This also registers posts that were already pending when the
    /// scheduler started, so skipping [`PostScheduler::restore_pending`] only
    /// defers them to the first reconcile pass.
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let pending = self.store.list(Some(PostStatus::Pending)).await?;
        let mut summary = ReconcileSummary::default();

        for post in &pending {
            if post.is_claimed() || self.engine.is_in_flight(&post.id) {
                continue;
            }
            if self.engine.fire_time(&post.id) != Some(post.scheduled_at)
                && self.engine.schedule(&post.id, post.scheduled_at).is_accepted()
            {
                summary.scheduled += 1;
            }
        }

        let pending_ids: HashSet<&str> = pending.iter().map(|p| p.id.as_str()).collect();
        for job in self.engine.entries() {
            if !pending_ids.contains(job.post_id.as_str())
                && self.engine.cancel(&job.post_id) == CancelOutcome::Cancelled
            {
                summary.cancelled += 1;
            }
        }

        if summary.is_empty() {
            debug!("Reconcile: engine already in step with store");
        } else {
            info!(
                scheduled = summary.scheduled,
                cancelled = summary.cancelled,
                "Reconciled engine with store"
            );
        }
        Ok(summary)
    }

    /// Stop firing and wait for in-flight runs to finish
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

impl std::fmt::Debug for PostScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostScheduler")
            .field("engine", &self.engine)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::platforms::mock::MockPublisher;
    use crate::store::MemoryPostStore;
    use chrono::{DateTime, Duration, Utc};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn scheduler_with(mock: &MockPublisher) -> (Arc<MemoryPostStore>, PostScheduler) {
        let store = Arc::new(MemoryPostStore::new());
        let mut registry = PublisherRegistry::new();
        registry.register(mock.clone());
        let scheduler = PostScheduler::new(
            store.clone(),
            registry,
            Arc::new(ManualClock::new(t0())),
            EngineConfig::default(),
        );
        (store, scheduler)
    }

    fn post_at(at: DateTime<Utc>) -> Post {
        Post::new("content".to_string(), ["twitter"], at).unwrap()
    }

    #[tokio::test]
    async fn test_create_post_registers_entry() {
        let mock = MockPublisher::success("twitter");
        let (_store, scheduler) = scheduler_with(&mock);

        let id = scheduler
            .create_post(post_at(t0() + Duration::minutes(5)))
            .await
            .unwrap();

        let jobs = scheduler.scheduled();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].post_id, id);
        assert_eq!(jobs[0].fire_at, t0() + Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_schedule_post_updates_store_and_engine() {
        let mock = MockPublisher::success("twitter");
        let (store, scheduler) = scheduler_with(&mock);
        let id = scheduler.create_post(post_at(t0())).await.unwrap();

        let later = t0() + Duration::hours(2);
        assert_eq!(
            scheduler.schedule_post(&id, later).await.unwrap(),
            ScheduleOutcome::Replaced
        );
        assert_eq!(store.get(&id).await.unwrap().unwrap().scheduled_at, later);
        assert_eq!(scheduler.engine().fire_time(&id), Some(later));
    }

    #[tokio::test]
    async fn test_reschedule_post_reads_time_from_clock() {
        let mock = MockPublisher::success("twitter");
        let (store, scheduler) = scheduler_with(&mock);
        let id = scheduler.create_post(post_at(t0())).await.unwrap();

        assert_eq!(
            scheduler.reschedule_post(&id, "90m").await.unwrap(),
            ScheduleOutcome::Replaced
        );
        let expected = t0() + Duration::minutes(90);
        assert_eq!(store.get(&id).await.unwrap().unwrap().scheduled_at, expected);
        assert_eq!(scheduler.engine().fire_time(&id), Some(expected));

        let err = scheduler.reschedule_post(&id, "whenever").await.unwrap_err();
        assert!(matches!(err, SchedcastError::InvalidInput(_)));
        assert_eq!(scheduler.engine().fire_time(&id), Some(expected));
    }

    /// Memory store whose reschedule and cancel writes always fail
    #[derive(Default)]
    struct FailingWrites {
        inner: MemoryPostStore,
    }

    #[async_trait::async_trait]
    impl PostStore for FailingWrites {
        async fn create(&self, post: &Post) -> Result<String> {
            self.inner.create(post).await
        }
        async fn get(&self, post_id: &str) -> Result<Option<Post>> {
            self.inner.get(post_id).await
        }
        async fn list(&self, status: Option<PostStatus>) -> Result<Vec<Post>> {
            self.inner.list(status).await
        }
        async fn reschedule(&self, _post_id: &str, _at: DateTime<Utc>) -> Result<Transition> {
            Err(SchedcastError::InvalidInput("disk full".to_string()))
        }
        async fn cancel(&self, _post_id: &str) -> Result<Transition> {
            Err(SchedcastError::InvalidInput("disk full".to_string()))
        }
        async fn claim(
            &self,
            post_id: &str,
            fire_at: Option<DateTime<Utc>>,
            claimed_at: DateTime<Utc>,
        ) -> Result<crate::store::Claim> {
            self.inner.claim(post_id, fire_at, claimed_at).await
        }
        async fn finish(
            &self,
            post_id: &str,
            claim: &str,
            status: PostStatus,
            posted_at: DateTime<Utc>,
        ) -> Result<Transition> {
            self.inner.finish(post_id, claim, status, posted_at).await
        }
        async fn abandon(&self, post_id: &str, failed_at: DateTime<Utc>) -> Result<bool> {
            self.inner.abandon(post_id, failed_at).await
        }
        async fn delete(&self, post_id: &str) -> Result<bool> {
            self.inner.delete(post_id).await
        }
    }

    #[tokio::test]
    async fn test_failed_store_write_keeps_previous_entry() {
        let store = Arc::new(FailingWrites::default());
        let scheduler = PostScheduler::new(
            store.clone(),
            PublisherRegistry::new(),
            Arc::new(ManualClock::new(t0())),
            EngineConfig::default(),
        );
        let original = t0() + Duration::minutes(5);
        let id = scheduler.create_post(post_at(original)).await.unwrap();

        assert!(scheduler
            .schedule_post(&id, t0() + Duration::hours(1))
            .await
            .is_err());
        assert_eq!(scheduler.engine().fire_time(&id), Some(original));

        assert!(scheduler.cancel_post(&id).await.is_err());
        assert_eq!(scheduler.engine().fire_time(&id), Some(original));
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().status,
            PostStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_schedule_post_truncates_to_millis() {
        let mock = MockPublisher::success("twitter");
        let (store, scheduler) = scheduler_with(&mock);
        let id = scheduler.create_post(post_at(t0())).await.unwrap();

        let at = DateTime::from_timestamp(1_700_000_100, 987_654_321).unwrap();
        scheduler.schedule_post(&id, at).await.unwrap();

        let stored = store.get(&id).await.unwrap().unwrap().scheduled_at;
        assert_eq!(stored.timestamp_subsec_nanos(), 987_000_000);
        assert_eq!(scheduler.engine().fire_time(&id), Some(stored));
        assert!(scheduler.reconcile().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_fails_interrupted_claims() {
        let mock = MockPublisher::success("twitter");
        let (store, scheduler) = scheduler_with(&mock);

        let interrupted = post_at(t0());
        let waiting = post_at(t0() + Duration::minutes(1));
        store.create(&interrupted).await.unwrap();
        store.create(&waiting).await.unwrap();
        // A previous process claimed it and died before recording a result
        store.claim(&interrupted.id, None, t0()).await.unwrap();

        assert_eq!(scheduler.restore_pending().await.unwrap(), 1);
        assert!(!scheduler.engine().is_scheduled(&interrupted.id));
        assert_eq!(
            store.get(&interrupted.id).await.unwrap().unwrap().status,
            PostStatus::Failed
        );
        assert_eq!(mock.publish_call_count(), 0);
    }

    #[tokio::test]
    async fn test_schedule_post_unknown_is_not_found() {
        let mock = MockPublisher::success("twitter");
        let (_store, scheduler) = scheduler_with(&mock);

        let err = scheduler.schedule_post("missing", t0()).await.unwrap_err();
        assert!(matches!(err, SchedcastError::NotFound(_)));
        assert!(scheduler.scheduled().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_post_before_fire() {
        let mock = MockPublisher::success("twitter");
        let (store, scheduler) = scheduler_with(&mock);
        let id = scheduler
            .create_post(post_at(t0() + Duration::minutes(1)))
            .await
            .unwrap();

        assert_eq!(
            scheduler.cancel_post(&id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(scheduler.engine().fire_due(t0() + Duration::hours(1)), 0);
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().status,
            PostStatus::Cancelled
        );
        assert_eq!(mock.publish_call_count(), 0);

        // Terminal: neither cancel nor reschedule moves it again
        assert_eq!(
            scheduler.cancel_post(&id).await.unwrap(),
            CancelOutcome::TooLate
        );
        assert_eq!(
            scheduler.schedule_post(&id, t0()).await.unwrap(),
            ScheduleOutcome::TooLate
        );
        assert!(!scheduler.engine().is_scheduled(&id));
    }

    #[tokio::test]
    async fn test_cancel_unknown_post() {
        let mock = MockPublisher::success("twitter");
        let (_store, scheduler) = scheduler_with(&mock);

        assert_eq!(
            scheduler.cancel_post("missing").await.unwrap(),
            CancelOutcome::NotScheduled
        );
    }

    #[tokio::test]
    async fn test_restore_pending_skips_terminal_posts() {
        let mock = MockPublisher::success("twitter");
        let (store, scheduler) = scheduler_with(&mock);

        let pending = post_at(t0());
        let cancelled = post_at(t0());
        store.create(&pending).await.unwrap();
        store.create(&cancelled).await.unwrap();
        store.cancel(&cancelled.id).await.unwrap();

        assert_eq!(scheduler.restore_pending().await.unwrap(), 1);
        assert!(scheduler.engine().is_scheduled(&pending.id));
        assert!(!scheduler.engine().is_scheduled(&cancelled.id));
    }

    #[tokio::test]
    async fn test_reconcile_follows_out_of_band_changes() {
        let mock = MockPublisher::success("twitter");
        let (store, scheduler) = scheduler_with(&mock);

        let moved = scheduler.create_post(post_at(t0())).await.unwrap();
        let dropped = scheduler.create_post(post_at(t0())).await.unwrap();
        let unchanged = scheduler.create_post(post_at(t0())).await.unwrap();
        let added = post_at(t0() + Duration::minutes(3));
        store.create(&added).await.unwrap();

        // Changes made directly against the store, as another process would
        store.reschedule(&moved, t0() + Duration::hours(1)).await.unwrap();
        store.cancel(&dropped).await.unwrap();

        let summary = scheduler.reconcile().await.unwrap();
        assert_eq!(
            summary,
            ReconcileSummary {
                scheduled: 2,
                cancelled: 1
            }
        );
        assert_eq!(
            scheduler.engine().fire_time(&moved),
            Some(t0() + Duration::hours(1))
        );
        assert!(!scheduler.engine().is_scheduled(&dropped));
        assert!(scheduler.engine().is_scheduled(&unchanged));
        assert!(scheduler.engine().is_scheduled(&added.id));

        assert!(scheduler.reconcile().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fired_post_is_posted() {
        let mock = MockPublisher::success("twitter");
        let (store, scheduler) = scheduler_with(&mock);
        let id = scheduler.create_post(post_at(t0())).await.unwrap();

        assert_eq!(scheduler.engine().fire_due(t0()), 1);
        scheduler.engine().wait_idle().await;

        let post = store.get(&id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Posted);
        assert_eq!(mock.publish_call_count(), 1);
        assert!(scheduler.scheduled().is_empty());
    }
}
