//! Execution Coordinator
//!
//! Runs one fired post: claims it in the store, loads it, publishes to every
//! target platform concurrently, folds the per-platform outcomes into a
//! single `posted` or `failed` status and writes that status back with the
//! claim token.
//!
//! The claim is pinned to the fire time of the entry that fired. A post that
//! was rescheduled after its entry was queued is left alone, and once the
//! claim is taken no cancel or reschedule can slip in before the result is
//! recorded.
//!
//! Aggregation is all-or-nothing. One failing platform marks the whole post
//! `failed`, even when the others succeeded; the per-platform detail survives
//! in the [`ExecutionReport`] emitted on the event bus.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::engine::FireHandler;
use crate::error::{PlatformError, Result, SchedcastError};
use crate::events::{Event, EventBus};
use crate::platforms::PublisherRegistry;
use crate::store::{Claim, PostStore, Transition};
use crate::types::{ExecutionReport, PlatformOutcome, Post, PostStatus, RunOutcome};

/// Fold per-platform outcomes into the post's terminal status
///
/// `Posted` only if there is at least one outcome and every outcome
/// succeeded.
pub fn aggregate(outcomes: &[PlatformOutcome]) -> PostStatus {
    if !outcomes.is_empty() && outcomes.iter().all(|o| o.success) {
        PostStatus::Posted
    } else {
        PostStatus::Failed
    }
}

pub struct ExecutionCoordinator {
    store: Arc<dyn PostStore>,
    publishers: Arc<PublisherRegistry>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn PostStore>,
        publishers: Arc<PublisherRegistry>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            publishers,
            clock,
            events,
        }
    }

    pub fn publishers(&self) -> &PublisherRegistry {
        &self.publishers
    }

    /// Execute a post at whatever time it is currently scheduled for
    ///
    /// # Errors
    ///
    /// Only a failed store write is surfaced, as
    /// [`SchedcastError::StoreWrite`]. A missing post, a post that already
    /// left `Pending` and publish failures are all reported through the
    /// returned [`ExecutionReport`].
    pub async fn execute(&self, post_id: &str) -> Result<ExecutionReport> {
        self.run(post_id, None).await
    }

    /// Execute the schedule entry for `post_id` that fired at `fire_at`
    ///
    /// Nothing is published if the post has since moved to another time.
    pub async fn execute_fired(
        &self,
        post_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<ExecutionReport> {
        self.run(post_id, Some(fire_at)).await
    }

    async fn run(&self, post_id: &str, fire_at: Option<DateTime<Utc>>) -> Result<ExecutionReport> {
        let claim = self
            .store
            .claim(post_id, fire_at, self.clock.now())
            .await
            .map_err(|e| store_write_failed(post_id, e))?;

        let token = match claim {
            Claim::Acquired(token) => token,
            Claim::NotFound => {
                warn!(post_id, "Fired post no longer exists; dropping");
                return Ok(self.complete(ExecutionReport::new(post_id, RunOutcome::Vanished)));
            }
            Claim::NotPending(status) => {
                info!(post_id, %status, "Fired post is no longer pending; skipping");
                return Ok(self.complete(ExecutionReport::new(post_id, RunOutcome::Skipped(status))));
            }
            Claim::Moved(scheduled_at) => {
                info!(post_id, scheduled_at = %scheduled_at, "Post was rescheduled; skipping stale entry");
                return Ok(self.complete(ExecutionReport::new(post_id, RunOutcome::Rescheduled)));
            }
            Claim::Held => {
                warn!(post_id, "Another run holds this post; skipping");
                return Ok(self.complete(ExecutionReport::new(post_id, RunOutcome::AlreadyClaimed)));
            }
        };

        let post = match self.store.get(post_id).await {
            Ok(Some(post)) => post,
            Ok(None) => {
                warn!(post_id, "Claimed post was deleted; dropping");
                return Ok(self.complete(ExecutionReport::new(post_id, RunOutcome::Vanished)));
            }
            Err(e) => {
                error!(post_id, error = %e, "Failed to load fired post; marking failed");
                let transition = self.finish(post_id, &token, PostStatus::Failed).await?;
                let report = ExecutionReport::new(post_id, run_outcome(PostStatus::Failed, transition));
                return Ok(self.complete(report));
            }
        };

        let outcomes = self.publish_all(&post).await;
        let status = aggregate(&outcomes);

        let transition = self.finish(post_id, &token, status).await?;
        let mut report = ExecutionReport::new(post_id, run_outcome(status, transition));
        report.platforms = outcomes;

        match report.outcome {
            RunOutcome::Finished(status) => {
                info!(post_id, %status, platforms = report.platforms.len(), "Post run finished")
            }
            RunOutcome::Superseded(current) => warn!(
                post_id,
                %current,
                "Post left pending during publish; result not recorded"
            ),
            _ => {}
        }

        Ok(self.complete(report))
    }

    /// Publish to every target platform, each on its own task
    async fn publish_all(&self, post: &Post) -> Vec<PlatformOutcome> {
        let tasks = post.platforms.iter().map(|platform| {
            let platform = platform.clone();
            let publisher = self.publishers.get(&platform);
            let content = post.content.clone();
            let media_url = post.media_url.clone();
            let post_id = post.id.clone();

            async move {
                let Some(publisher) = publisher else {
                    let err = PlatformError::Unsupported(platform.clone());
                    warn!(post_id = %post_id, platform = %platform, "No publisher registered");
                    return PlatformOutcome::failure(platform, &err);
                };

                let handle = tokio::spawn(async move {
                    publisher.publish(&content, media_url.as_deref()).await
                });

                let outcome = match handle.await {
                    Ok(Ok(remote_id)) => PlatformOutcome::success(platform.clone(), remote_id),
                    Ok(Err(e)) => PlatformOutcome::failure(platform.clone(), &as_platform_error(e)),
                    Err(join_error) => PlatformOutcome::failure(
                        platform.clone(),
                        &PlatformError::Posting(format!("publisher task aborted: {}", join_error)),
                    ),
                };

                match (&outcome.remote_id, &outcome.error) {
                    (Some(remote_id), _) => {
                        info!(post_id = %post_id, platform = %platform, remote_id = %remote_id, "Published")
                    }
                    (_, error) => warn!(
                        post_id = %post_id,
                        platform = %platform,
                        error = error.as_deref().unwrap_or("unknown"),
                        "Publish failed"
                    ),
                }

                outcome
            }
        });

        join_all(tasks).await
    }

    async fn finish(&self, post_id: &str, claim: &str, status: PostStatus) -> Result<Transition> {
        self.store
            .finish(post_id, claim, status, self.clock.now())
            .await
            .map_err(|e| store_write_failed(post_id, e))
    }

    fn complete(&self, report: ExecutionReport) -> ExecutionReport {
        self.events.emit(Event::Completed {
            report: report.clone(),
        });
        report
    }
}

#[async_trait]
impl FireHandler for ExecutionCoordinator {
    async fn on_fire(&self, post_id: &str, fire_at: DateTime<Utc>, generation: u64) -> Result<()> {
        tracing::debug!(post_id, generation, "Executing fired post");
        self.execute_fired(post_id, fire_at).await.map(|_| ())
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("publishers", &self.publishers)
            .finish()
    }
}

fn run_outcome(status: PostStatus, transition: Transition) -> RunOutcome {
    match transition {
        Transition::Applied => RunOutcome::Finished(status),
        Transition::NotPending(current) => RunOutcome::Superseded(current),
        Transition::InFlight => RunOutcome::AlreadyClaimed,
        Transition::NotFound => RunOutcome::Vanished,
    }
}

fn store_write_failed(post_id: &str, error: SchedcastError) -> SchedcastError {
    error!(post_id, error = %error, "Failed to write post state");
    SchedcastError::StoreWrite {
        post_id: post_id.to_string(),
        reason: error.to_string(),
    }
}

fn as_platform_error(error: SchedcastError) -> PlatformError {
    match error {
        SchedcastError::Platform(e) => e,
        other => PlatformError::Posting(other.to_string()),
    }
}
