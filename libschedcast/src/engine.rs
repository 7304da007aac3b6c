//! Dispatch Engine
//!
//! A timer-ordered job table keyed by post id. Each entry fires at most once,
//! at or after its fire time, by handing the post id to a [`FireHandler`]
//! (the execution coordinator) on its own task.
//!
//! # Bookkeeping
//!
//! All state lives behind one mutex that is only held for bookkeeping, never
//! across an `.await`:
//!
//! - `entries`: the live [`ScheduleEntry`] per post id. Each entry carries a
//!   generation number that acts as its cancellation handle.
//! - `timers`: a min-heap of `(fire_at, generation, post_id)`. Rescheduling or
//!   cancelling never searches the heap; a timer whose generation no longer
//!   matches the live entry is simply dead and is discarded when it surfaces.
//! - `in_flight`: ids whose execution has been claimed but not finished.
//!   While an id is in flight, `schedule` and `cancel` report
//!   [`ScheduleOutcome::TooLate`] / [`CancelOutcome::TooLate`], so a post is
//!   never executed twice concurrently and a running execution is never
//!   interrupted.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chrono::{Duration, Utc};
//! use libschedcast::clock::SystemClock;
//! use libschedcast::engine::{DispatchEngine, EngineConfig, FireHandler};
//! use libschedcast::events::EventBus;
//!
//! # async fn example(handler: Arc<dyn FireHandler>) {
//! let engine = DispatchEngine::new(
//!     handler,
//!     Arc::new(SystemClock),
//!     EventBus::default(),
//!     EngineConfig::default(),
//! );
//! engine.start();
//!
//! engine.schedule("post-1", Utc::now() + Duration::minutes(5));
//! engine.cancel("post-1");
//!
//! engine.shutdown().await;
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::events::{Event, EventBus};

/// Callback invoked when an entry fires
#[async_trait]
pub trait FireHandler: Send + Sync {
    /// Execute the post. `fire_at` and `generation` identify the schedule
    /// entry that fired.
    async fn on_fire(&self, post_id: &str, fire_at: DateTime<Utc>, generation: u64) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on how long the fire loop sleeps between checks
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOutcome {
    /// New entry registered
    Scheduled,
    /// An existing entry was superseded; its timer will not fire
    Replaced,
    /// An execution for this post is already in flight
    TooLate,
}

impl ScheduleOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, ScheduleOutcome::TooLate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Entry removed before firing; no execution will happen
    Cancelled,
    /// Nothing was scheduled for this post
    NotScheduled,
    /// Firing already claimed the entry; the execution runs to completion
    TooLate,
}

/// Public view of a schedule entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub post_id: String,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct ScheduleEntry {
    fire_at: DateTime<Utc>,
    generation: u64,
}

// Field order matters: the derived ordering sorts by fire time first
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Timer {
    fire_at: DateTime<Utc>,
    generation: u64,
    post_id: String,
}

#[derive(Debug, Default)]
struct EngineState {
    entries: HashMap<String, ScheduleEntry>,
    timers: BinaryHeap<Reverse<Timer>>,
    in_flight: HashSet<String>,
    next_generation: u64,
}

impl EngineState {
    fn is_live(&self, timer: &Timer) -> bool {
        self.entries
            .get(&timer.post_id)
            .is_some_and(|entry| entry.generation == timer.generation)
    }

    /// Pop every due timer, claiming the live ones in fire-time order
    fn claim_due(&mut self, now: DateTime<Utc>) -> Vec<Timer> {
        let mut claimed = Vec::new();
        loop {
            let due = matches!(self.timers.peek(), Some(Reverse(t)) if t.fire_at <= now);
            if !due {
                break;
            }
            let Some(Reverse(timer)) = self.timers.pop() else {
                break;
            };
            if !self.is_live(&timer) {
                continue;
            }
            self.entries.remove(&timer.post_id);
            self.in_flight.insert(timer.post_id.clone());
            claimed.push(timer);
        }
        claimed
    }

    /// Drop dead timers once they clearly outnumber live entries
    fn compact(&mut self) {
        if self.timers.len() <= self.entries.len() * 2 + 64 {
            return;
        }
        let timers = std::mem::take(&mut self.timers);
        self.timers = timers
            .into_iter()
            .filter(|Reverse(timer)| self.is_live(timer))
            .collect();
    }
}

struct Shared {
    state: Mutex<EngineState>,
    handler: Arc<dyn FireHandler>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    /// Pokes the fire loop when the earliest deadline may have changed
    wake: Notify,
    /// Signalled whenever the in-flight set drains to empty
    idle: Notify,
    stopping: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How long the loop may sleep before the next due timer
    fn next_delay(&self, now: DateTime<Utc>, ceiling: Duration) -> Duration {
        let next = self.state().timers.peek().map(|Reverse(t)| t.fire_at);
        match next {
            Some(fire_at) => (fire_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(ceiling),
            None => ceiling,
        }
    }
}

/// Clears the in-flight mark when an execution ends, including by panic
struct InFlightGuard {
    shared: Arc<Shared>,
    post_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let now_idle = {
            let mut state = self.shared.state();
            state.in_flight.remove(&self.post_id);
            state.in_flight.is_empty()
        };
        if now_idle {
            self.shared.idle.notify_waiters();
        }
    }
}

fn fire_due(shared: &Arc<Shared>, now: DateTime<Utc>) -> usize {
    let claimed = shared.state().claim_due(now);
    let count = claimed.len();

    for timer in claimed {
        info!(post_id = %timer.post_id, generation = timer.generation, "Firing scheduled post");
        shared.events.emit(Event::Fired {
            post_id: timer.post_id.clone(),
            generation: timer.generation,
        });
        spawn_execution(Arc::clone(shared), timer);
    }

    count
}

fn spawn_execution(shared: Arc<Shared>, timer: Timer) {
    let Timer {
        fire_at,
        generation,
        post_id,
    } = timer;

    tokio::spawn(async move {
        let _guard = InFlightGuard {
            shared: Arc::clone(&shared),
            post_id: post_id.clone(),
        };

        // Run the handler on its own task so a panic is contained and reported
        let handler = Arc::clone(&shared.handler);
        let id = post_id.clone();
        let run = tokio::spawn(async move { handler.on_fire(&id, fire_at, generation).await });

        let failure = match run.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(join_error) => Some(format!("execution task aborted: {}", join_error)),
        };

        match failure {
            None => debug!(post_id = %post_id, generation, "Execution finished"),
            Some(error) => {
                error!(post_id = %post_id, generation, error = %error, "Execution failed");
                shared.events.emit(Event::RunFailed { post_id, error });
            }
        }
    });
}

async fn run_fire_loop(shared: Arc<Shared>, poll_interval: Duration) {
    debug!(?poll_interval, "Fire loop started");

    loop {
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }

        let now = shared.clock.now();
        fire_due(&shared, now);

        let delay = shared.next_delay(now, poll_interval);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.wake.notified() => {}
        }
    }

    debug!("Fire loop stopped");
}

/// Timer-driven job table with replace-existing and cancel-before-fire
pub struct DispatchEngine {
    shared: Arc<Shared>,
    config: EngineConfig,
    fire_loop: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchEngine {
    pub fn new(
        handler: Arc<dyn FireHandler>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::default()),
                handler,
                clock,
                events,
                wake: Notify::new(),
                idle: Notify::new(),
                stopping: AtomicBool::new(false),
            }),
            config,
            fire_loop: Mutex::new(None),
        }
    }

    /// Spawn the fire loop on the current tokio runtime
    ///
    /// Calling `start` on a running engine is a no-op.
    pub fn start(&self) {
        let mut slot = self
            .fire_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            warn!("Dispatch engine already running");
            return;
        }

        self.shared.stopping.store(false, Ordering::Release);
        *slot = Some(tokio::spawn(run_fire_loop(
            Arc::clone(&self.shared),
            self.config.poll_interval,
        )));
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Dispatch engine started"
        );
    }

    pub fn is_running(&self) -> bool {
        self.fire_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Register or replace the entry for `post_id`
    pub fn schedule(&self, post_id: &str, fire_at: DateTime<Utc>) -> ScheduleOutcome {
        let outcome = {
            let mut state = self.shared.state();
            if state.in_flight.contains(post_id) {
                ScheduleOutcome::TooLate
            } else {
                state.next_generation += 1;
                let generation = state.next_generation;
                let replaced = state
                    .entries
                    .insert(post_id.to_string(), ScheduleEntry { fire_at, generation })
                    .is_some();
                state.timers.push(Reverse(Timer {
                    fire_at,
                    generation,
                    post_id: post_id.to_string(),
                }));
                state.compact();

                if replaced {
                    ScheduleOutcome::Replaced
                } else {
                    ScheduleOutcome::Scheduled
                }
            }
        };

        match outcome {
            ScheduleOutcome::TooLate => {
                warn!(post_id, "Schedule rejected: execution already in flight");
            }
            _ => {
                info!(post_id, fire_at = %fire_at, ?outcome, "Post scheduled");
                self.shared.events.emit(Event::Scheduled {
                    post_id: post_id.to_string(),
                    fire_at,
                    replaced: outcome == ScheduleOutcome::Replaced,
                });
                self.shared.wake.notify_one();
            }
        }

        outcome
    }

    /// Remove the entry for `post_id` if it has not fired yet
    pub fn cancel(&self, post_id: &str) -> CancelOutcome {
        let outcome = {
            let mut state = self.shared.state();
            if state.entries.remove(post_id).is_some() {
                CancelOutcome::Cancelled
            } else if state.in_flight.contains(post_id) {
                CancelOutcome::TooLate
            } else {
                CancelOutcome::NotScheduled
            }
        };

        match outcome {
            CancelOutcome::Cancelled => {
                info!(post_id, "Scheduled post cancelled");
                self.shared.events.emit(Event::Cancelled {
                    post_id: post_id.to_string(),
                });
            }
            CancelOutcome::TooLate => {
                info!(post_id, "Cancel too late: execution already in flight");
            }
            CancelOutcome::NotScheduled => debug!(post_id, "Cancel: nothing scheduled"),
        }

        outcome
    }

    /// Fire every entry due at `now`. Returns how many executions started.
    ///
    /// The fire loop calls this on each tick; tests call it directly with a
    /// controlled timestamp.
    pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
        fire_due(&self.shared, now)
    }

    /// Live entries ordered by fire time
    pub fn entries(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self
            .shared
            .state()
            .entries
            .iter()
            .map(|(post_id, entry)| ScheduledJob {
                post_id: post_id.clone(),
                fire_at: entry.fire_at,
            })
            .collect();
        jobs.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.post_id.cmp(&b.post_id)));
        jobs
    }

    pub fn fire_time(&self, post_id: &str) -> Option<DateTime<Utc>> {
        self.shared.state().entries.get(post_id).map(|e| e.fire_at)
    }

    pub fn is_scheduled(&self, post_id: &str) -> bool {
        self.shared.state().entries.contains_key(post_id)
    }

    pub fn is_in_flight(&self, post_id: &str) -> bool {
        self.shared.state().in_flight.contains(post_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.state().in_flight.len()
    }

    /// Earliest fire time among live entries
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.shared.state().entries.values().map(|e| e.fire_at).min()
    }

    /// Wait until no execution is in flight
    pub async fn wait_idle(&self) {
        loop {
            // Register interest before checking so a drain in between isn't missed
            let drained = self.shared.idle.notified();
            let idle = self.shared.state().in_flight.is_empty();
            if idle {
                return;
            }
            drained.await;
        }
    }

    /// Stop the fire loop and wait for in-flight executions to finish
    ///
    /// Pending entries are kept; a later `start` resumes firing them.
    pub async fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.wake.notify_one();

        let handle = self
            .fire_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Fire loop ended abnormally");
            }
        }

        self.wait_idle().await;
        info!("Dispatch engine shut down");
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("DispatchEngine")
            .field("entries", &state.entries.len())
            .field("in_flight", &state.in_flight.len())
            .field("config", &self.config)
            .finish()
    }
}
