//! Schedcast - scheduled multi-platform post publishing
//!
//! The library holds the scheduling and dispatch core: a post store with a
//! guarded status state machine, a timer-driven [`DispatchEngine`] with
//! replace-existing and cancel-before-fire semantics, and an
//! [`ExecutionCoordinator`] that fans a post out to every target platform and
//! records the aggregated result.
//!
//! Most callers only need [`PostScheduler`], which wires the three together.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod platforms;
pub mod scheduler;
pub mod scheduling;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use coordinator::ExecutionCoordinator;
pub use db::Database;
pub use engine::{CancelOutcome, DispatchEngine, EngineConfig, ScheduleOutcome, ScheduledJob};
pub use error::{Result, SchedcastError};
pub use events::{Event, EventBus};
pub use platforms::{Publisher, PublisherRegistry};
pub use scheduler::{PostScheduler, ReconcileSummary};
pub use store::{Claim, MemoryPostStore, PostStore, Transition};
pub use types::{ExecutionReport, PlatformOutcome, Post, PostStatus, RunOutcome};
