//! Dispatch event bus
//!
//! The engine and the coordinator emit events as posts are scheduled,
//! cancelled, fired and completed. `Completed` carries the full
//! [`ExecutionReport`], which is the per-platform diagnostic record of a run.
//!
//! The bus uses `tokio::sync::broadcast`: if nobody is subscribed, events
//! are dropped without blocking, and lagging subscribers lose the oldest
//! events first.
//!
//! # Example
//!
//! ```
//! use libschedcast::events::{Event, EventBus};
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut receiver = bus.subscribe();
//!
//! bus.emit(Event::Cancelled { post_id: "abc123".to_string() });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::ExecutionReport;

/// Event receiver type alias
pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers (non-blocking)
    pub fn emit(&self, event: Event) {
        // Err only means there are no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A schedule entry was registered
    Scheduled {
        post_id: String,
        fire_at: DateTime<Utc>,
        /// True if an earlier entry for the same post was superseded
        replaced: bool,
    },

    /// A schedule entry was removed before it fired
    Cancelled { post_id: String },

    /// The engine claimed an entry and handed it to the coordinator
    Fired { post_id: String, generation: u64 },

    /// A coordinator run finished (whatever it decided)
    Completed { report: ExecutionReport },

    /// A run failed outside of normal publish failures (store error, panic)
    RunFailed { post_id: String, error: String },
}

impl Event {
    pub fn post_id(&self) -> &str {
        match self {
            Event::Scheduled { post_id, .. }
            | Event::Cancelled { post_id }
            | Event::Fired { post_id, .. }
            | Event::RunFailed { post_id, .. } => post_id,
            Event::Completed { report } => &report.post_id,
        }
    }
}
