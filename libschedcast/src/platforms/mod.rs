//! Publisher capability and registry
//!
//! Every destination platform implements the single [`Publisher`] trait.
//! Implementations are registered by name in a [`PublisherRegistry`] at
//! construction time; the execution coordinator looks them up per target
//! platform and never branches on platform names itself.
//!
//! # Examples
//!
//! ```
//! use libschedcast::platforms::{dry_run::DryRunPublisher, PublisherRegistry};
//!
//! let mut registry = PublisherRegistry::new();
//! registry.register(DryRunPublisher::new("twitter"));
//! registry.register(DryRunPublisher::new("facebook"));
//!
//! assert!(registry.get("Twitter").is_some());
//! assert_eq!(registry.names(), vec!["facebook", "twitter"]);
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::types::normalize_platform;

pub mod dry_run;

// Mock publisher is available for all builds (not just tests) to support integration tests
pub mod mock;

/// Capability to publish content to one external platform
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Lowercase platform identifier (e.g., "twitter", "facebook")
    fn name(&self) -> &str;

    /// Publish content with an optional media reference
    ///
    /// Returns the platform-specific post ID on success.
    ///
    /// # Errors
    ///
    /// Returns a `PlatformError` describing why the platform refused or
    /// could not be reached. Callers treat any error as a failed outcome
    /// for this platform only.
    async fn publish(&self, content: &str, media_url: Option<&str>) -> Result<String>;
}

/// Name-keyed set of publishers
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    publishers: HashMap<String, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publisher under its own (normalized) name
    ///
    /// A publisher registered under an existing name replaces the old one.
    pub fn register<P: Publisher + 'static>(&mut self, publisher: P) -> &mut Self {
        self.register_arc(Arc::new(publisher))
    }

    pub fn register_arc(&mut self, publisher: Arc<dyn Publisher>) -> &mut Self {
        let name = normalize_platform(publisher.name());
        self.publishers.insert(name, publisher);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(&normalize_platform(platform)).cloned()
    }

    /// Registered platform names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.publishers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

impl std::fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherRegistry")
            .field("platforms", &self.names())
            .finish()
    }
}
