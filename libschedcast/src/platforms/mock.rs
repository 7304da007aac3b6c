//! Mock publisher implementation for testing
//!
//! This module provides a configurable mock publisher that can simulate
//! successes, failures, delays and panics. Call counters are shared between
//! clones, so a test can keep one handle while the registry owns another.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::Publisher;

/// Configuration for mock publisher behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Platform name (e.g., "twitter")
    pub name: String,

    /// Whether publishing should succeed
    pub publish_succeeds: bool,

    /// Error to return on publishing failure
    pub publish_error: Option<String>,

    /// Panic inside `publish` instead of returning
    pub panics: bool,

    /// Delay before completing (simulates network latency)
    pub delay: Duration,

    /// Number of times publish has been called
    pub publish_call_count: Arc<Mutex<usize>>,

    /// Content and media that have been published (for verification)
    pub published: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            publish_succeeds: true,
            publish_error: None,
            panics: false,
            delay: Duration::from_millis(0),
            publish_call_count: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Mock publisher for testing
#[derive(Debug, Clone)]
pub struct MockPublisher {
    config: MockConfig,
}

impl MockPublisher {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// A publisher that always succeeds
    pub fn success(name: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// A publisher that always fails with `error`
    pub fn failure(name: &str, error: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            publish_succeeds: false,
            publish_error: Some(error.to_string()),
            ..Default::default()
        })
    }

    /// A publisher that succeeds after `delay`
    pub fn with_delay(name: &str, delay: Duration) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            delay,
            ..Default::default()
        })
    }

    /// A publisher whose `publish` panics
    pub fn panicking(name: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            panics: true,
            ..Default::default()
        })
    }

    pub fn publish_call_count(&self) -> usize {
        *self
            .config
            .publish_call_count
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn published(&self) -> Vec<(String, Option<String>)> {
        self.config
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn publish(&self, content: &str, media_url: Option<&str>) -> Result<String> {
        *self
            .config
            .publish_call_count
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if self.config.panics {
            panic!("mock publisher {} panicked", self.config.name);
        }

        if !self.config.publish_succeeds {
            let error_msg = self
                .config
                .publish_error
                .clone()
                .unwrap_or_else(|| "Mock publishing failed".to_string());
            return Err(PlatformError::Posting(error_msg).into());
        }

        self.config
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((content.to_string(), media_url.map(str::to_string)));

        Ok(format!("{}:mock-{}", self.config.name, uuid::Uuid::new_v4()))
    }
}
