//! Publisher that logs instead of calling an external API
//!
//! Concrete platform SDKs live outside this crate. The daemon registers one
//! `DryRunPublisher` per enabled platform so the whole scheduling pipeline
//! can run end to end without credentials.

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::platforms::Publisher;

#[derive(Debug, Clone)]
pub struct DryRunPublisher {
    name: String,
}

impl DryRunPublisher {
    pub fn new(name: &str) -> Self {
        Self {
            name: crate::types::normalize_platform(name),
        }
    }
}

#[async_trait]
impl Publisher for DryRunPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, content: &str, media_url: Option<&str>) -> Result<String> {
        let remote_id = format!("dry-run:{}", uuid::Uuid::new_v4());
        info!(
            platform = %self.name,
            remote_id = %remote_id,
            chars = content.chars().count(),
            media = media_url.unwrap_or("-"),
            "Dry-run publish"
        );
        Ok(remote_id)
    }
}
