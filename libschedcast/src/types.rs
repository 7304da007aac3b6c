//! Core types for Schedcast

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{PlatformError, Result, SchedcastError};

/// A unit of content scheduled for publication to one or more platforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub content: String,
    /// Normalized (trimmed, lowercase, deduplicated) platform names
    pub platforms: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
    pub media_url: Option<String>,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
    /// Set when the post reaches `Posted` or `Failed`
    pub posted_at: Option<DateTime<Utc>>,
    /// Set when a run claims the post for publishing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Post {
    /// Create a new pending post with a fresh UUID.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the content is blank, no platform name
    /// survives normalization, or a name contains a comma.
    pub fn new<I, S>(content: String, platforms: I, scheduled_at: DateTime<Utc>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if content.trim().is_empty() {
            return Err(SchedcastError::InvalidInput(
                "Content cannot be empty".to_string(),
            ));
        }

        let platforms = normalize_platforms(platforms);
        if platforms.is_empty() {
            return Err(SchedcastError::InvalidInput(
                "At least one target platform is required".to_string(),
            ));
        }
        // The platforms column is comma-separated
        if let Some(name) = platforms.iter().find(|name| name.contains(',')) {
            return Err(SchedcastError::InvalidInput(format!(
                "Platform name '{}' cannot contain ','",
                name
            )));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            content,
            platforms,
            scheduled_at: to_millis(scheduled_at),
            media_url: None,
            status: PostStatus::Pending,
            created_at: to_millis(Utc::now()),
            posted_at: None,
            claimed_at: None,
        })
    }

    /// Attach a media reference
    pub fn with_media(mut self, media_url: impl Into<String>) -> Self {
        self.media_url = Some(media_url.into());
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == PostStatus::Pending
    }

    /// Pending, but a run has already claimed it
    pub fn is_claimed(&self) -> bool {
        self.is_pending() && self.claimed_at.is_some()
    }
}

/// Drop sub-millisecond precision, matching what the store keeps
pub fn to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}

/// Normalize a platform name: trimmed and lowercase.
pub fn normalize_platform(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Normalize a list of platform names, dropping blanks and duplicates.
///
/// First-seen order is kept so logs read in the order the caller gave.
pub fn normalize_platforms<I, S>(platforms: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = Vec::new();
    for name in platforms {
        let name = normalize_platform(name.as_ref());
        if !name.is_empty() && !normalized.contains(&name) {
            normalized.push(name);
        }
    }
    normalized
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Posted,
    Failed,
    Cancelled,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Posted => "posted",
            PostStatus::Failed => "failed",
            PostStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses admit no further transition
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PostStatus::Pending)
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = SchedcastError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(PostStatus::Pending),
            "posted" => Ok(PostStatus::Posted),
            "failed" => Ok(PostStatus::Failed),
            "cancelled" | "canceled" => Ok(PostStatus::Cancelled),
            other => Err(SchedcastError::InvalidInput(format!(
                "Invalid status '{}'. Valid options: pending, posted, failed, cancelled",
                other
            ))),
        }
    }
}

/// Result of one publish attempt to one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformOutcome {
    /// Platform name (e.g., "twitter", "facebook")
    pub platform: String,
    /// Whether the publish succeeded
    pub success: bool,
    /// Platform-specific post ID (if successful)
    pub remote_id: Option<String>,
    /// Error detail (if failed)
    pub error: Option<String>,
}

impl PlatformOutcome {
    pub fn success(platform: impl Into<String>, remote_id: String) -> Self {
        Self {
            platform: platform.into(),
            success: true,
            remote_id: Some(remote_id),
            error: None,
        }
    }

    pub fn failure(platform: impl Into<String>, error: &PlatformError) -> Self {
        Self {
            platform: platform.into(),
            success: false,
            remote_id: None,
            error: Some(error.to_string()),
        }
    }
}

/// How a single coordinator run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Terminal status written by this run
    Finished(PostStatus),
    /// Post was already out of `Pending` when loaded; nothing published
    Skipped(PostStatus),
    /// Post left `Pending` while publishing; the terminal write was a no-op
    Superseded(PostStatus),
    /// The post was moved to another time after this entry was queued;
    /// nothing published
    Rescheduled,
    /// Another run holds the post's claim; nothing published
    AlreadyClaimed,
    /// Post no longer exists in the store
    Vanished,
}

/// Diagnostic record of one coordinator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub post_id: String,
    pub outcome: RunOutcome,
    /// One entry per target platform, in the post's platform order
    pub platforms: Vec<PlatformOutcome>,
}

impl ExecutionReport {
    pub fn new(post_id: impl Into<String>, outcome: RunOutcome) -> Self {
        Self {
            post_id: post_id.into(),
            outcome,
            platforms: Vec::new(),
        }
    }

    /// The status this run wrote, if it wrote one
    pub fn final_status(&self) -> Option<PostStatus> {
        match self.outcome {
            RunOutcome::Finished(status) => Some(status),
            _ => None,
        }
    }

    pub fn outcome_for(&self, platform: &str) -> Option<&PlatformOutcome> {
        self.platforms.iter().find(|o| o.platform == platform)
    }
}
