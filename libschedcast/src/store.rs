//! Post Store abstraction
//!
//! The store is the only owner of a post's status. Every status change goes
//! through a compare-and-set on `Pending`, so a reschedule, a cancel and an
//! in-flight run's terminal write can never interleave into an inconsistent
//! state: whichever lands first wins, the others observe `NotPending`.
//!
//! A run claims the post before it publishes. The claim is a token stored
//! with the post: while it is set, `cancel` and `reschedule` report
//! [`Transition::InFlight`], and only the holder of the token can `finish`
//! the post. This holds across processes sharing one database, where the
//! engine's in-memory bookkeeping cannot see the other side.
//!
//! Two implementations ship with the crate: [`MemoryPostStore`] here and the
//! SQLite-backed [`crate::db::Database`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, SchedcastError};
use crate::types::{Post, PostStatus};

/// Result of a guarded status write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The post exists but had already left `Pending`
    NotPending(PostStatus),
    /// The post is pending but a run holds its claim
    InFlight,
    NotFound,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

/// Result of trying to claim a post for publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller holds the post; pass the token to [`PostStore::finish`]
    Acquired(String),
    NotPending(PostStatus),
    /// The post now fires at a different time than the one requested
    Moved(DateTime<Utc>),
    /// Another run already holds the claim
    Held,
    NotFound,
}

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Insert a new post and return its id
    async fn create(&self, post: &Post) -> Result<String>;

    async fn get(&self, post_id: &str) -> Result<Option<Post>>;

    /// List posts ordered by scheduled time, optionally filtered by status
    async fn list(&self, status: Option<PostStatus>) -> Result<Vec<Post>>;

    /// Move the fire time of a pending, unclaimed post
    async fn reschedule(&self, post_id: &str, scheduled_at: DateTime<Utc>) -> Result<Transition>;

    /// `Pending -> Cancelled`, unless a run holds the claim
    async fn cancel(&self, post_id: &str) -> Result<Transition>;

    /// Claim a pending, unclaimed post for publishing
    ///
    /// With `fire_at` set, the claim only succeeds while the post is still
    /// scheduled at that time (compared at millisecond precision).
    async fn claim(
        &self,
        post_id: &str,
        fire_at: Option<DateTime<Utc>>,
        claimed_at: DateTime<Utc>,
    ) -> Result<Claim>;

    /// `Pending -> Posted | Failed` for the holder of `claim`, stamping
    /// `posted_at`
    async fn finish(
        &self,
        post_id: &str,
        claim: &str,
        status: PostStatus,
        posted_at: DateTime<Utc>,
    ) -> Result<Transition>;

    /// Mark a claimed post `Failed` when the run holding it is gone
    ///
    /// Returns whether a claimed pending post was found and failed.
    async fn abandon(&self, post_id: &str, failed_at: DateTime<Utc>) -> Result<bool>;

    /// Remove a post entirely. Returns whether a row was removed.
    async fn delete(&self, post_id: &str) -> Result<bool>;
}

/// Reject terminal writes that aren't posted/failed
pub(crate) fn ensure_finish_status(status: PostStatus) -> Result<()> {
    match status {
        PostStatus::Posted | PostStatus::Failed => Ok(()),
        other => Err(SchedcastError::InvalidInput(format!(
            "'{}' is not a publish result status",
            other
        ))),
    }
}

pub(crate) fn new_claim_token() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Default)]
struct MemoryState {
    posts: HashMap<String, Post>,
    /// Claim token per claimed post id
    claims: HashMap<String, String>,
}

/// In-process store backed by a `HashMap`
#[derive(Debug, Default)]
pub struct MemoryPostStore {
    state: RwLock<MemoryState>,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `update` under the write lock if the post is pending and unclaimed
    async fn transition<F>(&self, post_id: &str, update: F) -> Transition
    where
        F: FnOnce(&mut Post),
    {
        let mut state = self.state.write().await;
        let MemoryState { posts, claims } = &mut *state;
        match posts.get_mut(post_id) {
            None => Transition::NotFound,
            Some(post) if post.status != PostStatus::Pending => Transition::NotPending(post.status),
            Some(_) if claims.contains_key(post_id) => Transition::InFlight,
            Some(post) => {
                update(post);
                Transition::Applied
            }
        }
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn create(&self, post: &Post) -> Result<String> {
        let mut state = self.state.write().await;
        if state.posts.contains_key(&post.id) {
            return Err(SchedcastError::InvalidInput(format!(
                "Post {} already exists",
                post.id
            )));
        }
        state.posts.insert(post.id.clone(), post.clone());
        Ok(post.id.clone())
    }

    async fn get(&self, post_id: &str) -> Result<Option<Post>> {
        Ok(self.state.read().await.posts.get(post_id).cloned())
    }

    async fn list(&self, status: Option<PostStatus>) -> Result<Vec<Post>> {
        let state = self.state.read().await;
        let mut matching: Vec<Post> = state
            .posts
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(matching)
    }

    async fn reschedule(&self, post_id: &str, scheduled_at: DateTime<Utc>) -> Result<Transition> {
        let scheduled_at = crate::types::to_millis(scheduled_at);
        Ok(self
            .transition(post_id, |post| post.scheduled_at = scheduled_at)
            .await)
    }

    async fn cancel(&self, post_id: &str) -> Result<Transition> {
        Ok(self
            .transition(post_id, |post| post.status = PostStatus::Cancelled)
            .await)
    }

    async fn claim(
        &self,
        post_id: &str,
        fire_at: Option<DateTime<Utc>>,
        claimed_at: DateTime<Utc>,
    ) -> Result<Claim> {
        let mut state = self.state.write().await;
        let MemoryState { posts, claims } = &mut *state;
        let Some(post) = posts.get_mut(post_id) else {
            return Ok(Claim::NotFound);
        };
        if post.status != PostStatus::Pending {
            return Ok(Claim::NotPending(post.status));
        }
        if claims.contains_key(post_id) {
            return Ok(Claim::Held);
        }
        if let Some(fire_at) = fire_at {
            if post.scheduled_at.timestamp_millis() != fire_at.timestamp_millis() {
                return Ok(Claim::Moved(post.scheduled_at));
            }
        }

        let token = new_claim_token();
        claims.insert(post_id.to_string(), token.clone());
        post.claimed_at = Some(crate::types::to_millis(claimed_at));
        Ok(Claim::Acquired(token))
    }

    async fn finish(
        &self,
        post_id: &str,
        claim: &str,
        status: PostStatus,
        posted_at: DateTime<Utc>,
    ) -> Result<Transition> {
        ensure_finish_status(status)?;

        let mut state = self.state.write().await;
        let MemoryState { posts, claims } = &mut *state;
        Ok(match posts.get_mut(post_id) {
            None => Transition::NotFound,
            Some(post) if post.status != PostStatus::Pending => Transition::NotPending(post.status),
            Some(_) if claims.get(post_id).map(String::as_str) != Some(claim) => {
                Transition::InFlight
            }
            Some(post) => {
                post.status = status;
                post.posted_at = Some(crate::types::to_millis(posted_at));
                post.claimed_at = None;
                claims.remove(post_id);
                Transition::Applied
            }
        })
    }

    async fn abandon(&self, post_id: &str, failed_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        let MemoryState { posts, claims } = &mut *state;
        match posts.get_mut(post_id) {
            Some(post) if post.status == PostStatus::Pending && claims.contains_key(post_id) => {
                post.status = PostStatus::Failed;
                post.posted_at = Some(crate::types::to_millis(failed_at));
                post.claimed_at = None;
                claims.remove(post_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, post_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        state.claims.remove(post_id);
        Ok(state.posts.remove(post_id).is_some())
    }
}
