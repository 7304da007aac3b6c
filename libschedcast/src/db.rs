//! SQLite-backed Post Store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::store::{ensure_finish_status, new_claim_token, Claim, PostStore, Transition};
use crate::types::{Post, PostStatus};

const SELECT_POST: &str = r#"
    SELECT id, content, platforms, scheduled_at, media_url, status, created_at, posted_at,
           claimed_at, claim_token
    FROM posts
"#;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work on both Windows and Unix; mode=rwc creates the file
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Status, claim state and fire time of a post, if it exists
    async fn state_of(&self, post_id: &str) -> Result<Option<RowState>> {
        let row = sqlx::query(
            "SELECT status, claim_token, scheduled_at FROM posts WHERE id = ?",
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| {
            Ok(RowState {
                status: parse_status(r.get::<String, _>("status").as_str())?,
                claimed: r.get::<Option<String>, _>("claim_token").is_some(),
                scheduled_at: millis_to_datetime(r.get("scheduled_at"), "scheduled_at")?,
            })
        })
        .transpose()
    }

    /// Interpret the affected-row count of a guarded `UPDATE`
    async fn transition_result(&self, post_id: &str, rows_affected: u64) -> Result<Transition> {
        if rows_affected > 0 {
            return Ok(Transition::Applied);
        }
        Ok(match self.state_of(post_id).await? {
            None => Transition::NotFound,
            Some(state) if state.status != PostStatus::Pending => {
                Transition::NotPending(state.status)
            }
            // Pending but the guard failed: a run holds (or changed) the claim
            Some(_) => Transition::InFlight,
        })
    }
}

struct RowState {
    status: PostStatus,
    claimed: bool,
    scheduled_at: DateTime<Utc>,
}

#[async_trait]
impl PostStore for Database {
    async fn create(&self, post: &Post) -> Result<String> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, content, platforms, scheduled_at, media_url, status, created_at, posted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.content)
        .bind(post.platforms.join(","))
        .bind(post.scheduled_at.timestamp_millis())
        .bind(&post.media_url)
        .bind(post.status.as_str())
        .bind(post.created_at.timestamp_millis())
        .bind(post.posted_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(post.id.clone())
    }

    async fn get(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_POST))
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_post).transpose()
    }

    async fn list(&self, status: Option<PostStatus>) -> Result<Vec<Post>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "{} WHERE status = ? ORDER BY scheduled_at ASC, created_at ASC",
                    SELECT_POST
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "{} ORDER BY scheduled_at ASC, created_at ASC",
                    SELECT_POST
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    async fn reschedule(&self, post_id: &str, scheduled_at: DateTime<Utc>) -> Result<Transition> {
        let result = sqlx::query(
            "UPDATE posts SET scheduled_at = ?
             WHERE id = ? AND status = 'pending' AND claim_token IS NULL",
        )
        .bind(scheduled_at.timestamp_millis())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.transition_result(post_id, result.rows_affected()).await
    }

    async fn cancel(&self, post_id: &str) -> Result<Transition> {
        let result = sqlx::query(
            "UPDATE posts SET status = 'cancelled'
             WHERE id = ? AND status = 'pending' AND claim_token IS NULL",
        )
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.transition_result(post_id, result.rows_affected()).await
    }

    async fn claim(
        &self,
        post_id: &str,
        fire_at: Option<DateTime<Utc>>,
        claimed_at: DateTime<Utc>,
    ) -> Result<Claim> {
        let token = new_claim_token();
        let result = sqlx::query(
            r#"
            UPDATE posts SET claim_token = ?, claimed_at = ?
            WHERE id = ? AND status = 'pending' AND claim_token IS NULL
              AND (? IS NULL OR scheduled_at = ?)
            "#,
        )
        .bind(&token)
        .bind(claimed_at.timestamp_millis())
        .bind(post_id)
        .bind(fire_at.map(|t| t.timestamp_millis()))
        .bind(fire_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() > 0 {
            return Ok(Claim::Acquired(token));
        }

        Ok(match self.state_of(post_id).await? {
            None => Claim::NotFound,
            Some(state) if state.status != PostStatus::Pending => Claim::NotPending(state.status),
            Some(state) if state.claimed => Claim::Held,
            Some(state) => match fire_at {
                Some(fire_at) if state.scheduled_at.timestamp_millis() != fire_at.timestamp_millis() => {
                    Claim::Moved(state.scheduled_at)
                }
                // Lost a race with a concurrent claim that has since settled
                _ => Claim::Held,
            },
        })
    }

    async fn finish(
        &self,
        post_id: &str,
        claim: &str,
        status: PostStatus,
        posted_at: DateTime<Utc>,
    ) -> Result<Transition> {
        ensure_finish_status(status)?;

        let result = sqlx::query(
            r#"
            UPDATE posts SET status = ?, posted_at = ?
            WHERE id = ? AND status = 'pending' AND claim_token = ?
            "#,
        )
        .bind(status.as_str())
        .bind(posted_at.timestamp_millis())
        .bind(post_id)
        .bind(claim)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.transition_result(post_id, result.rows_affected()).await
    }

    async fn abandon(&self, post_id: &str, failed_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'failed', posted_at = ?
            WHERE id = ? AND status = 'pending' AND claim_token IS NOT NULL
            "#,
        )
        .bind(failed_at.timestamp_millis())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, post_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM posts WHERE id = ?")
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }
}

fn parse_status(raw: &str) -> Result<PostStatus> {
    raw.parse()
        .map_err(|_| DbError::InvalidData(format!("unknown post status '{}'", raw)).into())
}

fn millis_to_datetime(millis: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        DbError::InvalidData(format!("{} out of range: {}", column, millis)).into()
    })
}

fn row_to_post(row: &SqliteRow) -> Result<Post> {
    let platforms: String = row.get("platforms");
    let posted_at: Option<i64> = row.get("posted_at");
    let claimed_at: Option<i64> = row.get("claimed_at");
    let status = parse_status(row.get::<String, _>("status").as_str())?;
    let claim_token: Option<String> = row.get("claim_token");

    Ok(Post {
        id: row.get("id"),
        content: row.get("content"),
        platforms: crate::types::normalize_platforms(platforms.split(',')),
        scheduled_at: millis_to_datetime(row.get("scheduled_at"), "scheduled_at")?,
        media_url: row.get("media_url"),
        status,
        created_at: millis_to_datetime(row.get("created_at"), "created_at")?,
        posted_at: posted_at
            .map(|ms| millis_to_datetime(ms, "posted_at"))
            .transpose()?,
        // Only a live claim on a pending post is reported
        claimed_at: match (status, claim_token) {
            (PostStatus::Pending, Some(_)) => claimed_at
                .map(|ms| millis_to_datetime(ms, "claimed_at"))
                .transpose()?,
            _ => None,
        },
    })
}
