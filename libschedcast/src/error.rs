//! Error types for Schedcast

use thiserror::Error;

use crate::types::PostStatus;

pub type Result<T> = std::result::Result<T, SchedcastError>;

#[derive(Error, Debug)]
pub enum SchedcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Post not found: {0}")]
    NotFound(String),

    #[error("Post {post_id} is no longer pending (status: {status})")]
    NotPending { post_id: String, status: PostStatus },

    #[error("Post {0} is being published; too late to change it")]
    InFlight(String),

    #[error("Failed to record final status for post {post_id}: {reason}")]
    StoreWrite { post_id: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SchedcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SchedcastError::InvalidInput(_) | SchedcastError::NotFound(_) => 3,
            SchedcastError::Config(_) | SchedcastError::Database(_) => 2,
            SchedcastError::Platform(_)
            | SchedcastError::NotPending { .. }
            | SchedcastError::InFlight(_)
            | SchedcastError::StoreWrite { .. } => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid row data: {0}")]
    InvalidData(String),
}

/// Failure of a single publish attempt.
///
/// Cloneable so the same failure can be logged, reported and broadcast.
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Unsupported platform: {0}")]
    Unsupported(String),
}
