//! Outbox error types.

use sync_database::DatabaseError;
use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid store configuration
    #[error("Invalid outbox config: {0}")]
    InvalidConfig(String),
}

impl OutboxError {
    /// True when the job exists but is no longer pending.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::Database(DatabaseError::InvalidState(_)))
    }
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
