//! Error types for funnel and purchase sync.

use sync_database::DatabaseError;
use thiserror::Error;

/// Funnel sync error.
#[derive(Error, Debug)]
pub enum FunnelSyncError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// A record from a source is unusable; only that record is skipped.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A candidate or purchase source failed.
    #[error("Source error: {0}")]
    Source(String),
}

/// Result type alias using FunnelSyncError.
pub type FunnelSyncResult<T> = Result<T, FunnelSyncError>;
