//! Error types for retrigger
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in retrigger
#[derive(Debug, Error)]
pub enum RetriggerError {
    /// State store could not be read or written
    #[error("Store error: {0}")]
    Store(String),

    /// SQLite failure underneath the state store
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Another pass holds the state store lease
    #[error("Pass lock held by {holder} until {expires_at}")]
    LockHeld { holder: String, expires_at: String },

    /// GitHub API returned something we could not use
    #[error("GitHub error: {0}")]
    GitHub(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Persisted data did not decode into a typed record
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RetriggerError {
    /// True when the error means the state store cannot be trusted for this pass.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            RetriggerError::Store(_)
                | RetriggerError::Sqlite(_)
                | RetriggerError::LockHeld { .. }
                | RetriggerError::InvalidData(_)
        )
    }
}

/// Result type alias for retrigger operations
pub type Result<T> = std::result::Result<T, RetriggerError>;
