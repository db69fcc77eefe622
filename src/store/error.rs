//! Coordination store errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by a coordination store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    NodeExists(String),

    #[error("version conflict on {path}")]
    VersionConflict { path: String },

    #[error("session expired")]
    SessionExpired,

    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Transient errors the caller should retry after a fresh read or a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::Unavailable(_)
        )
    }
}
