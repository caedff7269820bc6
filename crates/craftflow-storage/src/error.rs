//! Storage error types.

use thiserror::Error;

/// Errors surfaced by the repositories.
///
/// `VersionConflict` and `NotFound` are part of the optimistic-locking
/// contract and are matched on by the engine; everything else is a backend
/// fault.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("version conflict on task {0}")]
    VersionConflict(String),

    #[error("invalid transition for task {task_id}: {detail}")]
    InvalidTransition { task_id: String, detail: String },

    #[error("lease not held by {worker_id} for task {task_id}")]
    LeaseMismatch { task_id: String, worker_id: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
