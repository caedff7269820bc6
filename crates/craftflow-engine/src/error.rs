//! Engine and node error types, tagged with [`ErrorKind`] classifications.

use craftflow_models::ErrorKind;
use craftflow_storage::StoreError;
use thiserror::Error;

/// Error raised by a node or the runtime wrapping it.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Deterministic precondition failure. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("node {node} timed out after {timeout_ms}ms")]
    Timeout { node: String, timeout_ms: u64 },

    /// 5xx / network / rate-limit class failures. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Non-retryable upstream rejection.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Validation(_) => ErrorKind::Validation,
            NodeError::Timeout { .. } => ErrorKind::NodeTimeout,
            NodeError::Transient(_) => ErrorKind::TransientExternal,
            NodeError::Permanent(_) => ErrorKind::PermanentExternal,
            NodeError::Cancelled => ErrorKind::Cancelled,
            NodeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the runtime may re-invoke the node after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Transient(_) | NodeError::Timeout { .. })
    }
}

impl From<crate::services::ServiceError> for NodeError {
    fn from(err: crate::services::ServiceError) -> Self {
        use crate::services::ServiceError;
        match err {
            ServiceError::Transient(msg) => NodeError::Transient(msg),
            ServiceError::Permanent(msg) => NodeError::Permanent(msg),
            ServiceError::Cancelled => NodeError::Cancelled,
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Internal(format!("state serialization: {err}"))
    }
}

/// Error surfaced by the graph engine and executors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflow(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("node {node} failed: {source}")]
    Node { node: String, source: NodeError },

    #[error("task timed out after {0}ms")]
    TaskTimeout(u64),

    #[error("task cancelled")]
    Cancelled,

    #[error("checkpoint references a step no longer in the graph: {0}")]
    IncompatibleCheckpoint(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::UnknownWorkflow(_) | EngineError::InvalidParams(_) => ErrorKind::Validation,
            EngineError::Node { source, .. } => source.kind(),
            EngineError::TaskTimeout(_) => ErrorKind::TaskTimeout,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::IncompatibleCheckpoint(_) => ErrorKind::Internal,
            EngineError::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            EngineError::Store(StoreError::VersionConflict(_)) => ErrorKind::VersionConflict,
            EngineError::Store(_) => ErrorKind::Internal,
        }
    }
}
