//! Error classification shared across the engine.

use serde::{Deserialize, Serialize};

/// Classification tag carried by every error the core surfaces.
///
/// The graph engine uses the tag to decide between retrying, rerouting and
/// failing the task; webhook `failed` payloads expose it as `error.type`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    VersionConflict,
    NotFound,
    NodeTimeout,
    TaskTimeout,
    TransientExternal,
    PermanentExternal,
    QualityFailed,
    BudgetExhausted,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether an error of this kind may succeed on a retry of the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::NodeTimeout | ErrorKind::TransientExternal)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::VersionConflict => "version_conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NodeTimeout => "node_timeout",
            ErrorKind::TaskTimeout => "task_timeout",
            ErrorKind::TransientExternal => "transient_external",
            ErrorKind::PermanentExternal => "permanent_external",
            ErrorKind::QualityFailed => "quality_failed",
            ErrorKind::BudgetExhausted => "budget_exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::TransientExternal.is_retryable());
        assert!(ErrorKind::NodeTimeout.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::PermanentExternal.is_retryable());
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::TransientExternal).unwrap();
        assert_eq!(json, "\"transient_external\"");
    }
}
