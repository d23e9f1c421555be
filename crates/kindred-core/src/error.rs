//! Graph error taxonomy
//!
//! Every operation on a collection graph fails with one of these kinds.
//! Conflicts and validation failures are reported synchronously to the caller;
//! persistence failures and state corruption are escalated as operational
//! alerts.

use thiserror::Error;

/// Error type for collection graph operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// A lock is already held or the collection/entity is not in the expected
    /// phase. Nothing was mutated; the caller may retry.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The request is malformed and was rejected before any lock was acquired
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The underlying store failed during a write; the write was rolled back
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Cached state diverged from source data in a way sync cannot repair
    #[error("State corruption: {0}")]
    StateCorruption(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for collection graph operations
pub type GraphResult<T> = Result<T, GraphError>;

impl GraphError {
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Self::StateCorruption(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Check if the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Check if the error must be escalated as an operational alert
    pub fn is_alert(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::StateCorruption(_))
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::Persistence(_) => "persistence",
            Self::StateCorruption(_) => "state_corruption",
            Self::NotFound { .. } => "not_found",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
