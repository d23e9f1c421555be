//! Error types for SQLite storage

use kindred_core::GraphError;
use thiserror::Error;

/// SQLite storage error type
#[derive(Error, Debug)]
pub enum SqliteError {
    /// Database connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Schema/migration error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Blocking task failed to complete
    #[error("Task error: {0}")]
    Task(String),

    /// Record not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Domain rule violation raised inside a storage closure
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Underlying rusqlite error
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
}

/// Result type for SQLite operations
pub type SqliteResult<T> = Result<T, SqliteError>;

impl SqliteError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for SqliteError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<SqliteError> for GraphError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Connection(msg) => Self::Persistence(msg),
            SqliteError::Schema(msg) => Self::Persistence(msg),
            SqliteError::Task(msg) => Self::Persistence(msg),
            SqliteError::NotFound { kind, id } => Self::NotFound { kind, id },
            SqliteError::Serialization(msg) => Self::Serialization(msg),
            SqliteError::Graph(e) => e,
            SqliteError::Rusqlite(e) => Self::Persistence(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rusqlite_errors_become_persistence() {
        let err: GraphError = SqliteError::from(rusqlite::Error::InvalidQuery).into();
        assert!(matches!(err, GraphError::Persistence(_)));
        assert!(err.is_alert());
    }

    #[test]
    fn test_domain_errors_pass_through() {
        let err: GraphError = SqliteError::from(GraphError::conflict("entity locked")).into();
        assert_eq!(err, GraphError::conflict("entity locked"));

        let err: GraphError = SqliteError::not_found("document", "0e5fe0c8").into();
        assert_eq!(err.kind(), "not_found");
    }
}
