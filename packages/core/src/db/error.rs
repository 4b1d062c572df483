//! Database Error Types
//!
//! This module defines error types for the persistence side of the engine:
//!
//! - [`DatabaseError`] - sync queue storage (libsql) failures
//! - [`GraphError`] - failures reported by a Graph Store Port adapter

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Sync queue storage errors
///
/// Covers connection, initialization and statement failures of the durable
/// queue. Row decoding problems are reported as `CorruptRow`.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to establish database connection
    #[error("Failed to connect to database at {path}: {source}")]
    ConnectionFailed {
        path: PathBuf,
        source: libsql::Error,
    },

    /// Failed to initialize database schema
    #[error("Failed to initialize database schema: {0}")]
    InitializationFailed(String),

    /// Permission denied when accessing database
    #[error("Permission denied for database path: {path}")]
    PermissionDenied { path: PathBuf },

    /// Failed to create parent directory
    #[error("Failed to create parent directory for database: {0}")]
    DirectoryCreationFailed(#[from] std::io::Error),

    /// libsql operation error
    #[error("Database operation failed: {0}")]
    LibsqlError(#[from] libsql::Error),

    /// SQL execution error with context
    #[error("SQL execution failed: {context}")]
    SqlExecutionError { context: String },

    /// A stored row could not be decoded
    #[error("Corrupt queue row {item_id}: {reason}")]
    CorruptRow { item_id: i64, reason: String },

    /// Referenced queue item does not exist
    #[error("Queue item not found: {0}")]
    ItemNotFound(i64),
}

impl DatabaseError {
    /// Create a connection failed error
    pub fn connection_failed(path: PathBuf, source: libsql::Error) -> Self {
        Self::ConnectionFailed { path, source }
    }

    /// Create an initialization failed error
    pub fn initialization_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Create a permission denied error
    pub fn permission_denied(path: PathBuf) -> Self {
        Self::PermissionDenied { path }
    }

    /// Create a SQL execution error with context
    pub fn sql_execution(context: impl Into<String>) -> Self {
        Self::SqlExecutionError {
            context: context.into(),
        }
    }

    /// Create a corrupt row error
    pub fn corrupt_row(item_id: i64, reason: impl Into<String>) -> Self {
        Self::CorruptRow {
            item_id,
            reason: reason.into(),
        }
    }
}

/// Graph Store Port errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// Backend not reachable (connection refused, network partition, ...)
    #[error("Graph backend unavailable: {0}")]
    Unavailable(String),

    /// Port call exceeded its deadline
    #[error("Graph operation '{operation}' timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Backend rejected a node or edge as malformed
    #[error("Invalid graph node: {0}")]
    InvalidNode(String),

    /// Node required by an update does not exist
    #[error("Graph node not found: {0}")]
    NotFound(String),

    /// A batch precondition no longer held when the batch ran
    #[error("Graph batch conflict: {0}")]
    Conflict(String),

    /// Any other backend failure
    #[error("Graph backend error: {0}")]
    Backend(String),
}

impl GraphError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn invalid_node(msg: impl Into<String>) -> Self {
        Self::InvalidNode(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GraphError::Unavailable(_)
                | GraphError::Timeout { .. }
                | GraphError::Conflict(_)
                | GraphError::Backend(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_classification() {
        assert!(GraphError::unavailable("refused").is_transient());
        assert!(GraphError::Timeout {
            operation: "run_batch",
            after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(GraphError::backend("deadlock").is_transient());
        assert!(GraphError::conflict("new reference").is_transient());
        assert!(!GraphError::invalid_node("bad").is_transient());
        assert!(!GraphError::not_found("Fact:x").is_transient());
    }

    #[test]
    fn test_timeout_message_names_operation() {
        let err = GraphError::Timeout {
            operation: "get_node",
            after: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "Graph operation 'get_node' timed out after 250ms"
        );
    }
}
