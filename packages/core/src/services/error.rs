//! Service Layer Error Types
//!
//! This module defines the error taxonomy of the sync services. Every variant
//! is either transient (the worker retries the item with backoff) or permanent
//! (the item is marked failed immediately). `SyncError::is_transient` is the
//! single place that decides.

use crate::db::{DatabaseError, GraphError};
use crate::models::ValidationError;
use std::time::Duration;
use thiserror::Error;

/// Sync service errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// Graph backend could not be reached or failed internally
    #[error("Graph backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A Graph Store Port call exceeded its deadline
    #[error("Graph operation '{operation}' timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The graph changed between planning and applying a batch
    #[error("Graph changed concurrently: {0}")]
    Conflict(String),

    /// Entity or record is malformed; retrying cannot help
    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    /// Primary store could not be read
    #[error("Record source unavailable: {0}")]
    SourceUnavailable(String),

    /// Sync queue storage failed
    #[error("Sync queue error: {0}")]
    Queue(#[from] DatabaseError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The task processing an item panicked or was cancelled
    #[error("Sync task aborted: {0}")]
    TaskAborted(String),

    /// `start_worker` called while a worker is already running
    #[error("Sync worker is already running")]
    WorkerAlreadyRunning,
}

impl SyncError {
    /// Create a backend unavailable error
    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Create an invalid entity error
    pub fn invalid_entity(msg: impl Into<String>) -> Self {
        Self::InvalidEntity(msg.into())
    }

    /// Create a record source error
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    /// Create a task aborted error
    pub fn task_aborted(msg: impl Into<String>) -> Self {
        Self::TaskAborted(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether the failed item should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::BackendUnavailable(_)
            | SyncError::Timeout { .. }
            | SyncError::Conflict(_)
            | SyncError::SourceUnavailable(_)
            | SyncError::TaskAborted(_)
            | SyncError::Queue(_) => true,
            SyncError::InvalidEntity(_)
            | SyncError::Serialization(_)
            | SyncError::WorkerAlreadyRunning => false,
        }
    }
}

impl From<GraphError> for SyncError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Unavailable(msg) | GraphError::Backend(msg) => {
                SyncError::BackendUnavailable(msg)
            }
            GraphError::Timeout { operation, after } => SyncError::Timeout { operation, after },
            GraphError::Conflict(msg) => SyncError::Conflict(msg),
            GraphError::InvalidNode(msg) => SyncError::InvalidEntity(msg),
            GraphError::NotFound(key) => {
                SyncError::InvalidEntity(format!("graph node not found: {}", key))
            }
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::InvalidEntity(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;

    #[test]
    fn test_graph_errors_keep_their_classification() {
        let transient: SyncError = GraphError::unavailable("refused").into();
        assert!(matches!(transient, SyncError::BackendUnavailable(_)));
        assert!(transient.is_transient());

        let timeout: SyncError = GraphError::Timeout {
            operation: "run_batch",
            after: Duration::from_millis(10),
        }
        .into();
        assert!(timeout.is_transient());

        let conflict: SyncError = GraphError::conflict("Fact:f1 gained a reference").into();
        assert!(matches!(conflict, SyncError::Conflict(_)));
        assert!(conflict.is_transient());

        let invalid: SyncError = GraphError::invalid_node("missing endpoint").into();
        assert!(matches!(invalid, SyncError::InvalidEntity(_)));
        assert!(!invalid.is_transient());
    }

    #[test]
    fn test_validation_and_queue_errors() {
        let invalid: SyncError = ValidationError::EmptyKey(EntityType::Fact).into();
        assert!(!invalid.is_transient());

        let queue: SyncError = DatabaseError::sql_execution("locked").into();
        assert!(queue.is_transient());
    }
}
