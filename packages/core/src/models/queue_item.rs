//! Sync Queue Item Structures
//!
//! A queue item records one pending synchronization of a node: which key, what
//! to do (upsert or delete), and at which source version.
//!
//! # Lifecycle
//!
//! ```text
//! Pending ──claim──▶ InFlight ──ok──────────────▶ Done
//!    ▲                  │
//!    └──transient error─┤ (attempts < max)
//!                       └──permanent error / attempts exhausted──▶ Failed
//! ```
//!
//! Delivery is at-least-once: an item may be processed more than once, so every
//! handler downstream of the queue is idempotent.

use crate::models::{EntityType, NodeKey, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a queue item asks the worker to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Upsert,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Upsert => "upsert",
            SyncOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOperation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(SyncOperation::Upsert),
            "delete" => Ok(SyncOperation::Delete),
            other => Err(ValidationError::InvalidRecord(format!(
                "unknown sync operation '{other}'"
            ))),
        }
    }
}

/// Processing state of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InFlight => "inflight",
            SyncStatus::Done => "done",
            SyncStatus::Failed => "failed",
        }
    }

    /// Done and Failed items are never claimed again automatically
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Done | SyncStatus::Failed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "inflight" => Ok(SyncStatus::InFlight),
            "done" => Ok(SyncStatus::Done),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(ValidationError::InvalidRecord(format!(
                "unknown sync status '{other}'"
            ))),
        }
    }
}

/// A persisted unit of synchronization work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    /// Monotonic per queue; defines enqueue order
    pub item_id: i64,
    pub key: NodeKey,
    pub operation: SyncOperation,
    pub source_version: u64,
    pub enqueued_at: DateTime<Utc>,
    pub status: SyncStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time a retried item may be claimed again
    pub next_attempt_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for enqueueing a new item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSyncItem {
    pub key: NodeKey,
    pub operation: SyncOperation,
    pub source_version: u64,
}

impl NewSyncItem {
    pub fn new(
        entity_type: EntityType,
        stable_key: impl Into<String>,
        operation: SyncOperation,
        source_version: u64,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            key: NodeKey::new(entity_type, stable_key)?,
            operation,
            source_version,
        })
    }

    pub fn upsert(key: NodeKey, source_version: u64) -> Self {
        Self {
            key,
            operation: SyncOperation::Upsert,
            source_version,
        }
    }

    pub fn delete(key: NodeKey, source_version: u64) -> Self {
        Self {
            key,
            operation: SyncOperation::Delete,
            source_version,
        }
    }
}

/// Change notification from the primary store
///
/// The primary store is the sole source of enqueue events; each event maps to
/// exactly one queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub entity_type: EntityType,
    pub stable_key: String,
    pub operation: SyncOperation,
    pub version: u64,
}

impl ChangeEvent {
    pub fn into_new_item(self) -> Result<NewSyncItem, ValidationError> {
        NewSyncItem::new(
            self.entity_type,
            self.stable_key,
            self.operation,
            self.version,
        )
    }
}

/// Item counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub done: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Items that still need work
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::InFlight,
            SyncStatus::Done,
            SyncStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>(), Ok(status));
        }
        assert!("paused".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(SyncStatus::Done.is_terminal());
        assert!(SyncStatus::Failed.is_terminal());
        assert!(!SyncStatus::Pending.is_terminal());
        assert!(!SyncStatus::InFlight.is_terminal());
    }

    #[test]
    fn test_change_event_rejects_empty_key() {
        let event = ChangeEvent {
            entity_type: EntityType::Conversation,
            stable_key: String::new(),
            operation: SyncOperation::Upsert,
            version: 1,
        };
        assert!(event.into_new_item().is_err());
    }

    #[test]
    fn test_operation_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SyncOperation::Delete).unwrap(),
            "\"delete\""
        );
    }
}
