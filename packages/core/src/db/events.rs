//! Queue Events
//!
//! Notifications emitted by a `SyncQueue` when work becomes available. The
//! worker subscribes to them in push mode so it wakes without polling.
//!
//! # Architecture
//!
//! Events are emitted using tokio's broadcast channel, allowing multiple
//! subscribers. A lagging subscriber loses events but never blocks the queue;
//! the worker's safety poll covers the gap.

use crate::models::NodeKey;
use serde::{Deserialize, Serialize};

/// Work-availability events emitted by a sync queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    /// A new item was appended
    Enqueued { item_id: i64, key: NodeKey },

    /// A failed attempt was scheduled for another try
    Retried { item_id: i64 },

    /// An operator re-armed a terminally failed item
    Rearmed { item_id: i64 },
}

impl QueueEvent {
    pub fn event_type(&self) -> &str {
        match self {
            QueueEvent::Enqueued { .. } => "queue:enqueued",
            QueueEvent::Retried { .. } => "queue:retried",
            QueueEvent::Rearmed { .. } => "queue:rearmed",
        }
    }

    pub fn item_id(&self) -> i64 {
        match self {
            QueueEvent::Enqueued { item_id, .. }
            | QueueEvent::Retried { item_id }
            | QueueEvent::Rearmed { item_id } => *item_id,
        }
    }
}
