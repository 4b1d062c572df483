//! Data Models
//!
//! This module contains the data structures shared by the sync engine:
//!
//! - Graph identities, nodes and edges of the projection
//! - Sync queue items and change notifications
//! - Typed primary-layer records and the relationships they embed

mod graph;
mod layer_record;
mod queue_item;

pub use graph::{
    validate_properties, DesiredEdge, EdgeType, EntityType, GraphEdge, GraphNode, NodeHandle,
    NodeKey, PropertyMap, ValidationError, RESERVED_PROPERTIES,
};
pub use layer_record::{
    normalize_entity_name, AgentRecord, ContextRecord, ConversationRecord, FactRecord,
    LayerRecord, MemoryRecord, MemorySpaceRecord, UserRecord,
};
pub use queue_item::{
    ChangeEvent, NewSyncItem, QueueStats, SyncOperation, SyncQueueItem, SyncStatus,
};
