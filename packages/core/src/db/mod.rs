//! Persistence Layer
//!
//! This module holds everything that talks to storage:
//!
//! - The Graph Store Port (`GraphStore`) and its adapters
//! - The Sync Queue (`SyncQueue`) with in-memory and libsql implementations
//! - Queue events and the error types of both sides
//!
//! # Architecture
//!
//! Services depend on the two traits only. Concrete backends are chosen by the
//! host when it builds the engine:
//!
//! - `MemoryGraphStore` / `MemorySyncQueue` for tests and development
//! - `LibsqlSyncQueue` for a durable queue file
//! - `SurrealGraphStore` (feature `surrealdb`) for an embedded graph database
//! - `TimeoutGraphStore` wraps any adapter with a per-call deadline

mod error;
pub mod events;
mod graph_store;
mod libsql_queue;
mod memory_graph;
mod memory_queue;
#[cfg(feature = "surrealdb")]
mod surreal_graph;
mod sync_queue;
mod timeout;

pub use error::{DatabaseError, GraphError};
pub use events::QueueEvent;
pub use graph_store::{
    BatchOutcome, Direction, EdgeFilter, GraphOperation, GraphStore, MergeOutcome, NodeUpsert,
    TraversalHit,
};
pub use libsql_queue::LibsqlSyncQueue;
pub use memory_graph::MemoryGraphStore;
pub use memory_queue::MemorySyncQueue;
#[cfg(feature = "surrealdb")]
pub use surreal_graph::SurrealGraphStore;
pub use sync_queue::{SyncQueue, QUEUE_EVENT_CAPACITY};
pub use timeout::TimeoutGraphStore;
