//! GraphStore Trait - Graph Store Port
//!
//! This module defines the `GraphStore` trait that abstracts the property-graph
//! backend the projection is written to. The sync services depend only on this
//! capability set, never on a backend's query language.
//!
//! # Architecture
//!
//! - **Abstraction Point**: Between the sync services and a concrete graph backend
//! - **Multiple Backends**: In-process [`MemoryGraphStore`](crate::db::MemoryGraphStore),
//!   embedded SurrealDB (`surrealdb` feature)
//! - **Merge Semantics**: Nodes are written by `(entity_type, stable_key)`; a
//!   backend never holds two nodes for the same key
//! - **Atomic Batches**: `run_batch` applies every operation or none, so a
//!   node-plus-edges upsert or a cascade delete is never partially visible
//!
//! # Design Decisions
//!
//! 1. **Async-First**: All methods are async; real backends sit behind network I/O
//! 2. **Ownership Semantics**: Write operations take ownership of their payloads
//! 3. **Idempotence**: Creating an existing edge, deleting an absent node or edge,
//!    and re-merging an unchanged node are all successful no-ops
//! 4. **Version Guard**: `MergeNode` carries the source version and the backend
//!    refuses to move a node backwards
//!
//! # Examples
//!
//! ```rust
//! use memgraph_sync_core::db::{GraphOperation, GraphStore, MemoryGraphStore, NodeUpsert};
//! use memgraph_sync_core::models::{EntityType, NodeKey, PropertyMap};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryGraphStore::new();
//! let key = NodeKey::new(EntityType::Fact, "fact-1")?;
//!
//! let outcome = store
//!     .run_batch(vec![GraphOperation::MergeNode(NodeUpsert {
//!         key: key.clone(),
//!         properties: PropertyMap::new(),
//!         source_version: 1,
//!     })])
//!     .await?;
//!
//! assert_eq!(outcome.created_nodes, vec![key]);
//! # Ok(())
//! # }
//! ```

use crate::db::error::GraphError;
use crate::models::{EdgeType, EntityType, GraphEdge, GraphNode, NodeKey, PropertyMap};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Node payload for a merge-by-key write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpsert {
    pub key: NodeKey,
    pub properties: PropertyMap,
    pub source_version: u64,
}

/// Result of merging a single node
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// No node existed for the key
    Created(GraphNode),
    /// Existing node (or stub) was overwritten with the newer version
    Updated(GraphNode),
    /// Stored version is newer or equal; node left untouched
    Stale(GraphNode),
}

impl MergeOutcome {
    pub fn node(&self) -> &GraphNode {
        match self {
            MergeOutcome::Created(node) | MergeOutcome::Updated(node) | MergeOutcome::Stale(node) => {
                node
            }
        }
    }

    pub fn into_node(self) -> GraphNode {
        match self {
            MergeOutcome::Created(node) | MergeOutcome::Updated(node) | MergeOutcome::Stale(node) => {
                node
            }
        }
    }
}

/// Edge lookup filter; `None` fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeFilter {
    pub from: Option<NodeKey>,
    pub to: Option<NodeKey>,
    pub edge_type: Option<EdgeType>,
    pub owner: Option<NodeKey>,
}

impl EdgeFilter {
    pub fn outgoing(from: &NodeKey) -> Self {
        Self {
            from: Some(from.clone()),
            ..Default::default()
        }
    }

    pub fn incoming(to: &NodeKey) -> Self {
        Self {
            to: Some(to.clone()),
            ..Default::default()
        }
    }

    pub fn owned_by(owner: &NodeKey) -> Self {
        Self {
            owner: Some(owner.clone()),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, edge_type: EdgeType) -> Self {
        self.edge_type = Some(edge_type);
        self
    }

    pub fn matches(&self, edge: &GraphEdge) -> bool {
        self.from.as_ref().map_or(true, |k| &edge.from == k)
            && self.to.as_ref().map_or(true, |k| &edge.to == k)
            && self.edge_type.map_or(true, |t| edge.edge_type == t)
            && self.owner.as_ref().map_or(true, |k| &edge.owner == k)
    }
}

/// Traversal direction relative to the start node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Follow edges from `from` to `to`
    Outgoing,
    /// Follow edges backwards, from `to` to `from`
    Incoming,
}

/// A node reached by `traverse`, with its hop distance from the start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalHit {
    pub key: NodeKey,
    pub depth: usize,
}

/// One write inside an atomic batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum GraphOperation {
    /// Merge by key, guarded by source version
    MergeNode(NodeUpsert),
    /// Create a placeholder node if no node exists for the key
    EnsureStub { key: NodeKey, properties: PropertyMap },
    /// Delete the node and every incident edge; absent nodes are skipped
    DeleteNode { key: NodeKey },
    /// Abort the batch with `GraphError::Conflict` if any node outside
    /// `allowed_sources` has an edge into `key`; absent nodes pass
    GuardOrphan {
        key: NodeKey,
        allowed_sources: BTreeSet<NodeKey>,
    },
    CreateEdge { edge: GraphEdge },
    DeleteEdge { edge: GraphEdge },
}

/// What a batch actually changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub created_nodes: Vec<NodeKey>,
    pub updated_nodes: Vec<NodeKey>,
    pub stale_nodes: Vec<NodeKey>,
    pub stubs_created: Vec<NodeKey>,
    /// Only nodes that existed when the batch ran
    pub deleted_nodes: Vec<NodeKey>,
    pub edges_created: usize,
    pub edges_deleted: usize,
}

impl BatchOutcome {
    pub fn is_noop(&self) -> bool {
        self.created_nodes.is_empty()
            && self.updated_nodes.is_empty()
            && self.stubs_created.is_empty()
            && self.deleted_nodes.is_empty()
            && self.edges_created == 0
            && self.edges_deleted == 0
    }
}

/// Abstraction over the property-graph backend
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the worker calls them from many tasks.
///
/// # Method Categories
///
/// - **Nodes**: merge, update, delete, get, find by property, count
/// - **Edges**: create, delete, find
/// - **Traversal**: bounded multi-hop walk in either direction
/// - **Batch**: atomic multi-operation write
#[async_trait]
pub trait GraphStore: Send + Sync {
    //
    // NODE OPERATIONS
    //

    /// Create or merge a node by key
    ///
    /// Returns `MergeOutcome::Stale` without writing when the stored
    /// `last_synced_version` is not older than `upsert.source_version`.
    async fn merge_node(&self, upsert: NodeUpsert) -> Result<MergeOutcome, GraphError>;

    /// Replace a node's properties without touching its version
    ///
    /// # Errors
    ///
    /// `GraphError::NotFound` if no node exists for the key.
    async fn update_node(
        &self,
        key: &NodeKey,
        properties: PropertyMap,
    ) -> Result<GraphNode, GraphError>;

    /// Delete a node and its incident edges; `Ok(false)` when it did not exist
    async fn delete_node(&self, key: &NodeKey) -> Result<bool, GraphError>;

    async fn get_node(&self, key: &NodeKey) -> Result<Option<GraphNode>, GraphError>;

    /// Find nodes whose `property` equals `value`, optionally of one type
    async fn find_nodes(
        &self,
        entity_type: Option<EntityType>,
        property: &str,
        value: &Value,
    ) -> Result<Vec<GraphNode>, GraphError>;

    async fn count_nodes(&self) -> Result<u64, GraphError>;

    //
    // EDGE OPERATIONS
    //

    /// Create an edge; `Ok(false)` when an identical edge already existed
    ///
    /// Both endpoints must exist.
    async fn create_edge(&self, edge: GraphEdge) -> Result<bool, GraphError>;

    /// Delete an edge; `Ok(false)` when it did not exist
    async fn delete_edge(&self, edge: &GraphEdge) -> Result<bool, GraphError>;

    /// Edges matching the filter, in a stable order
    async fn find_edges(&self, filter: EdgeFilter) -> Result<Vec<GraphEdge>, GraphError>;

    //
    // TRAVERSAL
    //

    /// Breadth-first walk from `start`, at most `max_depth` hops
    ///
    /// An empty `edge_types` slice follows every edge type. The start node is
    /// not part of the result. Each node is reported once, at its shortest depth.
    async fn traverse(
        &self,
        start: &NodeKey,
        edge_types: &[EdgeType],
        max_depth: usize,
        direction: Direction,
    ) -> Result<Vec<TraversalHit>, GraphError>;

    //
    // BATCH OPERATIONS
    //

    /// Apply all operations atomically, in order
    async fn run_batch(&self, operations: Vec<GraphOperation>) -> Result<BatchOutcome, GraphError>;
}
