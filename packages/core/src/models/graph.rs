//! Graph Projection Data Structures
//!
//! This module defines the node and edge types of the derived property graph:
//!
//! - [`EntityType`] / [`NodeKey`] - merge identity of a graph node
//! - [`GraphNode`] / [`NodeHandle`] - a projected node and the handle returned by upserts
//! - [`EdgeType`] / [`GraphEdge`] / [`DesiredEdge`] - derived, directed relationships
//!
//! # Identity
//!
//! At most one node exists per `(entity_type, stable_key)` pair. Every write is a
//! merge keyed on that pair, never a blind create.
//!
//! # Examples
//!
//! ```rust
//! use memgraph_sync_core::models::{EdgeType, EntityType, GraphEdge, NodeKey};
//!
//! let child = NodeKey::new(EntityType::Context, "ctx-child").unwrap();
//! let root = NodeKey::new(EntityType::Context, "ctx-root").unwrap();
//!
//! let edge = GraphEdge::new(EdgeType::ChildOf, child.clone(), root, child);
//! assert_eq!(edge.to_string(), "Context:ctx-child -[CHILD_OF]-> Context:ctx-root");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Property bag stored on a graph node
pub type PropertyMap = Map<String, Value>;

/// Property names owned by the graph backend; records may not set them
pub const RESERVED_PROPERTIES: &[&str] = &["id", "_key", "_type"];

/// Validation errors for graph identities and records
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Stable key must not be empty for {0}")]
    EmptyKey(EntityType),

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Unknown edge type: {0}")]
    UnknownEdgeType(String),

    #[error("Property '{0}' is reserved by the graph backend")]
    ReservedProperty(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Kind of entity projected into the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Conversation,
    Record,
    Fact,
    Context,
    ExtractedEntity,
    MemorySpace,
    Agent,
    User,
}

impl EntityType {
    /// All entity types, in declaration order
    pub const ALL: [EntityType; 8] = [
        EntityType::Conversation,
        EntityType::Record,
        EntityType::Fact,
        EntityType::Context,
        EntityType::ExtractedEntity,
        EntityType::MemorySpace,
        EntityType::Agent,
        EntityType::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Conversation => "Conversation",
            EntityType::Record => "Record",
            EntityType::Fact => "Fact",
            EntityType::Context => "Context",
            EntityType::ExtractedEntity => "ExtractedEntity",
            EntityType::MemorySpace => "MemorySpace",
            EntityType::Agent => "Agent",
            EntityType::User => "User",
        }
    }

    /// Lifecycle owners that only leave the graph through their own delete.
    ///
    /// Cascades never remove these, even when nothing else points at them.
    pub fn is_anchor_type(&self) -> bool {
        matches!(
            self,
            EntityType::MemorySpace | EntityType::Agent | EntityType::User
        )
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownEntityType(s.to_string()))
    }
}

/// Merge identity of a graph node: `(entity_type, stable_key)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeKey {
    pub entity_type: EntityType,
    pub stable_key: String,
}

impl NodeKey {
    /// Create a key, rejecting empty (or whitespace-only) stable keys
    pub fn new(
        entity_type: EntityType,
        stable_key: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let stable_key = stable_key.into();
        if stable_key.trim().is_empty() {
            return Err(ValidationError::EmptyKey(entity_type));
        }
        Ok(Self {
            entity_type,
            stable_key,
        })
    }

    /// Parse the `Type:key` form produced by `Display`
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let (entity_type, stable_key) = s
            .split_once(':')
            .ok_or_else(|| ValidationError::InvalidRecord(format!("malformed node key '{s}'")))?;
        NodeKey::new(entity_type.parse()?, stable_key)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.stable_key)
    }
}

/// A node of the projected graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Opaque handle assigned by the backend
    pub graph_id: String,

    pub key: NodeKey,

    pub properties: PropertyMap,

    /// Source version of the last applied upsert (0 for stubs)
    pub last_synced_version: u64,

    /// Placeholder created for an edge target before its own sync item ran
    pub is_stub: bool,

    pub synced_at: DateTime<Utc>,
}

impl GraphNode {
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            graph_id: self.graph_id.clone(),
            key: self.key.clone(),
        }
    }
}

/// Returned by upserts; identifies a node without carrying its properties
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHandle {
    pub graph_id: String,
    pub key: NodeKey,
}

/// Relationship kinds derived from layer records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    ParentOf,
    ChildOf,
    InSpace,
    Mentions,
    Involves,
    TriggeredBy,
    References,
    WorksAt,
    Knows,
    Uses,
    RelatesTo,
}

impl EdgeType {
    pub const ALL: [EdgeType; 11] = [
        EdgeType::ParentOf,
        EdgeType::ChildOf,
        EdgeType::InSpace,
        EdgeType::Mentions,
        EdgeType::Involves,
        EdgeType::TriggeredBy,
        EdgeType::References,
        EdgeType::WorksAt,
        EdgeType::Knows,
        EdgeType::Uses,
        EdgeType::RelatesTo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::ParentOf => "PARENT_OF",
            EdgeType::ChildOf => "CHILD_OF",
            EdgeType::InSpace => "IN_SPACE",
            EdgeType::Mentions => "MENTIONS",
            EdgeType::Involves => "INVOLVES",
            EdgeType::TriggeredBy => "TRIGGERED_BY",
            EdgeType::References => "REFERENCES",
            EdgeType::WorksAt => "WORKS_AT",
            EdgeType::Knows => "KNOWS",
            EdgeType::Uses => "USES",
            EdgeType::RelatesTo => "RELATES_TO",
        }
    }

    /// Whether deleting the source of this edge may orphan its target
    ///
    /// Containment and mention edges point from the owner to what it brought
    /// into the graph. Back-references (`CHILD_OF`, `TRIGGERED_BY`), scoping
    /// edges and provenance `REFERENCES` point at nodes that exist on their
    /// own, so a cascade never walks them.
    pub fn cascades(&self) -> bool {
        match self {
            EdgeType::ParentOf
            | EdgeType::Mentions
            | EdgeType::WorksAt
            | EdgeType::Knows
            | EdgeType::Uses
            | EdgeType::RelatesTo => true,
            EdgeType::ChildOf
            | EdgeType::InSpace
            | EdgeType::Involves
            | EdgeType::TriggeredBy
            | EdgeType::References => false,
        }
    }

    /// Map a free-text fact predicate onto a typed edge
    ///
    /// Unrecognised predicates become `RELATES_TO`.
    pub fn from_predicate(predicate: &str) -> Self {
        let normalized: String = predicate
            .trim()
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_");

        match normalized.as_str() {
            "works_at" | "works_for" | "employed_by" => EdgeType::WorksAt,
            "knows" | "is_friends_with" => EdgeType::Knows,
            "uses" | "prefers" => EdgeType::Uses,
            _ => EdgeType::RelatesTo,
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EdgeType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownEdgeType(s.to_string()))
    }
}

/// A directed edge in the projected graph
///
/// `owner` is the node whose source record encodes the reference. Edges are
/// derived: reconciliation of the owner removes the edge once the record stops
/// encoding it. The owner is usually `from`, except for inverse edges such as
/// `PARENT_OF`, which a child context derives for its parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub edge_type: EdgeType,
    pub from: NodeKey,
    pub to: NodeKey,
    pub owner: NodeKey,
}

impl GraphEdge {
    pub fn new(edge_type: EdgeType, from: NodeKey, to: NodeKey, owner: NodeKey) -> Self {
        Self {
            edge_type,
            from,
            to,
            owner,
        }
    }

    /// The endpoint that is not the owner (the node an edge may need a stub for)
    pub fn counterpart(&self) -> &NodeKey {
        if self.from == self.owner {
            &self.to
        } else {
            &self.from
        }
    }
}

impl fmt::Display for GraphEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.from, self.edge_type, self.to)
    }
}

/// An edge a record wants to exist, before the owner is attached
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredEdge {
    pub edge_type: EdgeType,
    pub from: NodeKey,
    pub to: NodeKey,
}

impl DesiredEdge {
    /// `owner -[edge_type]-> to`
    pub fn outgoing(owner: &NodeKey, edge_type: EdgeType, to: NodeKey) -> Self {
        Self {
            edge_type,
            from: owner.clone(),
            to,
        }
    }

    /// `from -[edge_type]-> owner`
    pub fn incoming(owner: &NodeKey, edge_type: EdgeType, from: NodeKey) -> Self {
        Self {
            edge_type,
            from,
            to: owner.clone(),
        }
    }

    pub fn into_edge(self, owner: &NodeKey) -> GraphEdge {
        GraphEdge::new(self.edge_type, self.from, self.to, owner.clone())
    }
}

/// Reject property bags that collide with backend identity fields
pub fn validate_properties(properties: &PropertyMap) -> Result<(), ValidationError> {
    match RESERVED_PROPERTIES
        .iter()
        .find(|reserved| properties.contains_key(**reserved))
    {
        Some(reserved) => Err(ValidationError::ReservedProperty(reserved.to_string())),
        None => Ok(()),
    }
}
