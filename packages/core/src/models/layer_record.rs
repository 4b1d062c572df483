//! Layer Records
//!
//! Typed views of the primary-layer records the engine projects into the graph.
//! Each record knows its merge key, its source version, the scalar property bag
//! its graph node carries, and the relationships embedded in it.
//!
//! | Record         | Derived edges                                                  |
//! |----------------|----------------------------------------------------------------|
//! | Conversation   | `IN_SPACE`, `INVOLVES` (users, agents)                         |
//! | Record         | `IN_SPACE`, `REFERENCES` (source conversation, other records)  |
//! | Fact           | `IN_SPACE`, `REFERENCES`, `MENTIONS` (subject/object), predicate edge |
//! | Context        | `IN_SPACE`, `CHILD_OF` + inverse `PARENT_OF`, `TRIGGERED_BY`, `INVOLVES` |
//! | MemorySpace    | `INVOLVES` (participants)                                      |
//! | Agent, User    | none                                                           |

use crate::models::{
    DesiredEdge, EdgeType, EntityType, NodeKey, PropertyMap, ValidationError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Conversation layer record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub memory_space_id: String,
    pub version: u64,
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub message_count: u64,
    pub title: Option<String>,
}

/// Versioned or key-value record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub record_id: String,
    pub memory_space_id: String,
    pub version: u64,
    /// Short text shown for the node; full content stays in the primary store
    pub summary: Option<String>,
    pub source_conversation_id: Option<String>,
    #[serde(default)]
    pub referenced_record_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Structured fact (subject, predicate, object)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactRecord {
    pub fact_id: String,
    pub memory_space_id: String,
    pub version: u64,
    pub statement: String,
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub object: Option<String>,
    pub confidence: Option<f64>,
    pub source_conversation_id: Option<String>,
}

/// Hierarchical context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    pub context_id: String,
    pub memory_space_id: Option<String>,
    pub version: u64,
    pub purpose: String,
    pub parent_id: Option<String>,
    pub triggering_conversation_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySpaceRecord {
    pub memory_space_id: String,
    pub version: u64,
    pub name: Option<String>,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub agent_id: String,
    pub version: u64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: String,
    pub version: u64,
    pub display_name: Option<String>,
}

/// Any record the engine knows how to project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "camelCase")]
pub enum LayerRecord {
    Conversation(ConversationRecord),
    Record(MemoryRecord),
    Fact(FactRecord),
    Context(ContextRecord),
    MemorySpace(MemorySpaceRecord),
    Agent(AgentRecord),
    User(UserRecord),
}

/// Normalize an extracted entity name into its stable key
///
/// Trims, lowercases and joins inner whitespace with `-`, so "Acme  Corp" and
/// "acme corp" land on the same node.
pub fn normalize_entity_name(name: &str) -> String {
    name.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

fn key(entity_type: EntityType, stable_key: &str) -> Result<NodeKey, ValidationError> {
    NodeKey::new(entity_type, stable_key)
}

fn insert_opt<T: Serialize>(props: &mut PropertyMap, name: &str, value: &Option<T>) {
    if let Some(value) = value {
        props.insert(name.to_string(), json!(value));
    }
}

impl LayerRecord {
    pub fn entity_type(&self) -> EntityType {
        match self {
            LayerRecord::Conversation(_) => EntityType::Conversation,
            LayerRecord::Record(_) => EntityType::Record,
            LayerRecord::Fact(_) => EntityType::Fact,
            LayerRecord::Context(_) => EntityType::Context,
            LayerRecord::MemorySpace(_) => EntityType::MemorySpace,
            LayerRecord::Agent(_) => EntityType::Agent,
            LayerRecord::User(_) => EntityType::User,
        }
    }

    fn stable_key(&self) -> &str {
        match self {
            LayerRecord::Conversation(r) => &r.conversation_id,
            LayerRecord::Record(r) => &r.record_id,
            LayerRecord::Fact(r) => &r.fact_id,
            LayerRecord::Context(r) => &r.context_id,
            LayerRecord::MemorySpace(r) => &r.memory_space_id,
            LayerRecord::Agent(r) => &r.agent_id,
            LayerRecord::User(r) => &r.user_id,
        }
    }

    pub fn key(&self) -> Result<NodeKey, ValidationError> {
        key(self.entity_type(), self.stable_key())
    }

    pub fn version(&self) -> u64 {
        match self {
            LayerRecord::Conversation(r) => r.version,
            LayerRecord::Record(r) => r.version,
            LayerRecord::Fact(r) => r.version,
            LayerRecord::Context(r) => r.version,
            LayerRecord::MemorySpace(r) => r.version,
            LayerRecord::Agent(r) => r.version,
            LayerRecord::User(r) => r.version,
        }
    }

    /// Scalar property bag for the graph node
    pub fn properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        match self {
            LayerRecord::Conversation(r) => {
                props.insert("memorySpaceId".into(), json!(r.memory_space_id));
                props.insert("messageCount".into(), json!(r.message_count));
                insert_opt(&mut props, "title", &r.title);
            }
            LayerRecord::Record(r) => {
                props.insert("memorySpaceId".into(), json!(r.memory_space_id));
                insert_opt(&mut props, "summary", &r.summary);
                if !r.tags.is_empty() {
                    props.insert("tags".into(), json!(r.tags));
                }
            }
            LayerRecord::Fact(r) => {
                props.insert("memorySpaceId".into(), json!(r.memory_space_id));
                props.insert("statement".into(), json!(r.statement));
                insert_opt(&mut props, "subject", &r.subject);
                insert_opt(&mut props, "predicate", &r.predicate);
                insert_opt(&mut props, "object", &r.object);
                insert_opt(&mut props, "confidence", &r.confidence);
            }
            LayerRecord::Context(r) => {
                props.insert("purpose".into(), json!(r.purpose));
                props.insert("depth".into(), json!(r.depth));
                insert_opt(&mut props, "memorySpaceId", &r.memory_space_id);
                insert_opt(&mut props, "status", &r.status);
            }
            LayerRecord::MemorySpace(r) => {
                insert_opt(&mut props, "name", &r.name);
            }
            LayerRecord::Agent(r) => {
                insert_opt(&mut props, "name", &r.name);
            }
            LayerRecord::User(r) => {
                insert_opt(&mut props, "displayName", &r.display_name);
            }
        }
        props
    }

    /// Relationships embedded in this record, as edges owned by its node
    ///
    /// Empty reference ids are rejected rather than silently dropped: they
    /// indicate a malformed record.
    pub fn derive_edges(&self) -> Result<Vec<DesiredEdge>, ValidationError> {
        let owner = self.key()?;
        let mut edges = Vec::new();

        match self {
            LayerRecord::Conversation(r) => {
                edges.push(DesiredEdge::outgoing(
                    &owner,
                    EdgeType::InSpace,
                    key(EntityType::MemorySpace, &r.memory_space_id)?,
                ));
                for user_id in &r.user_ids {
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::Involves,
                        key(EntityType::User, user_id)?,
                    ));
                }
                for agent_id in &r.agent_ids {
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::Involves,
                        key(EntityType::Agent, agent_id)?,
                    ));
                }
            }
            LayerRecord::Record(r) => {
                edges.push(DesiredEdge::outgoing(
                    &owner,
                    EdgeType::InSpace,
                    key(EntityType::MemorySpace, &r.memory_space_id)?,
                ));
                if let Some(conversation_id) = &r.source_conversation_id {
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::References,
                        key(EntityType::Conversation, conversation_id)?,
                    ));
                }
                for record_id in &r.referenced_record_ids {
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::References,
                        key(EntityType::Record, record_id)?,
                    ));
                }
            }
            LayerRecord::Fact(r) => {
                edges.push(DesiredEdge::outgoing(
                    &owner,
                    EdgeType::InSpace,
                    key(EntityType::MemorySpace, &r.memory_space_id)?,
                ));
                if let Some(conversation_id) = &r.source_conversation_id {
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::References,
                        key(EntityType::Conversation, conversation_id)?,
                    ));
                }

                let subject = r
                    .subject
                    .as_deref()
                    .map(|s| key(EntityType::ExtractedEntity, &normalize_entity_name(s)))
                    .transpose()?;
                let object = r
                    .object
                    .as_deref()
                    .map(|o| key(EntityType::ExtractedEntity, &normalize_entity_name(o)))
                    .transpose()?;

                if let Some(subject) = &subject {
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::Mentions,
                        subject.clone(),
                    ));
                }
                if let Some(object) = &object {
                    if subject.as_ref() != Some(object) {
                        edges.push(DesiredEdge::outgoing(
                            &owner,
                            EdgeType::Mentions,
                            object.clone(),
                        ));
                    }
                }
                if let (Some(subject), Some(object)) = (subject, object) {
                    let edge_type = r
                        .predicate
                        .as_deref()
                        .map(EdgeType::from_predicate)
                        .unwrap_or(EdgeType::RelatesTo);
                    edges.push(DesiredEdge {
                        edge_type,
                        from: subject,
                        to: object,
                    });
                }
            }
            LayerRecord::Context(r) => {
                if let Some(space_id) = &r.memory_space_id {
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::InSpace,
                        key(EntityType::MemorySpace, space_id)?,
                    ));
                }
                if let Some(parent_id) = &r.parent_id {
                    let parent = key(EntityType::Context, parent_id)?;
                    if parent == owner {
                        return Err(ValidationError::InvalidRecord(format!(
                            "context '{}' names itself as parent",
                            r.context_id
                        )));
                    }
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::ChildOf,
                        parent.clone(),
                    ));
                    edges.push(DesiredEdge::incoming(&owner, EdgeType::ParentOf, parent));
                }
                if let Some(conversation_id) = &r.triggering_conversation_id {
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::TriggeredBy,
                        key(EntityType::Conversation, conversation_id)?,
                    ));
                }
                if let Some(user_id) = &r.user_id {
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::Involves,
                        key(EntityType::User, user_id)?,
                    ));
                }
            }
            LayerRecord::MemorySpace(r) => {
                for agent_id in &r.agent_ids {
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::Involves,
                        key(EntityType::Agent, agent_id)?,
                    ));
                }
                for user_id in &r.user_ids {
                    edges.push(DesiredEdge::outgoing(
                        &owner,
                        EdgeType::Involves,
                        key(EntityType::User, user_id)?,
                    ));
                }
            }
            LayerRecord::Agent(_) | LayerRecord::User(_) => {}
        }

        edges.sort();
        edges.dedup();
        Ok(edges)
    }

    /// Minimal properties for a stub created as the target of one of our edges
    pub fn stub_properties(target: &NodeKey) -> PropertyMap {
        let mut props = PropertyMap::new();
        if target.entity_type == EntityType::ExtractedEntity {
            props.insert("name".to_string(), Value::String(target.stable_key.clone()));
        }
        props
    }
}
