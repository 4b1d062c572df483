//! Entity Synchronizer
//!
//! Projects one primary-layer entity into exactly one graph node, keyed by
//! `(entity_type, stable_key)`.
//!
//! Writes are version-guarded: a node only moves forward. Replaying an item
//! at the version already applied is a no-op for the node, and an older version
//! never overwrites a newer one. This is what makes at-least-once delivery from
//! the queue safe.

use crate::db::{GraphOperation, GraphStore, MergeOutcome, NodeUpsert};
use crate::models::{validate_properties, EntityType, NodeHandle, NodeKey, PropertyMap};
use crate::services::error::SyncError;
use std::sync::Arc;

/// What an upsert will do relative to the stored node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertDisposition {
    /// No node exists yet
    Created,
    /// A stub or an older version will be overwritten
    Updated,
    /// The stored node already carries this version
    Replay,
    /// The stored node is newer; nothing may be written
    Stale,
}

impl UpsertDisposition {
    /// Whether derived edges should be reconciled after this upsert
    ///
    /// Replays still reconcile so a retried item finishes its edge work.
    pub fn reconciles_edges(&self) -> bool {
        !matches!(self, UpsertDisposition::Stale)
    }
}

/// A planned upsert, ready to be combined with edge operations in one batch
#[derive(Debug, Clone)]
pub struct UpsertPlan {
    /// Current handle of the node; empty `graph_id` until the batch creates it
    pub handle: NodeHandle,
    pub operation: Option<GraphOperation>,
    pub disposition: UpsertDisposition,
}

pub struct EntitySynchronizer {
    store: Arc<dyn GraphStore>,
}

impl EntitySynchronizer {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Create or update the node for an entity
    ///
    /// Stale writes (`source_version` not newer than the stored version)
    /// return the existing handle without writing.
    ///
    /// # Errors
    ///
    /// - `SyncError::InvalidEntity` for an empty key or reserved property names
    /// - `SyncError::BackendUnavailable` / `SyncError::Timeout` from the backend
    pub async fn upsert(
        &self,
        entity_type: EntityType,
        stable_key: &str,
        properties: PropertyMap,
        source_version: u64,
    ) -> Result<NodeHandle, SyncError> {
        let key = NodeKey::new(entity_type, stable_key)?;
        validate_properties(&properties)?;

        let outcome = self
            .store
            .merge_node(NodeUpsert {
                key,
                properties,
                source_version,
            })
            .await?;

        if let MergeOutcome::Stale(node) = &outcome {
            tracing::debug!(
                key = %node.key,
                stored_version = node.last_synced_version,
                source_version,
                "Skipping stale upsert"
            );
        }
        Ok(outcome.into_node().handle())
    }

    /// Decide what an upsert would do, without writing
    ///
    /// The returned operation (if any) is meant to go into the same
    /// `run_batch` call as the node's edge reconciliation.
    pub async fn plan_upsert(
        &self,
        key: &NodeKey,
        properties: PropertyMap,
        source_version: u64,
    ) -> Result<UpsertPlan, SyncError> {
        validate_properties(&properties)?;

        let existing = self.store.get_node(key).await?;
        let disposition = match &existing {
            None => UpsertDisposition::Created,
            Some(node) if node.is_stub => UpsertDisposition::Updated,
            Some(node) if source_version > node.last_synced_version => UpsertDisposition::Updated,
            Some(node) if source_version == node.last_synced_version => UpsertDisposition::Replay,
            Some(_) => UpsertDisposition::Stale,
        };

        let handle = match &existing {
            Some(node) => node.handle(),
            None => NodeHandle {
                graph_id: String::new(),
                key: key.clone(),
            },
        };

        let operation = match disposition {
            UpsertDisposition::Created | UpsertDisposition::Updated => {
                Some(GraphOperation::MergeNode(NodeUpsert {
                    key: key.clone(),
                    properties,
                    source_version,
                }))
            }
            UpsertDisposition::Replay | UpsertDisposition::Stale => None,
        };

        Ok(UpsertPlan {
            handle,
            operation,
            disposition,
        })
    }
}
