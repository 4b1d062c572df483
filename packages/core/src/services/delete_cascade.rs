//! Delete Cascader
//!
//! Deletes a node together with everything that only it (directly or through
//! other orphans) was keeping reachable. The node, its orphans and all their
//! incident edges go in one atomic batch: either the whole cascade is applied
//! or none of it is, and a failed cascade is retried from scratch.
//!
//! Orphan detection reads the graph before the batch is submitted, so a writer
//! can add a reference to an orphan in between. The batch therefore opens with
//! a `GuardOrphan` check per orphan, evaluated inside the batch: if any orphan
//! gained a source outside the deletion, the batch aborts with a transient
//! `SyncError::Conflict` and the retry re-runs detection on the new graph.

use crate::config::OrphanDetectorConfig;
use crate::db::{GraphOperation, GraphStore};
use crate::models::{EntityType, NodeKey};
use crate::services::error::SyncError;
use crate::services::orphan_detector::OrphanDetector;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Outcome of a cascading delete
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CascadeResult {
    /// Keys removed from the graph, the target included
    pub deleted_keys: BTreeSet<NodeKey>,
    /// Nodes removed because they lost their last anchor
    pub orphan_count: usize,
    /// Orphan detection hit its depth bound; some nodes may have been kept
    pub depth_limited: bool,
}

impl CascadeResult {
    pub fn is_empty(&self) -> bool {
        self.deleted_keys.is_empty()
    }
}

pub struct DeleteCascader {
    store: Arc<dyn GraphStore>,
    detector: OrphanDetector,
}

impl DeleteCascader {
    pub fn new(store: Arc<dyn GraphStore>, config: OrphanDetectorConfig) -> Self {
        let detector = OrphanDetector::new(store.clone(), config);
        Self { store, detector }
    }

    pub fn detector(&self) -> &OrphanDetector {
        &self.detector
    }

    /// Delete one entity's node and its orphans
    ///
    /// A target that is not in the graph yields an empty result.
    ///
    /// # Errors
    ///
    /// - `SyncError::InvalidEntity` for an empty key
    /// - `SyncError::BackendUnavailable` / `SyncError::Timeout` when detection
    ///   or the delete batch fails; nothing has been deleted in that case
    /// - `SyncError::Conflict` when an orphan gained a reference after
    ///   detection; nothing has been deleted in that case
    pub async fn delete_with_cascade(
        &self,
        stable_key: &str,
        entity_type: EntityType,
    ) -> Result<CascadeResult, SyncError> {
        let target = NodeKey::new(entity_type, stable_key)?;
        self.delete_key(&target).await
    }

    /// Same as [`delete_with_cascade`](Self::delete_with_cascade) for a parsed key
    pub async fn delete_key(&self, target: &NodeKey) -> Result<CascadeResult, SyncError> {
        if self.store.get_node(target).await?.is_none() {
            tracing::debug!(key = %target, "Delete target not in graph; nothing to cascade");
            return Ok(CascadeResult::default());
        }

        let deletion_set = BTreeSet::from([target.clone()]);
        let report = self.detector.find_orphans(&deletion_set).await?;

        let removal_set: BTreeSet<NodeKey> =
            deletion_set.union(&report.orphans).cloned().collect();
        let operations: Vec<GraphOperation> = report
            .orphans
            .iter()
            .map(|key| GraphOperation::GuardOrphan {
                key: key.clone(),
                allowed_sources: removal_set.clone(),
            })
            .chain(
                removal_set
                    .iter()
                    .map(|key| GraphOperation::DeleteNode { key: key.clone() }),
            )
            .collect();

        let outcome = match self.store.run_batch(operations).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = SyncError::from(e);
                if matches!(err, SyncError::Conflict(_)) {
                    tracing::warn!(
                        key = %target,
                        "Cascade aborted, graph changed since detection: {}",
                        err
                    );
                }
                return Err(err);
            }
        };
        let deleted_keys: BTreeSet<NodeKey> = outcome.deleted_nodes.into_iter().collect();
        let orphan_count = deleted_keys
            .iter()
            .filter(|key| report.orphans.contains(*key))
            .count();

        tracing::info!(
            key = %target,
            deleted = deleted_keys.len(),
            orphans = orphan_count,
            edges = outcome.edges_deleted,
            depth_limited = report.depth_limited,
            "Cascade delete applied"
        );

        Ok(CascadeResult {
            deleted_keys,
            orphan_count,
            depth_limited: report.depth_limited,
        })
    }
}
