//! Relationship Synchronizer
//!
//! Makes the edges owned by a node match the relationships its source record
//! currently encodes. Only edges whose `owner` is the node are touched, so two
//! records never fight over each other's edges.
//!
//! Missing edge targets are created as stubs (`is_stub = true`) and enriched
//! later by their own sync item.

use crate::db::{EdgeFilter, GraphOperation, GraphStore};
use crate::models::{DesiredEdge, GraphEdge, LayerRecord, NodeKey};
use crate::services::error::SyncError;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Edge changes for one node, before execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgePlan {
    pub to_create: Vec<GraphEdge>,
    pub to_delete: Vec<GraphEdge>,
    /// Endpoints other than the owner that must exist before edges are created
    pub stub_targets: Vec<NodeKey>,
}

impl EdgePlan {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }

    /// Batch operations: deletes, then stubs, then creates
    pub fn into_operations(self) -> Vec<GraphOperation> {
        let mut operations =
            Vec::with_capacity(self.to_delete.len() + self.stub_targets.len() + self.to_create.len());
        operations.extend(
            self.to_delete
                .into_iter()
                .map(|edge| GraphOperation::DeleteEdge { edge }),
        );
        operations.extend(self.stub_targets.into_iter().map(|key| {
            let properties = LayerRecord::stub_properties(&key);
            GraphOperation::EnsureStub { key, properties }
        }));
        operations.extend(
            self.to_create
                .into_iter()
                .map(|edge| GraphOperation::CreateEdge { edge }),
        );
        operations
    }
}

/// Result of an executed reconciliation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeReconciliation {
    pub created: usize,
    pub deleted: usize,
    pub stubs_created: Vec<NodeKey>,
}

pub struct RelationshipSynchronizer {
    store: Arc<dyn GraphStore>,
}

impl RelationshipSynchronizer {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Diff the desired edges of `node` against the edges it owns
    pub async fn plan(
        &self,
        node: &NodeKey,
        desired: Vec<DesiredEdge>,
    ) -> Result<EdgePlan, SyncError> {
        let current: BTreeSet<GraphEdge> = self
            .store
            .find_edges(EdgeFilter::owned_by(node))
            .await?
            .into_iter()
            .collect();
        let desired: BTreeSet<GraphEdge> = desired
            .into_iter()
            .map(|edge| edge.into_edge(node))
            .collect();

        let to_create: Vec<GraphEdge> = desired.difference(&current).cloned().collect();
        let to_delete: Vec<GraphEdge> = current.difference(&desired).cloned().collect();

        let stub_targets: BTreeSet<NodeKey> = to_create
            .iter()
            .flat_map(|edge| [&edge.from, &edge.to])
            .filter(|endpoint| *endpoint != node)
            .cloned()
            .collect();

        Ok(EdgePlan {
            to_create,
            to_delete,
            stub_targets: stub_targets.into_iter().collect(),
        })
    }

    /// Create missing edges and delete stale ones, atomically
    ///
    /// `node` must already exist in the graph.
    pub async fn reconcile_edges(
        &self,
        node: &NodeKey,
        desired: Vec<DesiredEdge>,
    ) -> Result<EdgeReconciliation, SyncError> {
        let plan = self.plan(node, desired).await?;
        if plan.is_empty() {
            return Ok(EdgeReconciliation::default());
        }

        let outcome = self.store.run_batch(plan.into_operations()).await?;
        tracing::debug!(
            key = %node,
            created = outcome.edges_created,
            deleted = outcome.edges_deleted,
            stubs = outcome.stubs_created.len(),
            "Reconciled edges"
        );

        Ok(EdgeReconciliation {
            created: outcome.edges_created,
            deleted: outcome.edges_deleted,
            stubs_created: outcome.stubs_created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryGraphStore, NodeUpsert};
    use crate::models::{EdgeType, EntityType, PropertyMap};

    fn fact(id: &str) -> NodeKey {
        NodeKey::new(EntityType::Fact, id).unwrap()
    }

    fn entity(name: &str) -> NodeKey {
        NodeKey::new(EntityType::ExtractedEntity, name).unwrap()
    }

    async fn setup() -> (RelationshipSynchronizer, Arc<MemoryGraphStore>) {
        let store = Arc::new(MemoryGraphStore::new());
        store
            .merge_node(NodeUpsert {
                key: fact("f1"),
                properties: PropertyMap::new(),
                source_version: 1,
            })
            .await
            .unwrap();
        (RelationshipSynchronizer::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_missing_targets_become_stubs() {
        let (sync, store) = setup().await;
        let desired = vec![DesiredEdge::outgoing(&fact("f1"), EdgeType::Mentions, entity("acme"))];

        let result = sync.reconcile_edges(&fact("f1"), desired).await.unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(result.stubs_created, vec![entity("acme")]);

        let stub = store.get_node(&entity("acme")).await.unwrap().unwrap();
        assert!(stub.is_stub);
        assert_eq!(stub.properties["name"], "acme");
    }

    #[tokio::test]
    async fn test_reconcile_replaces_stale_edges_and_is_idempotent() {
        let (sync, store) = setup().await;
        let first = vec![
            DesiredEdge::outgoing(&fact("f1"), EdgeType::Mentions, entity("acme")),
            DesiredEdge::outgoing(&fact("f1"), EdgeType::Mentions, entity("bob")),
        ];
        sync.reconcile_edges(&fact("f1"), first).await.unwrap();

        let second = vec![DesiredEdge::outgoing(&fact("f1"), EdgeType::Mentions, entity("bob"))];
        let result = sync
            .reconcile_edges(&fact("f1"), second.clone())
            .await
            .unwrap();
        assert_eq!(result.created, 0);
        assert_eq!(result.deleted, 1);

        let again = sync.reconcile_edges(&fact("f1"), second).await.unwrap();
        assert_eq!(again, EdgeReconciliation::default());

        let edges = store
            .find_edges(EdgeFilter::owned_by(&fact("f1")))
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to, entity("bob"));
    }

    #[tokio::test]
    async fn test_edges_owned_by_others_are_left_alone() {
        let (sync, store) = setup().await;
        store
            .merge_node(NodeUpsert {
                key: fact("f2"),
                properties: PropertyMap::new(),
                source_version: 1,
            })
            .await
            .unwrap();
        let foreign = GraphEdge::new(EdgeType::References, fact("f2"), fact("f1"), fact("f2"));
        store.create_edge(foreign.clone()).await.unwrap();

        sync.reconcile_edges(&fact("f1"), Vec::new()).await.unwrap();

        let incoming = store
            .find_edges(EdgeFilter::incoming(&fact("f1")))
            .await
            .unwrap();
        assert_eq!(incoming, vec![foreign]);
    }

    #[tokio::test]
    async fn test_plan_orders_operations() {
        let (sync, store) = setup().await;
        store
            .create_edge(GraphEdge::new(
                EdgeType::References,
                fact("f1"),
                fact("f1"),
                fact("f1"),
            ))
            .await
            .unwrap();

        let plan = sync
            .plan(
                &fact("f1"),
                vec![DesiredEdge::outgoing(&fact("f1"), EdgeType::Mentions, entity("acme"))],
            )
            .await
            .unwrap();
        let ops = plan.into_operations();

        assert!(matches!(ops[0], GraphOperation::DeleteEdge { .. }));
        assert!(matches!(ops[1], GraphOperation::EnsureStub { .. }));
        assert!(matches!(ops[2], GraphOperation::CreateEdge { .. }));
    }
}
