//! Deadline decorator for Graph Store Port adapters
//!
//! Every port call is bounded by `tokio::time::timeout`. An elapsed call is
//! reported as `GraphError::Timeout`, which the worker treats as transient.
//! Dropping the timed-out future cancels the call; adapters with atomic
//! batches never leave a half-applied batch behind.

use crate::db::error::GraphError;
use crate::db::graph_store::{
    BatchOutcome, Direction, EdgeFilter, GraphOperation, GraphStore, MergeOutcome, NodeUpsert,
    TraversalHit,
};
use crate::models::{EdgeType, EntityType, GraphEdge, GraphNode, NodeKey, PropertyMap};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Wraps another `GraphStore` and applies a per-call deadline
pub struct TimeoutGraphStore<G: ?Sized> {
    inner: Arc<G>,
    limit: Duration,
}

impl<G: GraphStore + ?Sized> TimeoutGraphStore<G> {
    pub fn new(inner: Arc<G>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn inner(&self) -> &Arc<G> {
        &self.inner
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, GraphError>>,
    ) -> Result<T, GraphError> {
        match tokio::time::timeout(self.limit, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    operation,
                    after_ms = self.limit.as_millis() as u64,
                    "Graph call timed out"
                );
                Err(GraphError::Timeout {
                    operation,
                    after: self.limit,
                })
            }
        }
    }
}

#[async_trait]
impl<G: GraphStore + ?Sized> GraphStore for TimeoutGraphStore<G> {
    async fn merge_node(&self, upsert: NodeUpsert) -> Result<MergeOutcome, GraphError> {
        self.bounded("merge_node", self.inner.merge_node(upsert)).await
    }

    async fn update_node(
        &self,
        key: &NodeKey,
        properties: PropertyMap,
    ) -> Result<GraphNode, GraphError> {
        self.bounded("update_node", self.inner.update_node(key, properties))
            .await
    }

    async fn delete_node(&self, key: &NodeKey) -> Result<bool, GraphError> {
        self.bounded("delete_node", self.inner.delete_node(key)).await
    }

    async fn get_node(&self, key: &NodeKey) -> Result<Option<GraphNode>, GraphError> {
        self.bounded("get_node", self.inner.get_node(key)).await
    }

    async fn find_nodes(
        &self,
        entity_type: Option<EntityType>,
        property: &str,
        value: &Value,
    ) -> Result<Vec<GraphNode>, GraphError> {
        self.bounded(
            "find_nodes",
            self.inner.find_nodes(entity_type, property, value),
        )
        .await
    }

    async fn count_nodes(&self) -> Result<u64, GraphError> {
        self.bounded("count_nodes", self.inner.count_nodes()).await
    }

    async fn create_edge(&self, edge: GraphEdge) -> Result<bool, GraphError> {
        self.bounded("create_edge", self.inner.create_edge(edge)).await
    }

    async fn delete_edge(&self, edge: &GraphEdge) -> Result<bool, GraphError> {
        self.bounded("delete_edge", self.inner.delete_edge(edge)).await
    }

    async fn find_edges(&self, filter: EdgeFilter) -> Result<Vec<GraphEdge>, GraphError> {
        self.bounded("find_edges", self.inner.find_edges(filter)).await
    }

    async fn traverse(
        &self,
        start: &NodeKey,
        edge_types: &[EdgeType],
        max_depth: usize,
        direction: Direction,
    ) -> Result<Vec<TraversalHit>, GraphError> {
        self.bounded(
            "traverse",
            self.inner.traverse(start, edge_types, max_depth, direction),
        )
        .await
    }

    async fn run_batch(&self, operations: Vec<GraphOperation>) -> Result<BatchOutcome, GraphError> {
        self.bounded("run_batch", self.inner.run_batch(operations))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryGraphStore;

    #[tokio::test]
    async fn test_slow_backend_times_out_as_transient() {
        let memory = Arc::new(MemoryGraphStore::new());
        memory.set_latency(Duration::from_millis(200));
        let store = TimeoutGraphStore::new(memory, Duration::from_millis(20));

        let err = store.count_nodes().await.unwrap_err();
        assert!(matches!(
            err,
            GraphError::Timeout {
                operation: "count_nodes",
                ..
            }
        ));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fast_calls_pass_through() {
        let memory = Arc::new(MemoryGraphStore::new());
        let store = TimeoutGraphStore::new(memory.clone(), Duration::from_secs(1));

        let key = NodeKey::new(EntityType::Agent, "agent-1").unwrap();
        store
            .merge_node(NodeUpsert {
                key: key.clone(),
                properties: PropertyMap::new(),
                source_version: 1,
            })
            .await
            .unwrap();

        assert!(memory.get_node(&key).await.unwrap().is_some());
        assert_eq!(store.count_nodes().await.unwrap(), 1);
    }
}
