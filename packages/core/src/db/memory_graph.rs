//! MemoryGraphStore - In-Process Graph Store Port Adapter
//!
//! Keeps the whole projection in memory behind a single `RwLock`. Used by the
//! test suite and the dev daemon, and as the reference behaviour for other
//! adapters.
//!
//! Batches are applied to a cloned working copy that replaces the live state
//! only when every operation succeeded, so readers never see a partial batch.
//!
//! `fail_next`, `fail_next_batches` and `set_latency` let tests simulate an unreachable or slow
//! backend without a network. `interleave_before_next_batch` commits a batch
//! of its own right before the next one, the way a concurrent writer would.

use crate::db::error::GraphError;
use crate::db::graph_store::{
    BatchOutcome, Direction, EdgeFilter, GraphOperation, GraphStore, MergeOutcome, NodeUpsert,
    TraversalHit,
};
use crate::models::{EdgeType, EntityType, GraphEdge, GraphNode, NodeKey, PropertyMap};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct GraphState {
    nodes: BTreeMap<NodeKey, GraphNode>,
    outgoing: BTreeMap<NodeKey, BTreeSet<GraphEdge>>,
    incoming: BTreeMap<NodeKey, BTreeSet<GraphEdge>>,
    edge_count: usize,
}

impl GraphState {
    fn merge(&mut self, upsert: NodeUpsert) -> MergeOutcome {
        let now = Utc::now();
        match self.nodes.get_mut(&upsert.key) {
            Some(existing)
                if existing.is_stub || upsert.source_version > existing.last_synced_version =>
            {
                existing.properties = upsert.properties;
                existing.last_synced_version = upsert.source_version;
                existing.is_stub = false;
                existing.synced_at = now;
                MergeOutcome::Updated(existing.clone())
            }
            Some(existing) => MergeOutcome::Stale(existing.clone()),
            None => {
                let node = GraphNode {
                    graph_id: Uuid::new_v4().to_string(),
                    key: upsert.key.clone(),
                    properties: upsert.properties,
                    last_synced_version: upsert.source_version,
                    is_stub: false,
                    synced_at: now,
                };
                self.nodes.insert(upsert.key, node.clone());
                MergeOutcome::Created(node)
            }
        }
    }

    fn ensure_stub(&mut self, key: NodeKey, properties: PropertyMap) -> bool {
        if self.nodes.contains_key(&key) {
            return false;
        }
        let node = GraphNode {
            graph_id: Uuid::new_v4().to_string(),
            key: key.clone(),
            properties,
            last_synced_version: 0,
            is_stub: true,
            synced_at: Utc::now(),
        };
        self.nodes.insert(key, node);
        true
    }

    fn update(&mut self, key: &NodeKey, properties: PropertyMap) -> Result<GraphNode, GraphError> {
        let node = self
            .nodes
            .get_mut(key)
            .ok_or_else(|| GraphError::not_found(key.to_string()))?;
        node.properties = properties;
        node.synced_at = Utc::now();
        Ok(node.clone())
    }

    fn delete_node(&mut self, key: &NodeKey) -> (bool, usize) {
        if self.nodes.remove(key).is_none() {
            return (false, 0);
        }

        // Self-loops sit in both index sets; the BTreeSet counts them once
        let mut incident: BTreeSet<GraphEdge> = self.outgoing.remove(key).unwrap_or_default();
        incident.extend(self.incoming.remove(key).unwrap_or_default());

        for edge in &incident {
            if let Some(set) = self.incoming.get_mut(&edge.to) {
                set.remove(edge);
            }
            if let Some(set) = self.outgoing.get_mut(&edge.from) {
                set.remove(edge);
            }
        }
        self.edge_count = self.edge_count.saturating_sub(incident.len());
        (true, incident.len())
    }

    fn create_edge(&mut self, edge: GraphEdge) -> Result<bool, GraphError> {
        for endpoint in [&edge.from, &edge.to] {
            if !self.nodes.contains_key(endpoint) {
                return Err(GraphError::invalid_node(format!(
                    "edge {} references missing node {}",
                    edge, endpoint
                )));
            }
        }
        let inserted = self
            .outgoing
            .entry(edge.from.clone())
            .or_default()
            .insert(edge.clone());
        if inserted {
            self.incoming.entry(edge.to.clone()).or_default().insert(edge);
            self.edge_count += 1;
        }
        Ok(inserted)
    }

    fn delete_edge(&mut self, edge: &GraphEdge) -> bool {
        let removed = self
            .outgoing
            .get_mut(&edge.from)
            .map_or(false, |set| set.remove(edge));
        if removed {
            if let Some(set) = self.incoming.get_mut(&edge.to) {
                set.remove(edge);
            }
            self.edge_count = self.edge_count.saturating_sub(1);
        }
        removed
    }

    fn guard_orphan(
        &self,
        key: &NodeKey,
        allowed_sources: &BTreeSet<NodeKey>,
    ) -> Result<(), GraphError> {
        let intruder = self
            .incoming
            .get(key)
            .into_iter()
            .flatten()
            .find(|edge| !allowed_sources.contains(&edge.from));
        match intruder {
            Some(edge) => Err(GraphError::conflict(format!(
                "{} is still referenced by {}",
                key, edge
            ))),
            None => Ok(()),
        }
    }

    fn find_edges(&self, filter: &EdgeFilter) -> Vec<GraphEdge> {
        let candidates: Box<dyn Iterator<Item = &GraphEdge>> = match (&filter.from, &filter.to) {
            (Some(from), _) => Box::new(self.outgoing.get(from).into_iter().flatten()),
            (None, Some(to)) => Box::new(self.incoming.get(to).into_iter().flatten()),
            (None, None) => Box::new(self.outgoing.values().flatten()),
        };
        candidates.filter(|e| filter.matches(e)).cloned().collect()
    }

    fn apply(&mut self, operation: GraphOperation, outcome: &mut BatchOutcome) -> Result<(), GraphError> {
        match operation {
            GraphOperation::MergeNode(upsert) => match self.merge(upsert) {
                MergeOutcome::Created(node) => outcome.created_nodes.push(node.key),
                MergeOutcome::Updated(node) => outcome.updated_nodes.push(node.key),
                MergeOutcome::Stale(node) => outcome.stale_nodes.push(node.key),
            },
            GraphOperation::EnsureStub { key, properties } => {
                if self.ensure_stub(key.clone(), properties) {
                    outcome.stubs_created.push(key);
                }
            }
            GraphOperation::DeleteNode { key } => {
                let (existed, edges_removed) = self.delete_node(&key);
                if existed {
                    outcome.deleted_nodes.push(key);
                    outcome.edges_deleted += edges_removed;
                }
            }
            GraphOperation::GuardOrphan {
                key,
                allowed_sources,
            } => self.guard_orphan(&key, &allowed_sources)?,
            GraphOperation::CreateEdge { edge } => {
                if self.create_edge(edge)? {
                    outcome.edges_created += 1;
                }
            }
            GraphOperation::DeleteEdge { edge } => {
                if self.delete_edge(&edge) {
                    outcome.edges_deleted += 1;
                }
            }
        }
        Ok(())
    }
}

fn consume(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory Graph Store Port adapter
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    state: RwLock<GraphState>,
    fail_next: AtomicUsize,
    fail_batches: AtomicUsize,
    latency_ms: AtomicU64,
    batches_applied: AtomicU64,
    interleaved: Mutex<Option<Vec<GraphOperation>>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` port calls fail with `GraphError::Unavailable`
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` batches fail; other calls are unaffected
    pub fn fail_next_batches(&self, count: usize) {
        self.fail_batches.store(count, Ordering::SeqCst);
    }

    /// Delay every port call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Commit `operations` as a separate batch just before the next `run_batch`
    pub fn interleave_before_next_batch(&self, operations: Vec<GraphOperation>) {
        if let Ok(mut pending) = self.interleaved.lock() {
            *pending = Some(operations);
        }
    }

    /// Number of batches committed so far
    pub fn batches_applied(&self) -> u64 {
        self.batches_applied.load(Ordering::SeqCst)
    }

    /// Total number of edges
    pub async fn edge_count(&self) -> usize {
        self.state.read().await.edge_count
    }

    async fn enter(&self) -> Result<(), GraphError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if consume(&self.fail_next) {
            return Err(GraphError::unavailable("injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn merge_node(&self, upsert: NodeUpsert) -> Result<MergeOutcome, GraphError> {
        self.enter().await?;
        Ok(self.state.write().await.merge(upsert))
    }

    async fn update_node(
        &self,
        key: &NodeKey,
        properties: PropertyMap,
    ) -> Result<GraphNode, GraphError> {
        self.enter().await?;
        self.state.write().await.update(key, properties)
    }

    async fn delete_node(&self, key: &NodeKey) -> Result<bool, GraphError> {
        self.enter().await?;
        Ok(self.state.write().await.delete_node(key).0)
    }

    async fn get_node(&self, key: &NodeKey) -> Result<Option<GraphNode>, GraphError> {
        self.enter().await?;
        Ok(self.state.read().await.nodes.get(key).cloned())
    }

    async fn find_nodes(
        &self,
        entity_type: Option<EntityType>,
        property: &str,
        value: &Value,
    ) -> Result<Vec<GraphNode>, GraphError> {
        self.enter().await?;
        let state = self.state.read().await;
        Ok(state
            .nodes
            .values()
            .filter(|n| entity_type.map_or(true, |t| n.key.entity_type == t))
            .filter(|n| n.properties.get(property) == Some(value))
            .cloned()
            .collect())
    }

    async fn count_nodes(&self) -> Result<u64, GraphError> {
        self.enter().await?;
        Ok(self.state.read().await.nodes.len() as u64)
    }

    async fn create_edge(&self, edge: GraphEdge) -> Result<bool, GraphError> {
        self.enter().await?;
        self.state.write().await.create_edge(edge)
    }

    async fn delete_edge(&self, edge: &GraphEdge) -> Result<bool, GraphError> {
        self.enter().await?;
        Ok(self.state.write().await.delete_edge(edge))
    }

    async fn find_edges(&self, filter: EdgeFilter) -> Result<Vec<GraphEdge>, GraphError> {
        self.enter().await?;
        Ok(self.state.read().await.find_edges(&filter))
    }

    async fn traverse(
        &self,
        start: &NodeKey,
        edge_types: &[EdgeType],
        max_depth: usize,
        direction: Direction,
    ) -> Result<Vec<TraversalHit>, GraphError> {
        self.enter().await?;
        let state = self.state.read().await;

        let mut hits = Vec::new();
        let mut seen: HashSet<NodeKey> = HashSet::from([start.clone()]);
        let mut frontier: VecDeque<(NodeKey, usize)> = VecDeque::from([(start.clone(), 0)]);

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let edges = match direction {
                Direction::Outgoing => state.outgoing.get(&current),
                Direction::Incoming => state.incoming.get(&current),
            };
            for edge in edges.into_iter().flatten() {
                if !edge_types.is_empty() && !edge_types.contains(&edge.edge_type) {
                    continue;
                }
                let next = match direction {
                    Direction::Outgoing => &edge.to,
                    Direction::Incoming => &edge.from,
                };
                if seen.insert(next.clone()) {
                    hits.push(TraversalHit {
                        key: next.clone(),
                        depth: depth + 1,
                    });
                    frontier.push_back((next.clone(), depth + 1));
                }
            }
        }

        Ok(hits)
    }

    async fn run_batch(&self, operations: Vec<GraphOperation>) -> Result<BatchOutcome, GraphError> {
        self.enter().await?;
        if consume(&self.fail_batches) {
            return Err(GraphError::unavailable("injected batch failure"));
        }
        let mut state = self.state.write().await;

        let interleaved = self
            .interleaved
            .lock()
            .ok()
            .and_then(|mut pending| pending.take());
        if let Some(operations) = interleaved {
            let mut working = state.clone();
            let mut outcome = BatchOutcome::default();
            for operation in operations {
                working.apply(operation, &mut outcome)?;
            }
            *state = working;
            self.batches_applied.fetch_add(1, Ordering::SeqCst);
        }

        let mut working = state.clone();
        let mut outcome = BatchOutcome::default();
        for operation in operations {
            working.apply(operation, &mut outcome)?;
        }

        *state = working;
        self.batches_applied.fetch_add(1, Ordering::SeqCst);
        Ok(outcome)
    }
}
