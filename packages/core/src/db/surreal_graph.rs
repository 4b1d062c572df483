//! SurrealGraphStore - Graph Store Port Adapter for Embedded SurrealDB
//!
//! Persists the projection in an embedded SurrealDB (RocksDB engine):
//!
//! 1. **`graph_node` table** - one record per node, record id `Type:key`
//! 2. **`graph_edge` table** - one record per edge, record id derived from the
//!    full `(from, type, to, owner)` tuple so duplicate creates collapse
//!
//! # Batches
//!
//! `run_batch` holds the adapter's write lock, resolves every operation against
//! the current rows plus the batch's own earlier writes, then submits the
//! resulting statements as a single `BEGIN TRANSACTION; ... COMMIT TRANSACTION;`
//! query. Writes from this adapter are serialized by the lock, so the
//! pre-resolution sees a consistent graph.
//!
//! # Examples
//!
//! ```rust,no_run
//! use memgraph_sync_core::db::{GraphStore, SurrealGraphStore};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SurrealGraphStore::new(PathBuf::from("./data/graph.db")).await?;
//!     println!("{} nodes", store.count_nodes().await?);
//!     Ok(())
//! }
//! ```

use crate::db::error::GraphError;
use crate::db::graph_store::{
    BatchOutcome, Direction, EdgeFilter, GraphOperation, GraphStore, MergeOutcome, NodeUpsert,
    TraversalHit,
};
use crate::models::{EdgeType, EntityType, GraphEdge, GraphNode, NodeKey, PropertyMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use surrealdb::engine::local::{Db, RocksDb};
use surrealdb::Surreal;
use tokio::sync::Mutex;
use uuid::Uuid;

const NODE_FIELDS: &str =
    "graph_id, entity_type, stable_key, properties, last_synced_version, is_stub, synced_at";
const EDGE_FIELDS: &str = "edge_type, from_key, to_key, owner_key";

/// Row shape of the `graph_node` table
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRow {
    graph_id: String,
    entity_type: String,
    stable_key: String,
    properties: Value,
    last_synced_version: i64,
    is_stub: bool,
    synced_at: String,
}

impl NodeRow {
    fn from_node(node: &GraphNode) -> Self {
        Self {
            graph_id: node.graph_id.clone(),
            entity_type: node.key.entity_type.as_str().to_string(),
            stable_key: node.key.stable_key.clone(),
            properties: Value::Object(node.properties.clone()),
            last_synced_version: node.last_synced_version as i64,
            is_stub: node.is_stub,
            synced_at: node.synced_at.to_rfc3339(),
        }
    }

    fn into_node(self) -> Result<GraphNode, GraphError> {
        let entity_type = self
            .entity_type
            .parse::<EntityType>()
            .map_err(|e| GraphError::backend(format!("Stored node has {}", e)))?;
        let key = NodeKey::new(entity_type, self.stable_key)
            .map_err(|e| GraphError::backend(format!("Stored node has {}", e)))?;
        let properties = match self.properties {
            Value::Object(map) => map,
            _ => PropertyMap::new(),
        };
        Ok(GraphNode {
            graph_id: self.graph_id,
            key,
            properties,
            last_synced_version: self.last_synced_version.max(0) as u64,
            is_stub: self.is_stub,
            synced_at: DateTime::parse_from_rfc3339(&self.synced_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

/// Row shape of the `graph_edge` table
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeRow {
    edge_type: String,
    from_key: String,
    to_key: String,
    owner_key: String,
}

impl EdgeRow {
    fn from_edge(edge: &GraphEdge) -> Self {
        Self {
            edge_type: edge.edge_type.as_str().to_string(),
            from_key: edge.from.to_string(),
            to_key: edge.to.to_string(),
            owner_key: edge.owner.to_string(),
        }
    }

    fn into_edge(self) -> Result<GraphEdge, GraphError> {
        let corrupt = |e: crate::models::ValidationError| {
            GraphError::backend(format!("Stored edge has {}", e))
        };
        Ok(GraphEdge::new(
            self.edge_type.parse().map_err(corrupt)?,
            NodeKey::parse(&self.from_key).map_err(corrupt)?,
            NodeKey::parse(&self.to_key).map_err(corrupt)?,
            NodeKey::parse(&self.owner_key).map_err(corrupt)?,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

fn node_record_id(key: &NodeKey) -> String {
    key.to_string()
}

fn edge_record_id(edge: &GraphEdge) -> String {
    format!(
        "{}|{}|{}|{}",
        edge.from, edge.edge_type, edge.to, edge.owner
    )
}

fn backend_error(context: &str) -> impl Fn(surrealdb::Error) -> GraphError + '_ {
    move |e| GraphError::backend(format!("{}: {}", context, e))
}

/// Statements accumulated for one transaction, with their bound parameters
#[derive(Default)]
struct Transaction {
    statements: Vec<String>,
    binds: Vec<(String, Value)>,
}

impl Transaction {
    fn param(&mut self, value: Value) -> String {
        let name = format!("p{}", self.binds.len());
        self.binds.push((name.clone(), value));
        format!("${}", name)
    }

    fn upsert_node(&mut self, node: &GraphNode) {
        let id = self.param(json!(node_record_id(&node.key)));
        let content = self.param(json!(NodeRow::from_node(node)));
        self.statements.push(format!(
            "UPSERT type::thing('graph_node', {}) CONTENT {};",
            id, content
        ));
    }

    fn delete_node(&mut self, key: &NodeKey) {
        let id = self.param(json!(node_record_id(key)));
        let key_param = self.param(json!(key.to_string()));
        self.statements
            .push(format!("DELETE type::thing('graph_node', {});", id));
        self.statements.push(format!(
            "DELETE graph_edge WHERE from_key = {0} OR to_key = {0};",
            key_param
        ));
    }

    fn create_edge(&mut self, edge: &GraphEdge) {
        let id = self.param(json!(edge_record_id(edge)));
        let content = self.param(json!(EdgeRow::from_edge(edge)));
        self.statements.push(format!(
            "UPSERT type::thing('graph_edge', {}) CONTENT {};",
            id, content
        ));
    }

    fn delete_edge(&mut self, edge: &GraphEdge) {
        let id = self.param(json!(edge_record_id(edge)));
        self.statements
            .push(format!("DELETE type::thing('graph_edge', {});", id));
    }

    fn into_query(self) -> Option<(String, Vec<(String, Value)>)> {
        if self.statements.is_empty() {
            return None;
        }
        let sql = format!(
            "BEGIN TRANSACTION;\n{}\nCOMMIT TRANSACTION;",
            self.statements.join("\n")
        );
        Some((sql, self.binds))
    }
}

/// Graph Store Port adapter for embedded SurrealDB
pub struct SurrealGraphStore {
    db: Arc<Surreal<Db>>,
    write_lock: Mutex<()>,
}

impl SurrealGraphStore {
    /// Open (or create) the RocksDB-backed graph at `db_path`
    pub async fn new(db_path: PathBuf) -> Result<Self, GraphError> {
        let db = Surreal::new::<RocksDb>(db_path)
            .await
            .map_err(|e| GraphError::unavailable(format!("Failed to open SurrealDB: {}", e)))?;

        db.use_ns("memgraph")
            .use_db("graph")
            .await
            .map_err(backend_error("Failed to set namespace/database"))?;

        let db = Arc::new(db);
        Self::initialize_schema(&db).await?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    async fn initialize_schema(db: &Surreal<Db>) -> Result<(), GraphError> {
        db.query(
            "
            DEFINE TABLE IF NOT EXISTS graph_node SCHEMALESS;
            DEFINE TABLE IF NOT EXISTS graph_edge SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_graph_edge_from ON graph_edge FIELDS from_key;
            DEFINE INDEX IF NOT EXISTS idx_graph_edge_to ON graph_edge FIELDS to_key;
            DEFINE INDEX IF NOT EXISTS idx_graph_edge_owner ON graph_edge FIELDS owner_key;
            ",
        )
        .await
        .map_err(backend_error("Failed to create graph tables"))?
        .check()
        .map_err(backend_error("Failed to create graph tables"))?;
        Ok(())
    }

    async fn execute(&self, transaction: Transaction) -> Result<(), GraphError> {
        let Some((sql, binds)) = transaction.into_query() else {
            return Ok(());
        };
        let mut query = self.db.query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        query
            .await
            .map_err(backend_error("Failed to submit graph batch"))?
            .check()
            .map_err(backend_error("Graph batch rejected"))?;
        Ok(())
    }

    async fn fetch_node(&self, key: &NodeKey) -> Result<Option<GraphNode>, GraphError> {
        let mut response = self
            .db
            .query(format!(
                "SELECT {} FROM type::thing('graph_node', $id);",
                NODE_FIELDS
            ))
            .bind(("id", node_record_id(key)))
            .await
            .map_err(backend_error("Failed to query node"))?;

        let rows: Vec<NodeRow> = response
            .take(0)
            .map_err(backend_error("Failed to extract node row"))?;
        rows.into_iter().next().map(NodeRow::into_node).transpose()
    }

    async fn fetch_edges(&self, filter: &EdgeFilter) -> Result<Vec<GraphEdge>, GraphError> {
        let mut clauses = Vec::new();
        let mut binds: Vec<(String, Value)> = Vec::new();
        if let Some(from) = &filter.from {
            clauses.push("from_key = $from");
            binds.push(("from".into(), json!(from.to_string())));
        }
        if let Some(to) = &filter.to {
            clauses.push("to_key = $to");
            binds.push(("to".into(), json!(to.to_string())));
        }
        if let Some(edge_type) = filter.edge_type {
            clauses.push("edge_type = $edge_type");
            binds.push(("edge_type".into(), json!(edge_type.as_str())));
        }
        if let Some(owner) = &filter.owner {
            clauses.push("owner_key = $owner");
            binds.push(("owner".into(), json!(owner.to_string())));
        }

        let mut sql = format!("SELECT {} FROM graph_edge", EDGE_FIELDS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push(';');

        let mut query = self.db.query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let mut response = query
            .await
            .map_err(backend_error("Failed to query edges"))?;
        let rows: Vec<EdgeRow> = response
            .take(0)
            .map_err(backend_error("Failed to extract edge rows"))?;

        let edges: BTreeSet<GraphEdge> = rows
            .into_iter()
            .map(EdgeRow::into_edge)
            .collect::<Result<_, _>>()?;
        Ok(edges.into_iter().collect())
    }

    async fn edge_exists(&self, edge: &GraphEdge) -> Result<bool, GraphError> {
        let mut response = self
            .db
            .query("SELECT edge_type FROM type::thing('graph_edge', $id);")
            .bind(("id", edge_record_id(edge)))
            .await
            .map_err(backend_error("Failed to query edge"))?;
        let rows: Vec<Value> = response
            .take(0)
            .map_err(backend_error("Failed to extract edge row"))?;
        Ok(!rows.is_empty())
    }
}

/// Batch-local view: rows written earlier in the same batch shadow the database
#[derive(Default)]
struct Overlay {
    nodes: HashMap<NodeKey, Option<GraphNode>>,
    edges: HashMap<GraphEdge, bool>,
}

impl Overlay {
    async fn node(
        &mut self,
        store: &SurrealGraphStore,
        key: &NodeKey,
    ) -> Result<Option<GraphNode>, GraphError> {
        if let Some(node) = self.nodes.get(key) {
            return Ok(node.clone());
        }
        let node = store.fetch_node(key).await?;
        self.nodes.insert(key.clone(), node.clone());
        Ok(node)
    }

    async fn edge_exists(
        &mut self,
        store: &SurrealGraphStore,
        edge: &GraphEdge,
    ) -> Result<bool, GraphError> {
        if let Some(exists) = self.edges.get(edge) {
            return Ok(*exists);
        }
        let exists = store.edge_exists(edge).await?;
        self.edges.insert(edge.clone(), exists);
        Ok(exists)
    }

    /// Edges currently touching `key`, as seen from inside the batch
    async fn incident_edges(
        &mut self,
        store: &SurrealGraphStore,
        key: &NodeKey,
    ) -> Result<BTreeSet<GraphEdge>, GraphError> {
        let mut edges: BTreeSet<GraphEdge> = store
            .fetch_edges(&EdgeFilter::outgoing(key))
            .await?
            .into_iter()
            .collect();
        edges.extend(store.fetch_edges(&EdgeFilter::incoming(key)).await?);

        for (edge, exists) in &self.edges {
            if &edge.from == key || &edge.to == key {
                if *exists {
                    edges.insert(edge.clone());
                } else {
                    edges.remove(edge);
                }
            }
        }
        Ok(edges)
    }
}

fn merged_node(existing: Option<&GraphNode>, upsert: NodeUpsert) -> MergeOutcome {
    let now = Utc::now();
    match existing {
        Some(existing)
            if existing.is_stub || upsert.source_version > existing.last_synced_version =>
        {
            MergeOutcome::Updated(GraphNode {
                graph_id: existing.graph_id.clone(),
                key: upsert.key,
                properties: upsert.properties,
                last_synced_version: upsert.source_version,
                is_stub: false,
                synced_at: now,
            })
        }
        Some(existing) => MergeOutcome::Stale(existing.clone()),
        None => MergeOutcome::Created(GraphNode {
            graph_id: Uuid::new_v4().to_string(),
            key: upsert.key,
            properties: upsert.properties,
            last_synced_version: upsert.source_version,
            is_stub: false,
            synced_at: now,
        }),
    }
}

impl SurrealGraphStore {
    async fn resolve(
        &self,
        operation: GraphOperation,
        overlay: &mut Overlay,
        tx: &mut Transaction,
        outcome: &mut BatchOutcome,
    ) -> Result<(), GraphError> {
        match operation {
            GraphOperation::MergeNode(upsert) => {
                let key = upsert.key.clone();
                let existing = overlay.node(self, &key).await?;
                match merged_node(existing.as_ref(), upsert) {
                    MergeOutcome::Created(node) => {
                        tx.upsert_node(&node);
                        overlay.nodes.insert(key.clone(), Some(node));
                        outcome.created_nodes.push(key);
                    }
                    MergeOutcome::Updated(node) => {
                        tx.upsert_node(&node);
                        overlay.nodes.insert(key.clone(), Some(node));
                        outcome.updated_nodes.push(key);
                    }
                    MergeOutcome::Stale(_) => outcome.stale_nodes.push(key),
                }
            }
            GraphOperation::EnsureStub { key, properties } => {
                if overlay.node(self, &key).await?.is_none() {
                    let stub = GraphNode {
                        graph_id: Uuid::new_v4().to_string(),
                        key: key.clone(),
                        properties,
                        last_synced_version: 0,
                        is_stub: true,
                        synced_at: Utc::now(),
                    };
                    tx.upsert_node(&stub);
                    overlay.nodes.insert(key.clone(), Some(stub));
                    outcome.stubs_created.push(key);
                }
            }
            GraphOperation::DeleteNode { key } => {
                if overlay.node(self, &key).await?.is_some() {
                    let incident = overlay.incident_edges(self, &key).await?;
                    tx.delete_node(&key);
                    outcome.edges_deleted += incident.len();
                    for edge in incident {
                        overlay.edges.insert(edge, false);
                    }
                    overlay.nodes.insert(key.clone(), None);
                    outcome.deleted_nodes.push(key);
                }
            }
            GraphOperation::GuardOrphan {
                key,
                allowed_sources,
            } => {
                let incident = overlay.incident_edges(self, &key).await?;
                if let Some(edge) = incident
                    .iter()
                    .find(|edge| edge.to == key && !allowed_sources.contains(&edge.from))
                {
                    return Err(GraphError::conflict(format!(
                        "{} is still referenced by {}",
                        key, edge
                    )));
                }
            }
            GraphOperation::CreateEdge { edge } => {
                for endpoint in [&edge.from, &edge.to] {
                    if overlay.node(self, endpoint).await?.is_none() {
                        return Err(GraphError::invalid_node(format!(
                            "edge {} references missing node {}",
                            edge, endpoint
                        )));
                    }
                }
                if !overlay.edge_exists(self, &edge).await? {
                    tx.create_edge(&edge);
                    overlay.edges.insert(edge, true);
                    outcome.edges_created += 1;
                }
            }
            GraphOperation::DeleteEdge { edge } => {
                if overlay.edge_exists(self, &edge).await? {
                    tx.delete_edge(&edge);
                    overlay.edges.insert(edge, false);
                    outcome.edges_deleted += 1;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for SurrealGraphStore {
    async fn merge_node(&self, upsert: NodeUpsert) -> Result<MergeOutcome, GraphError> {
        let _guard = self.write_lock.lock().await;
        let existing = self.fetch_node(&upsert.key).await?;
        let outcome = merged_node(existing.as_ref(), upsert);
        if !matches!(outcome, MergeOutcome::Stale(_)) {
            let mut tx = Transaction::default();
            tx.upsert_node(outcome.node());
            self.execute(tx).await?;
        }
        Ok(outcome)
    }

    async fn update_node(
        &self,
        key: &NodeKey,
        properties: PropertyMap,
    ) -> Result<GraphNode, GraphError> {
        let _guard = self.write_lock.lock().await;
        let mut node = self
            .fetch_node(key)
            .await?
            .ok_or_else(|| GraphError::not_found(key.to_string()))?;
        node.properties = properties;
        node.synced_at = Utc::now();

        let mut tx = Transaction::default();
        tx.upsert_node(&node);
        self.execute(tx).await?;
        Ok(node)
    }

    async fn delete_node(&self, key: &NodeKey) -> Result<bool, GraphError> {
        let outcome = self
            .run_batch(vec![GraphOperation::DeleteNode { key: key.clone() }])
            .await?;
        Ok(!outcome.deleted_nodes.is_empty())
    }

    async fn get_node(&self, key: &NodeKey) -> Result<Option<GraphNode>, GraphError> {
        self.fetch_node(key).await
    }

    async fn find_nodes(
        &self,
        entity_type: Option<EntityType>,
        property: &str,
        value: &Value,
    ) -> Result<Vec<GraphNode>, GraphError> {
        let mut query = match entity_type {
            Some(entity_type) => self
                .db
                .query(format!(
                    "SELECT {} FROM graph_node WHERE entity_type = $entity_type;",
                    NODE_FIELDS
                ))
                .bind(("entity_type", entity_type.as_str().to_string())),
            None => self
                .db
                .query(format!("SELECT {} FROM graph_node;", NODE_FIELDS)),
        }
        .await
        .map_err(backend_error("Failed to query nodes"))?;

        let rows: Vec<NodeRow> = query
            .take(0)
            .map_err(backend_error("Failed to extract node rows"))?;

        // Property bags are schemaless; match on the decoded map
        let mut nodes = Vec::new();
        for row in rows {
            let node = row.into_node()?;
            if node.properties.get(property) == Some(value) {
                nodes.push(node);
            }
        }
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(nodes)
    }

    async fn count_nodes(&self) -> Result<u64, GraphError> {
        let mut response = self
            .db
            .query("SELECT count() FROM graph_node GROUP ALL;")
            .await
            .map_err(backend_error("Failed to count nodes"))?;
        let row: Option<CountRow> = response
            .take(0)
            .map_err(backend_error("Failed to extract node count"))?;
        Ok(row.map_or(0, |r| r.count.max(0) as u64))
    }

    async fn create_edge(&self, edge: GraphEdge) -> Result<bool, GraphError> {
        let outcome = self
            .run_batch(vec![GraphOperation::CreateEdge { edge }])
            .await?;
        Ok(outcome.edges_created > 0)
    }

    async fn delete_edge(&self, edge: &GraphEdge) -> Result<bool, GraphError> {
        let outcome = self
            .run_batch(vec![GraphOperation::DeleteEdge { edge: edge.clone() }])
            .await?;
        Ok(outcome.edges_deleted > 0)
    }

    async fn find_edges(&self, filter: EdgeFilter) -> Result<Vec<GraphEdge>, GraphError> {
        self.fetch_edges(&filter).await
    }

    async fn traverse(
        &self,
        start: &NodeKey,
        edge_types: &[EdgeType],
        max_depth: usize,
        direction: Direction,
    ) -> Result<Vec<TraversalHit>, GraphError> {
        let mut hits = Vec::new();
        let mut seen: HashSet<NodeKey> = HashSet::from([start.clone()]);
        let mut frontier: VecDeque<(NodeKey, usize)> = VecDeque::from([(start.clone(), 0)]);

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let filter = match direction {
                Direction::Outgoing => EdgeFilter::outgoing(&current),
                Direction::Incoming => EdgeFilter::incoming(&current),
            };
            for edge in self.fetch_edges(&filter).await? {
                if !edge_types.is_empty() && !edge_types.contains(&edge.edge_type) {
                    continue;
                }
                let next = match direction {
                    Direction::Outgoing => edge.to,
                    Direction::Incoming => edge.from,
                };
                if seen.insert(next.clone()) {
                    hits.push(TraversalHit {
                        key: next.clone(),
                        depth: depth + 1,
                    });
                    frontier.push_back((next, depth + 1));
                }
            }
        }

        Ok(hits)
    }

    async fn run_batch(&self, operations: Vec<GraphOperation>) -> Result<BatchOutcome, GraphError> {
        let _guard = self.write_lock.lock().await;

        let mut overlay = Overlay::default();
        let mut tx = Transaction::default();
        let mut outcome = BatchOutcome::default();
        for operation in operations {
            self.resolve(operation, &mut overlay, &mut tx, &mut outcome)
                .await?;
        }

        self.execute(tx).await?;
        Ok(outcome)
    }
}
