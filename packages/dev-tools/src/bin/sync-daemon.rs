//! Local Sync Daemon
//!
//! Runs the graph sync worker against a durable libsql queue so the engine
//! can be exercised outside of tests. Records can be seeded from a JSON file;
//! every seeded record is enqueued as an upsert.
//!
//! # Usage
//!
//! ```bash
//! # In-memory graph, queue under ./data
//! cargo run --bin sync-daemon
//!
//! # Seed records and persist the graph with SurrealDB
//! MEMGRAPH_SYNC_RECORDS_PATH=records.json \
//! MEMGRAPH_SYNC_GRAPH_PATH=./data/graph \
//!     cargo run --bin sync-daemon --features surrealdb
//! ```
//!
//! # Environment Variables
//!
//! - `MEMGRAPH_SYNC_QUEUE_PATH`: queue database file (default: ./data/sync_queue.db)
//! - `MEMGRAPH_SYNC_RECORDS_PATH`: JSON array of layer records to seed
//! - `MEMGRAPH_SYNC_GRAPH_PATH`: SurrealDB directory (requires the `surrealdb` feature)
//! - `MEMGRAPH_SYNC_HEALTH_INTERVAL_SECS`: health log interval (default: 30)
//! - `MEMGRAPH_SYNC_*`: worker and orphan detector overrides, see `EngineConfig::from_env`
//! - `RUST_LOG`: logging level (e.g., "info", "debug", "trace")

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use memgraph_sync_core::db::{GraphStore, LibsqlSyncQueue, MemoryGraphStore};
use memgraph_sync_core::{
    EngineConfig, GraphSyncEngine, LayerRecord, MemoryRecordSource, SyncOperation, SyncOptions,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env();

    let queue_path = env::var("MEMGRAPH_SYNC_QUEUE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data").join("sync_queue.db"));
    if let Some(parent) = queue_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tracing::info!("Queue: {}", queue_path.display());
    let queue = Arc::new(LibsqlSyncQueue::new(queue_path).await?);

    let store = open_graph_store().await?;
    let source = Arc::new(MemoryRecordSource::new());
    let engine = GraphSyncEngine::new(queue, store, source.clone(), config.clone());

    if let Ok(path) = env::var("MEMGRAPH_SYNC_RECORDS_PATH") {
        let raw = tokio::fs::read_to_string(&path).await?;
        let records: Vec<LayerRecord> = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse records in {}: {}", path, e))?;
        let count = records.len();
        for record in records {
            let version = record.version();
            let key = source.insert(record).await?;
            engine
                .enqueue_sync(
                    key.entity_type,
                    &key.stable_key,
                    SyncOperation::Upsert,
                    version,
                    &SyncOptions::default(),
                )
                .await?;
        }
        tracing::info!("Seeded {} records from {}", count, path);
    }

    engine.start_worker(config.worker).await?;

    let health_interval = env::var("MEMGRAPH_SYNC_HEALTH_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    let mut ticker = tokio::time::interval(Duration::from_secs(health_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                match engine.get_health().await {
                    Ok(health) => tracing::info!(
                        pending = health.pending_count,
                        in_flight = health.in_flight_count,
                        failed = health.failed_count,
                        processed = health.processed_total,
                        cascade_deleted = health.cascade_deleted_total,
                        "Sync health"
                    ),
                    Err(e) => tracing::warn!("Failed to read sync health: {}", e),
                }
            }
        }
    }

    tracing::info!("Shutting down sync worker");
    engine.stop_worker().await;
    Ok(())
}

#[cfg(feature = "surrealdb")]
async fn open_graph_store() -> anyhow::Result<Arc<dyn GraphStore>> {
    use memgraph_sync_core::db::SurrealGraphStore;

    match env::var("MEMGRAPH_SYNC_GRAPH_PATH") {
        Ok(path) => {
            tracing::info!("Graph: SurrealDB at {}", path);
            Ok(Arc::new(SurrealGraphStore::new(PathBuf::from(path)).await?))
        }
        Err(_) => Ok(in_memory_graph()),
    }
}

#[cfg(not(feature = "surrealdb"))]
async fn open_graph_store() -> anyhow::Result<Arc<dyn GraphStore>> {
    if env::var("MEMGRAPH_SYNC_GRAPH_PATH").is_ok() {
        tracing::warn!("MEMGRAPH_SYNC_GRAPH_PATH ignored; build with --features surrealdb");
    }
    Ok(in_memory_graph())
}

fn in_memory_graph() -> Arc<dyn GraphStore> {
    tracing::info!("Graph: in-memory");
    Arc::new(MemoryGraphStore::new())
}
