//! Durable Queue Tests
//!
//! The engine running against a libsql queue file: items survive a restart,
//! items left in flight by a crashed process are recovered, and the worker
//! drains the durable queue the same way it drains the in-memory one.

#[cfg(test)]
mod libsql_queue_tests {
    use anyhow::Result;
    use chrono::Utc;
    use memgraph_sync_core::config::{EngineConfig, WorkerConfig};
    use memgraph_sync_core::db::{GraphStore, LibsqlSyncQueue, MemoryGraphStore, SyncQueue};
    use memgraph_sync_core::models::{
        EntityType, LayerRecord, MemorySpaceRecord, NewSyncItem, NodeKey, SyncOperation,
        SyncStatus,
    };
    use memgraph_sync_core::services::{GraphSyncEngine, MemoryRecordSource, SyncOptions};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::time::Duration;

    /// Helper to create a queue file in a fresh temp directory
    async fn create_test_queue() -> Result<(LibsqlSyncQueue, TempDir)> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("sync_queue.db");
        let queue = LibsqlSyncQueue::new(db_path).await?;
        Ok((queue, temp_dir))
    }

    fn space(id: &str) -> LayerRecord {
        LayerRecord::MemorySpace(MemorySpaceRecord {
            memory_space_id: id.to_string(),
            version: 1,
            name: Some(format!("Space {id}")),
            agent_ids: vec!["agent-1".to_string()],
            user_ids: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_engine_drains_durable_queue() -> Result<()> {
        let (queue, _temp_dir) = create_test_queue().await?;
        let queue = Arc::new(queue);
        let store = Arc::new(MemoryGraphStore::new());
        let source = Arc::new(MemoryRecordSource::new());
        let engine = GraphSyncEngine::new(
            queue.clone(),
            store.clone(),
            source.clone(),
            EngineConfig::default(),
        );

        let key = source.insert(space("space-1")).await?;
        engine
            .enqueue_sync(
                EntityType::MemorySpace,
                "space-1",
                SyncOperation::Upsert,
                1,
                &SyncOptions::default(),
            )
            .await?;

        engine.start_worker(WorkerConfig::default()).await?;
        assert!(engine.drain(Duration::from_secs(5)).await?);
        engine.stop_worker().await;

        let node = store.get_node(&key).await?.unwrap();
        assert_eq!(node.properties["name"], "Space space-1");
        let agent = NodeKey::new(EntityType::Agent, "agent-1")?;
        assert!(store.get_node(&agent).await?.unwrap().is_stub);

        let health = engine.get_health().await?;
        assert_eq!(health.done_count, 1);
        assert_eq!(health.pending_count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_in_flight_items_are_recovered_after_restart() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("sync_queue.db");

        // A previous process claimed the item and died
        let item_id = {
            let queue = LibsqlSyncQueue::new(db_path.clone()).await?;
            let key = NodeKey::new(EntityType::MemorySpace, "space-1")?;
            let item = queue.enqueue(NewSyncItem::upsert(key, 1)).await?;
            let claimed = queue.claim_batch(10, Utc::now()).await?;
            assert_eq!(claimed.len(), 1);
            item.item_id
        };

        let queue = Arc::new(LibsqlSyncQueue::new(db_path).await?);
        assert_eq!(
            queue.get(item_id).await?.unwrap().status,
            SyncStatus::InFlight
        );

        let store = Arc::new(MemoryGraphStore::new());
        let source = Arc::new(MemoryRecordSource::new());
        let key = source.insert(space("space-1")).await?;
        let engine = GraphSyncEngine::new(
            queue.clone(),
            store.clone(),
            source,
            EngineConfig::default(),
        );

        engine.start_worker(WorkerConfig::default()).await?;
        assert!(engine.drain(Duration::from_secs(5)).await?);
        engine.stop_worker().await;

        assert_eq!(queue.get(item_id).await?.unwrap().status, SyncStatus::Done);
        assert!(store.get_node(&key).await?.is_some());
        Ok(())
    }
}
