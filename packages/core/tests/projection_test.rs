//! Projection Tests
//!
//! Upserting records into the graph: idempotence, stale-write rejection, and
//! safety when the same queue item is delivered more than once.

#[cfg(test)]
mod projection_tests {
    use anyhow::Result;
    use chrono::Utc;
    use memgraph_sync_core::config::OrphanDetectorConfig;
    use memgraph_sync_core::db::{EdgeFilter, GraphStore, MemoryGraphStore};
    use memgraph_sync_core::models::{
        EdgeType, EntityType, FactRecord, LayerRecord, NodeKey, PropertyMap, SyncOperation,
        SyncQueueItem, SyncStatus,
    };
    use memgraph_sync_core::services::{
        EntitySynchronizer, ItemOutcome, ItemProcessor, MemoryRecordSource, UpsertDisposition,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn props(value: &str) -> PropertyMap {
        let mut map = PropertyMap::new();
        map.insert("statement".into(), json!(value));
        map
    }

    fn fact_record(id: &str, version: u64, subject: &str, object: &str) -> LayerRecord {
        LayerRecord::Fact(FactRecord {
            fact_id: id.to_string(),
            memory_space_id: "space-1".to_string(),
            version,
            statement: format!("{subject} works at {object}"),
            subject: Some(subject.to_string()),
            predicate: Some("works at".to_string()),
            object: Some(object.to_string()),
            confidence: Some(0.9),
            source_conversation_id: Some("conv-1".to_string()),
        })
    }

    fn item(key: NodeKey, operation: SyncOperation, version: u64) -> SyncQueueItem {
        let now = Utc::now();
        SyncQueueItem {
            item_id: 42,
            key,
            operation,
            source_version: version,
            enqueued_at: now,
            status: SyncStatus::InFlight,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_idempotent_upsert() -> Result<()> {
        let store = Arc::new(MemoryGraphStore::new());
        let sync = EntitySynchronizer::new(store.clone());

        let first = sync
            .upsert(EntityType::Fact, "fact-1", props("alice works at acme"), 3)
            .await?;
        let second = sync
            .upsert(EntityType::Fact, "fact-1", props("alice works at acme"), 3)
            .await?;

        assert_eq!(first, second);
        assert_eq!(store.count_nodes().await?, 1);
        let node = store.get_node(&first.key).await?.unwrap();
        assert_eq!(node.properties, props("alice works at acme"));
        assert_eq!(node.last_synced_version, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_write_is_rejected() -> Result<()> {
        let store = Arc::new(MemoryGraphStore::new());
        let sync = EntitySynchronizer::new(store.clone());

        let handle = sync
            .upsert(EntityType::Fact, "fact-1", props("current"), 7)
            .await?;
        sync.upsert(EntityType::Fact, "fact-1", props("outdated"), 6)
            .await?;

        let node = store.get_node(&handle.key).await?.unwrap();
        assert_eq!(node.properties, props("current"));
        assert_eq!(node.last_synced_version, 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_fact_projects_node_edges_and_stubs() -> Result<()> {
        let source = Arc::new(MemoryRecordSource::new());
        let store = Arc::new(MemoryGraphStore::new());
        let processor =
            ItemProcessor::new(source.clone(), store.clone(), OrphanDetectorConfig::default());

        let key = source
            .insert(fact_record("fact-1", 1, "Alice", "Acme Corp"))
            .await?;
        processor
            .process(&item(key.clone(), SyncOperation::Upsert, 1))
            .await?;

        // fact, space, conversation, alice, acme-corp
        assert_eq!(store.count_nodes().await?, 5);

        let alice = NodeKey::new(EntityType::ExtractedEntity, "alice")?;
        let acme = NodeKey::new(EntityType::ExtractedEntity, "acme-corp")?;
        let stub = store.get_node(&alice).await?.unwrap();
        assert!(stub.is_stub);

        let works_at = store
            .find_edges(EdgeFilter::outgoing(&alice).with_type(EdgeType::WorksAt))
            .await?;
        assert_eq!(works_at.len(), 1);
        assert_eq!(works_at[0].to, acme);
        assert_eq!(works_at[0].owner, key);
        Ok(())
    }

    #[tokio::test]
    async fn test_redelivered_item_changes_nothing() -> Result<()> {
        let source = Arc::new(MemoryRecordSource::new());
        let store = Arc::new(MemoryGraphStore::new());
        let processor =
            ItemProcessor::new(source.clone(), store.clone(), OrphanDetectorConfig::default());

        let key = source
            .insert(fact_record("fact-1", 1, "Alice", "Acme Corp"))
            .await?;
        let queued = item(key.clone(), SyncOperation::Upsert, 1);

        processor.process(&queued).await?;
        let nodes = store.count_nodes().await?;
        let edges = store.edge_count().await;

        let replay = processor.process(&queued).await?;
        assert!(matches!(
            replay,
            ItemOutcome::Upserted {
                disposition: UpsertDisposition::Replay,
                edges_created: 0,
                edges_deleted: 0,
                ..
            }
        ));
        assert_eq!(store.count_nodes().await?, nodes);
        assert_eq!(store.edge_count().await, edges);

        // Delete twice: the second pass finds nothing to remove
        let delete = item(key.clone(), SyncOperation::Delete, 2);
        let first = processor.process(&delete).await?;
        assert!(first.cascade_deleted() >= 1);
        let second = processor.process(&delete).await?;
        assert_eq!(second.cascade_deleted(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_updated_record_replaces_stale_edges() -> Result<()> {
        let source = Arc::new(MemoryRecordSource::new());
        let store = Arc::new(MemoryGraphStore::new());
        let processor =
            ItemProcessor::new(source.clone(), store.clone(), OrphanDetectorConfig::default());

        let key = source
            .insert(fact_record("fact-1", 1, "Alice", "Acme Corp"))
            .await?;
        processor
            .process(&item(key.clone(), SyncOperation::Upsert, 1))
            .await?;

        source
            .insert(fact_record("fact-1", 2, "Alice", "Globex"))
            .await?;
        processor
            .process(&item(key.clone(), SyncOperation::Upsert, 2))
            .await?;

        let mentions: Vec<NodeKey> = store
            .find_edges(EdgeFilter::outgoing(&key).with_type(EdgeType::Mentions))
            .await?
            .into_iter()
            .map(|edge| edge.to)
            .collect();
        assert_eq!(
            mentions,
            vec![
                NodeKey::new(EntityType::ExtractedEntity, "alice")?,
                NodeKey::new(EntityType::ExtractedEntity, "globex")?,
            ]
        );

        let node = store.get_node(&key).await?.unwrap();
        assert_eq!(node.last_synced_version, 2);
        assert_eq!(node.properties["object"], json!("Globex"));
        Ok(())
    }
}
