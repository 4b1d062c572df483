//! Orphan Cascade Tests
//!
//! Cascade deletion on small entity graphs: chains, shared targets, cycles
//! with and without an external anchor, back-references that must not be
//! followed, and a long chain that exceeds the traversal bound.

#[cfg(test)]
mod orphan_cascade_tests {
    use anyhow::Result;
    use memgraph_sync_core::config::OrphanDetectorConfig;
    use memgraph_sync_core::db::{
        EdgeFilter, GraphOperation, GraphStore, MemoryGraphStore, NodeUpsert,
    };
    use memgraph_sync_core::models::{EdgeType, EntityType, GraphEdge, NodeKey, PropertyMap};
    use memgraph_sync_core::services::{DeleteCascader, SyncError};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    fn entity(id: &str) -> NodeKey {
        NodeKey::new(EntityType::ExtractedEntity, id).unwrap()
    }

    async fn merge(store: &MemoryGraphStore, key: &NodeKey) -> Result<()> {
        store
            .merge_node(NodeUpsert {
                key: key.clone(),
                properties: PropertyMap::new(),
                source_version: 1,
            })
            .await?;
        Ok(())
    }

    fn keys(ids: &[&str]) -> BTreeSet<NodeKey> {
        ids.iter().map(|id| entity(id)).collect()
    }

    /// Build a graph of extracted-entity nodes from `(from, to)` pairs; edges are owned by `from`
    async fn build_graph(edges: &[(&str, &str)]) -> Result<Arc<MemoryGraphStore>> {
        let store = Arc::new(MemoryGraphStore::new());
        let ids: BTreeSet<&str> = edges.iter().flat_map(|(a, b)| [*a, *b]).collect();
        for id in ids {
            store
                .merge_node(NodeUpsert {
                    key: entity(id),
                    properties: PropertyMap::new(),
                    source_version: 1,
                })
                .await?;
        }
        for (from, to) in edges {
            store
                .create_edge(GraphEdge::new(
                    EdgeType::RelatesTo,
                    entity(from),
                    entity(to),
                    entity(from),
                ))
                .await?;
        }
        Ok(store)
    }

    fn cascader(store: &Arc<MemoryGraphStore>) -> DeleteCascader {
        DeleteCascader::new(store.clone(), OrphanDetectorConfig::default())
    }

    #[tokio::test]
    async fn test_unanchored_chain_is_deleted() -> Result<()> {
        let store = build_graph(&[("a", "b"), ("b", "c")]).await?;

        let result = cascader(&store)
            .delete_with_cascade("a", EntityType::ExtractedEntity)
            .await?;

        assert_eq!(result.deleted_keys, keys(&["a", "b", "c"]));
        assert_eq!(result.orphan_count, 2);
        assert_eq!(store.count_nodes().await?, 0);
        assert_eq!(store.edge_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_shared_reference_survives() -> Result<()> {
        let store = build_graph(&[("a", "b"), ("x", "b")]).await?;

        let result = cascader(&store)
            .delete_with_cascade("a", EntityType::ExtractedEntity)
            .await?;

        assert_eq!(result.deleted_keys, keys(&["a"]));
        assert!(store.get_node(&entity("b")).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_cycle_without_anchor_is_an_island() -> Result<()> {
        let store = build_graph(&[("a", "b"), ("b", "a")]).await?;

        let result = cascader(&store)
            .delete_with_cascade("a", EntityType::ExtractedEntity)
            .await?;

        assert!(result.deleted_keys.is_superset(&keys(&["a", "b"])));
        assert_eq!(store.count_nodes().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_cycle_with_external_anchor_survives() -> Result<()> {
        let store = build_graph(&[("a", "b"), ("b", "a"), ("x", "b")]).await?;

        let result = cascader(&store)
            .delete_with_cascade("a", EntityType::ExtractedEntity)
            .await?;

        assert_eq!(result.deleted_keys, keys(&["a"]));
        assert!(store.get_node(&entity("b")).await?.is_some());
        assert!(store.get_node(&entity("x")).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_longer_cycle_island_is_deleted_whole() -> Result<()> {
        // b -> c -> d -> b only reachable through a
        let store = build_graph(&[("a", "b"), ("b", "c"), ("c", "d"), ("d", "b")]).await?;

        let result = cascader(&store)
            .delete_with_cascade("a", EntityType::ExtractedEntity)
            .await?;

        assert_eq!(result.deleted_keys, keys(&["a", "b", "c", "d"]));
        Ok(())
    }

    #[tokio::test]
    async fn test_anchor_inside_cycle_keeps_whole_cycle() -> Result<()> {
        // x anchors d, and d keeps b and c reachable
        let store = build_graph(&[
            ("a", "b"),
            ("b", "c"),
            ("c", "d"),
            ("d", "b"),
            ("x", "d"),
        ])
        .await?;

        let result = cascader(&store)
            .delete_with_cascade("a", EntityType::ExtractedEntity)
            .await?;

        assert_eq!(result.deleted_keys, keys(&["a"]));
        assert_eq!(store.count_nodes().await?, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_long_chain_is_bounded_by_max_depth() -> Result<()> {
        let ids: Vec<String> = (0..1000).map(|i| format!("n{i}")).collect();
        let pairs: Vec<(&str, &str)> = ids
            .windows(2)
            .map(|w| (w[0].as_str(), w[1].as_str()))
            .collect();
        let store = build_graph(&pairs).await?;

        let result = timeout(
            Duration::from_secs(10),
            cascader(&store).delete_with_cascade("n0", EntityType::ExtractedEntity),
        )
        .await
        .expect("bounded traversal should finish")?;

        // n0 plus the ten nodes within reach of the bound
        assert_eq!(result.deleted_keys.len(), 11);
        assert!(result.depth_limited);
        assert!(store.get_node(&entity("n10")).await?.is_none());
        assert!(store.get_node(&entity("n11")).await?.is_some());
        assert_eq!(store.count_nodes().await?, 989);
        Ok(())
    }

    #[tokio::test]
    async fn test_repeated_delete_is_a_no_op() -> Result<()> {
        let store = build_graph(&[("a", "b")]).await?;
        let cascader = cascader(&store);

        cascader.delete_with_cascade("a", EntityType::ExtractedEntity).await?;
        let again = cascader.delete_with_cascade("a", EntityType::ExtractedEntity).await?;

        assert!(again.deleted_keys.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_anchor_types_stop_the_cascade() -> Result<()> {
        let store = build_graph(&[("a", "b")]).await?;
        let space = NodeKey::new(EntityType::MemorySpace, "space-1")?;
        store
            .merge_node(NodeUpsert {
                key: space.clone(),
                properties: PropertyMap::new(),
                source_version: 1,
            })
            .await?;
        store
            .create_edge(GraphEdge::new(
                EdgeType::InSpace,
                entity("a"),
                space.clone(),
                entity("a"),
            ))
            .await?;

        let result = cascader(&store)
            .delete_with_cascade("a", EntityType::ExtractedEntity)
            .await?;

        assert_eq!(result.deleted_keys, keys(&["a", "b"]));
        assert!(store.get_node(&space).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_child_delete_keeps_parent() -> Result<()> {
        let store = Arc::new(MemoryGraphStore::new());
        let parent = NodeKey::new(EntityType::Context, "parent")?;
        let child = NodeKey::new(EntityType::Context, "child")?;
        merge(&store, &parent).await?;
        merge(&store, &child).await?;
        store
            .create_edge(GraphEdge::new(
                EdgeType::ChildOf,
                child.clone(),
                parent.clone(),
                child.clone(),
            ))
            .await?;
        store
            .create_edge(GraphEdge::new(
                EdgeType::ParentOf,
                parent.clone(),
                child.clone(),
                child.clone(),
            ))
            .await?;

        let result = cascader(&store)
            .delete_with_cascade("child", EntityType::Context)
            .await?;

        assert_eq!(result.deleted_keys, BTreeSet::from([child]));
        assert_eq!(result.orphan_count, 0);
        assert!(store.get_node(&parent).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_fact_delete_keeps_source_conversation() -> Result<()> {
        let store = Arc::new(MemoryGraphStore::new());
        let fact = NodeKey::new(EntityType::Fact, "f1")?;
        let conversation = NodeKey::new(EntityType::Conversation, "c1")?;
        merge(&store, &fact).await?;
        merge(&store, &conversation).await?;
        merge(&store, &entity("alice")).await?;
        store
            .create_edge(GraphEdge::new(
                EdgeType::References,
                fact.clone(),
                conversation.clone(),
                fact.clone(),
            ))
            .await?;
        store
            .create_edge(GraphEdge::new(
                EdgeType::Mentions,
                fact.clone(),
                entity("alice"),
                fact.clone(),
            ))
            .await?;

        let result = cascader(&store)
            .delete_with_cascade("f1", EntityType::Fact)
            .await?;

        // The mentioned entity goes with the fact; the conversation it came from stays
        assert_eq!(result.deleted_keys, BTreeSet::from([fact, entity("alice")]));
        assert!(store.get_node(&conversation).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_reference_added_after_detection_aborts_cascade() -> Result<()> {
        let store = build_graph(&[("a", "b")]).await?;
        let late_edge = GraphEdge::new(EdgeType::RelatesTo, entity("x"), entity("b"), entity("x"));
        // A concurrent upsert links x to b between detection and the delete batch
        store.interleave_before_next_batch(vec![
            GraphOperation::MergeNode(NodeUpsert {
                key: entity("x"),
                properties: PropertyMap::new(),
                source_version: 1,
            }),
            GraphOperation::CreateEdge {
                edge: late_edge.clone(),
            },
        ]);
        let cascader = cascader(&store);

        let err = cascader
            .delete_with_cascade("a", EntityType::ExtractedEntity)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));
        assert!(err.is_transient());
        assert!(store.get_node(&entity("a")).await?.is_some());

        // The retry sees x and keeps b
        let result = cascader
            .delete_with_cascade("a", EntityType::ExtractedEntity)
            .await?;
        assert_eq!(result.deleted_keys, keys(&["a"]));
        assert!(store.get_node(&entity("b")).await?.is_some());
        assert_eq!(
            store.find_edges(EdgeFilter::incoming(&entity("b"))).await?,
            vec![late_edge]
        );
        Ok(())
    }
}
