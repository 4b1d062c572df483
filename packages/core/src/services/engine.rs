//! Graph Sync Engine
//!
//! Entry point for the surrounding SDK layers. Owns the queue, the graph store
//! (behind a per-call deadline), the record source and at most one running
//! worker. Several engines can coexist in one process; nothing is global.
//!
//! # Usage
//!
//! ```rust,no_run
//! use memgraph_sync_core::config::EngineConfig;
//! use memgraph_sync_core::db::{MemoryGraphStore, MemorySyncQueue};
//! use memgraph_sync_core::models::{EntityType, SyncOperation};
//! use memgraph_sync_core::services::{GraphSyncEngine, MemoryRecordSource, SyncOptions};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let engine = GraphSyncEngine::new(
//!     Arc::new(MemorySyncQueue::new()),
//!     Arc::new(MemoryGraphStore::new()),
//!     Arc::new(MemoryRecordSource::new()),
//!     config.clone(),
//! );
//!
//! engine.start_worker(config.worker).await?;
//! engine
//!     .enqueue_sync(EntityType::Fact, "fact-1", SyncOperation::Upsert, 1, &SyncOptions::default())
//!     .await?;
//! println!("{:?}", engine.get_health().await?);
//! engine.stop_worker().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{EngineConfig, WorkerConfig};
use crate::db::{GraphStore, SyncQueue, TimeoutGraphStore};
use crate::models::{ChangeEvent, EntityType, NodeKey, NewSyncItem, SyncOperation, SyncQueueItem};
use crate::services::delete_cascade::CascadeResult;
use crate::services::error::SyncError;
use crate::services::health::{SyncHealth, WorkerMetrics};
use crate::services::orphan_detector::OrphanReport;
use crate::services::record_source::RecordSource;
use crate::services::sync_worker::{ItemProcessor, SyncWorker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Per-call enqueue options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// When false the change is not projected into the graph (default: true)
    pub sync_to_graph: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sync_to_graph: true,
        }
    }
}

impl SyncOptions {
    pub fn skip_graph() -> Self {
        Self {
            sync_to_graph: false,
        }
    }
}

pub struct GraphSyncEngine {
    queue: Arc<dyn SyncQueue>,
    store: Arc<dyn GraphStore>,
    config: EngineConfig,
    metrics: Arc<WorkerMetrics>,
    processor: Arc<ItemProcessor>,
    worker: Mutex<Option<SyncWorker>>,
}

impl GraphSyncEngine {
    /// Build an engine; `store` is wrapped with `config.call_timeout()`
    pub fn new(
        queue: Arc<dyn SyncQueue>,
        store: Arc<dyn GraphStore>,
        source: Arc<dyn RecordSource>,
        config: EngineConfig,
    ) -> Self {
        let store: Arc<dyn GraphStore> =
            Arc::new(TimeoutGraphStore::new(store, config.call_timeout()));
        let processor = Arc::new(ItemProcessor::new(
            source,
            store.clone(),
            config.orphan.clone(),
        ));

        Self {
            queue,
            store,
            config,
            metrics: Arc::new(WorkerMetrics::new()),
            processor,
            worker: Mutex::new(None),
        }
    }

    /// Graph store as seen by the engine (with deadlines applied)
    pub fn graph(&self) -> Arc<dyn GraphStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn SyncQueue> {
        self.queue.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    //
    // ENQUEUE
    //

    /// Record a primary-store change for projection
    ///
    /// Returns `None` without touching the queue when `options.sync_to_graph`
    /// is false.
    ///
    /// # Errors
    ///
    /// - `SyncError::InvalidEntity` for an empty stable key
    /// - `SyncError::Queue` if the queue cannot be written
    pub async fn enqueue_sync(
        &self,
        entity_type: EntityType,
        stable_key: &str,
        operation: SyncOperation,
        version: u64,
        options: &SyncOptions,
    ) -> Result<Option<SyncQueueItem>, SyncError> {
        if !options.sync_to_graph {
            tracing::debug!(entity_type = %entity_type, stable_key, "Graph sync disabled for call");
            return Ok(None);
        }

        let item = NewSyncItem::new(entity_type, stable_key, operation, version)?;
        let queued = self.queue.enqueue(item).await?;
        tracing::debug!(
            item_id = queued.item_id,
            key = %queued.key,
            operation = %queued.operation,
            "Enqueued sync item"
        );
        Ok(Some(queued))
    }

    pub async fn enqueue_change(
        &self,
        event: ChangeEvent,
        options: &SyncOptions,
    ) -> Result<Option<SyncQueueItem>, SyncError> {
        self.enqueue_sync(
            event.entity_type,
            &event.stable_key,
            event.operation,
            event.version,
            options,
        )
        .await
    }

    /// Enqueue every event of a primary-store change feed
    ///
    /// The spawned task ends when the feed's sender is dropped. Events the
    /// task lagged behind on are lost and logged.
    pub fn listen_for_changes(
        &self,
        mut feed: broadcast::Receiver<ChangeEvent>,
        options: SyncOptions,
    ) -> JoinHandle<()> {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) => {
                        if !options.sync_to_graph {
                            continue;
                        }
                        let item = match event.into_new_item() {
                            Ok(item) => item,
                            Err(e) => {
                                tracing::warn!("Ignoring invalid change event: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = queue.enqueue(item).await {
                            tracing::error!("Failed to enqueue change event: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Change feed lagged; {} events were not enqueued", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("Change feed closed");
                        break;
                    }
                }
            }
        })
    }

    //
    // WORKER LIFECYCLE
    //

    /// Start the background worker
    ///
    /// # Errors
    ///
    /// `SyncError::WorkerAlreadyRunning` if this engine's worker is running.
    pub async fn start_worker(&self, config: WorkerConfig) -> Result<(), SyncError> {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().map_or(false, SyncWorker::is_running) {
            return Err(SyncError::WorkerAlreadyRunning);
        }

        *worker = Some(SyncWorker::start(
            self.queue.clone(),
            self.processor.clone(),
            config,
            self.metrics.clone(),
        ));
        Ok(())
    }

    /// Stop the worker gracefully; returns false if none was running
    pub async fn stop_worker(&self) -> bool {
        let worker = self.worker.lock().await.take();
        match worker {
            Some(worker) => {
                worker.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.metrics.is_running()
    }

    /// Wake the worker now instead of at its next event or poll
    ///
    /// Returns false when no worker is running.
    pub async fn wake_worker(&self) -> bool {
        match self.worker.lock().await.as_ref() {
            Some(worker) => worker.wake(),
            None => false,
        }
    }

    //
    // HEALTH & OPERATIONS
    //

    pub async fn get_health(&self) -> Result<SyncHealth, SyncError> {
        let stats = self.queue.stats().await?;
        Ok(self.metrics.snapshot(stats).await)
    }

    /// Wait until no item is pending or in flight
    ///
    /// Returns false if `timeout` elapsed first. Items in delayed retry count
    /// as pending.
    pub async fn drain(&self, timeout: Duration) -> Result<bool, SyncError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.queue.stats().await?.outstanding() == 0 {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Re-arm a terminally failed item
    pub async fn retry_failed(&self, item_id: i64) -> Result<SyncQueueItem, SyncError> {
        Ok(self.queue.retry_failed(item_id).await?)
    }

    /// Drop completed items older than `older_than`
    pub async fn purge_done(&self, older_than: DateTime<Utc>) -> Result<u64, SyncError> {
        Ok(self.queue.purge_done(older_than).await?)
    }

    /// Cascade delete immediately, bypassing the queue
    pub async fn delete_with_cascade(
        &self,
        stable_key: &str,
        entity_type: EntityType,
    ) -> Result<CascadeResult, SyncError> {
        self.processor
            .cascader()
            .delete_with_cascade(stable_key, entity_type)
            .await
    }

    /// Diagnostic: what deleting `deletion_set` would orphan
    pub async fn find_orphans(
        &self,
        deletion_set: &BTreeSet<NodeKey>,
    ) -> Result<OrphanReport, SyncError> {
        self.processor
            .cascader()
            .detector()
            .find_orphans(deletion_set)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryGraphStore, MemorySyncQueue};
    use crate::services::record_source::MemoryRecordSource;

    fn engine() -> (GraphSyncEngine, Arc<MemorySyncQueue>) {
        let queue = Arc::new(MemorySyncQueue::new());
        let engine = GraphSyncEngine::new(
            queue.clone(),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(MemoryRecordSource::new()),
            EngineConfig::default(),
        );
        (engine, queue)
    }

    #[tokio::test]
    async fn test_sync_options_gate_enqueue() {
        let (engine, queue) = engine();

        let skipped = engine
            .enqueue_sync(
                EntityType::Fact,
                "f1",
                SyncOperation::Upsert,
                1,
                &SyncOptions::skip_graph(),
            )
            .await
            .unwrap();
        assert!(skipped.is_none());
        assert_eq!(queue.stats().await.unwrap().pending, 0);

        let queued = engine
            .enqueue_sync(
                EntityType::Fact,
                "f1",
                SyncOperation::Upsert,
                1,
                &SyncOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.key.stable_key, "f1");
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let (engine, _queue) = engine();
        let err = engine
            .enqueue_sync(
                EntityType::Fact,
                "",
                SyncOperation::Upsert,
                1,
                &SyncOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidEntity(_)));
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let (engine, _queue) = engine();
        assert!(!engine.is_running());
        assert!(!engine.stop_worker().await);

        engine.start_worker(WorkerConfig::default()).await.unwrap();
        assert!(engine.is_running());
        assert!(matches!(
            engine.start_worker(WorkerConfig::default()).await,
            Err(SyncError::WorkerAlreadyRunning)
        ));

        assert!(engine.stop_worker().await);
        assert!(!engine.is_running());
        assert!(!engine.get_health().await.unwrap().worker_running);

        // Restartable after stop
        engine.start_worker(WorkerConfig::default()).await.unwrap();
        assert!(engine.stop_worker().await);
    }

    #[tokio::test]
    async fn test_change_feed_is_enqueued() {
        let (engine, queue) = engine();
        let (tx, rx) = broadcast::channel(16);
        let listener = engine.listen_for_changes(rx, SyncOptions::default());

        tx.send(ChangeEvent {
            entity_type: EntityType::User,
            stable_key: "u1".into(),
            operation: SyncOperation::Upsert,
            version: 1,
        })
        .unwrap();
        drop(tx);
        listener.await.unwrap();

        let items = queue.list(None, 10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, NodeKey::new(EntityType::User, "u1").unwrap());
    }
}
