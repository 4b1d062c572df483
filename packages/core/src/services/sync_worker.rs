//! Background Sync Worker
//!
//! Consumes the sync queue and projects each item into the graph:
//! - Event-driven: wakes on queue events (push mode) or on a fixed interval
//!   (poll mode), plus explicit wakes through `SyncWaker`
//! - Drains in batches: claims up to `batch_size` ready items, processes them
//!   with at most `concurrency` in parallel, repeats until nothing is ready
//! - Delayed retries: when only backed-off items remain, sleeps until the
//!   earliest of them is due
//! - Graceful shutdown: the batch in progress finishes, no new batch is claimed
//!
//! ## Per-Item Processing
//!
//! 1. **Upsert**: fetch the current record, plan the node merge and the edge
//!    diff, and apply both in one `run_batch`. A record that no longer exists
//!    completes the item; the delete that removed it has its own item.
//! 2. **Delete**: cascade delete through `DeleteCascader`, unless the graph
//!    already holds a newer version of the node.
//!
//! ## Outcomes
//!
//! Success marks the item done. A transient error schedules a retry after
//! `WorkerConfig::backoff(attempts)` until `max_attempts` is reached, then the
//! item fails terminally. A permanent error fails the item at once. Per-item
//! failures never abort the batch. A task that panics is treated as a
//! transient failure of its item, so the item is retried instead of being
//! left in flight.

use crate::config::{OrphanDetectorConfig, SubscriptionMode, WorkerConfig};
use crate::db::{GraphStore, QueueEvent, SyncQueue};
use crate::models::{NodeKey, SyncOperation, SyncQueueItem};
use crate::services::delete_cascade::{CascadeResult, DeleteCascader};
use crate::services::entity_sync::{EntitySynchronizer, UpsertDisposition};
use crate::services::error::SyncError;
use crate::services::health::WorkerMetrics;
use crate::services::record_source::RecordSource;
use crate::services::relationship_sync::RelationshipSynchronizer;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{self, JoinHandle, JoinSet};

/// Cloneable handle that starts a worker pass without waiting for the next
/// queue event or poll tick
///
/// The trigger channel holds a single pending wake. A pass drains every ready
/// item, so a wake that finds the slot taken is already covered.
#[derive(Clone)]
pub struct SyncWaker {
    trigger_tx: mpsc::Sender<()>,
}

impl SyncWaker {
    /// Request a pass; false once the worker has exited
    pub fn wake(&self) -> bool {
        match self.trigger_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => {
                tracing::debug!("Sync worker has exited; wake dropped");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.trigger_tx.is_closed()
    }
}

/// What processing one item did
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Upserted {
        disposition: UpsertDisposition,
        edges_created: usize,
        edges_deleted: usize,
        stubs_created: usize,
    },
    /// The primary store no longer has the record
    SourceMissing,
    Deleted(CascadeResult),
    /// The graph already holds a newer version; the delete was skipped
    StaleDelete,
}

impl ItemOutcome {
    /// Graph nodes removed by this item
    pub fn cascade_deleted(&self) -> usize {
        match self {
            ItemOutcome::Deleted(result) => result.deleted_keys.len(),
            _ => 0,
        }
    }
}

/// Processes one queue item end to end
pub struct ItemProcessor {
    source: Arc<dyn RecordSource>,
    store: Arc<dyn GraphStore>,
    entities: EntitySynchronizer,
    relationships: RelationshipSynchronizer,
    cascader: DeleteCascader,
}

impl ItemProcessor {
    pub fn new(
        source: Arc<dyn RecordSource>,
        store: Arc<dyn GraphStore>,
        orphan_config: OrphanDetectorConfig,
    ) -> Self {
        Self {
            entities: EntitySynchronizer::new(store.clone()),
            relationships: RelationshipSynchronizer::new(store.clone()),
            cascader: DeleteCascader::new(store.clone(), orphan_config),
            source,
            store,
        }
    }

    pub fn cascader(&self) -> &DeleteCascader {
        &self.cascader
    }

    pub async fn process(&self, item: &SyncQueueItem) -> Result<ItemOutcome, SyncError> {
        match item.operation {
            SyncOperation::Upsert => self.process_upsert(&item.key).await,
            SyncOperation::Delete => self.process_delete(&item.key, item.source_version).await,
        }
    }

    async fn process_upsert(&self, key: &NodeKey) -> Result<ItemOutcome, SyncError> {
        let Some(record) = self.source.fetch(key).await? else {
            tracing::debug!(key = %key, "Source record gone; skipping upsert");
            return Ok(ItemOutcome::SourceMissing);
        };

        let record_key = record.key()?;
        if &record_key != key {
            return Err(SyncError::invalid_entity(format!(
                "record source returned {} for {}",
                record_key, key
            )));
        }

        let plan = self
            .entities
            .plan_upsert(key, record.properties(), record.version())
            .await?;
        if !plan.disposition.reconciles_edges() {
            tracing::debug!(key = %key, version = record.version(), "Skipping stale upsert");
            return Ok(ItemOutcome::Upserted {
                disposition: plan.disposition,
                edges_created: 0,
                edges_deleted: 0,
                stubs_created: 0,
            });
        }

        let edge_plan = self.relationships.plan(key, record.derive_edges()?).await?;
        let operations: Vec<_> = plan
            .operation
            .into_iter()
            .chain(edge_plan.into_operations())
            .collect();

        if operations.is_empty() {
            return Ok(ItemOutcome::Upserted {
                disposition: plan.disposition,
                edges_created: 0,
                edges_deleted: 0,
                stubs_created: 0,
            });
        }

        // Node and edges land together or not at all
        let outcome = self.store.run_batch(operations).await?;
        tracing::debug!(
            key = %key,
            disposition = ?plan.disposition,
            edges_created = outcome.edges_created,
            edges_deleted = outcome.edges_deleted,
            stubs = outcome.stubs_created.len(),
            "Upsert applied"
        );

        Ok(ItemOutcome::Upserted {
            disposition: plan.disposition,
            edges_created: outcome.edges_created,
            edges_deleted: outcome.edges_deleted,
            stubs_created: outcome.stubs_created.len(),
        })
    }

    async fn process_delete(
        &self,
        key: &NodeKey,
        source_version: u64,
    ) -> Result<ItemOutcome, SyncError> {
        if let Some(node) = self.store.get_node(key).await? {
            if !node.is_stub && node.last_synced_version > source_version {
                tracing::debug!(
                    key = %key,
                    stored_version = node.last_synced_version,
                    source_version,
                    "Graph node is newer than delete; skipping"
                );
                return Ok(ItemOutcome::StaleDelete);
            }
        }
        Ok(ItemOutcome::Deleted(self.cascader.delete_key(key).await?))
    }
}

/// Shared state of the worker loop and its item tasks
#[derive(Clone)]
struct WorkerContext {
    queue: Arc<dyn SyncQueue>,
    processor: Arc<ItemProcessor>,
    config: WorkerConfig,
    metrics: Arc<WorkerMetrics>,
}

/// Owned handle to a running sync worker
///
/// Dropping the handle closes the shutdown channel, which stops the worker
/// after its current batch. `stop` does the same and also waits for it.
pub struct SyncWorker {
    waker: SyncWaker,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    metrics: Arc<WorkerMetrics>,
}

impl SyncWorker {
    /// Spawn the worker task
    ///
    /// Items a previous process left in flight are put back to pending before
    /// the first pass.
    pub fn start(
        queue: Arc<dyn SyncQueue>,
        processor: Arc<ItemProcessor>,
        config: WorkerConfig,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        tracing::info!(
            batch_size = config.batch_size,
            concurrency = config.concurrency,
            subscription = ?config.subscription,
            "SyncWorker starting"
        );

        let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let ctx = WorkerContext {
            queue,
            processor,
            config,
            metrics: metrics.clone(),
        };
        metrics.set_running(true);
        let handle = tokio::spawn(ctx.run(trigger_rx, shutdown_rx));

        Self {
            waker: SyncWaker { trigger_tx },
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            metrics,
        }
    }

    /// Cloneable waker for producers that want sub-poll latency in poll mode
    pub fn waker(&self) -> SyncWaker {
        self.waker.clone()
    }

    /// See [`SyncWaker::wake`]
    pub fn wake(&self) -> bool {
        self.waker.wake()
    }

    pub fn is_running(&self) -> bool {
        self.metrics.is_running()
            && self
                .handle
                .as_ref()
                .map_or(false, |handle| !handle.is_finished())
    }

    /// Stop gracefully and wait for the worker task to exit
    ///
    /// In-flight items complete; no new batch is claimed.
    pub async fn stop(mut self) {
        tracing::info!("Stopping SyncWorker");
        drop(self.shutdown_tx.take());
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!("SyncWorker task ended abnormally: {}", e);
                self.metrics.set_running(false);
            }
        }
    }
}

fn shutdown_requested(shutdown_rx: &mut mpsc::Receiver<()>) -> bool {
    !matches!(
        shutdown_rx.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    )
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<QueueEvent>>,
) -> Result<QueueEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl WorkerContext {
    async fn run(self, mut trigger_rx: mpsc::Receiver<()>, mut shutdown_rx: mpsc::Receiver<()>) {
        // Subscribe before the first drain so no enqueue falls between them
        let mut events = match self.config.subscription {
            SubscriptionMode::Push => Some(self.queue.subscribe()),
            SubscriptionMode::Poll { .. } => None,
        };

        match self.queue.requeue_in_flight().await {
            Ok(0) => {}
            Ok(recovered) => tracing::info!("Recovered {} in-flight items", recovered),
            Err(e) => tracing::warn!("Failed to recover in-flight items: {}", e),
        }

        loop {
            if shutdown_requested(&mut shutdown_rx) {
                break;
            }

            let drained = self.drain(&mut shutdown_rx).await;
            let delay = match drained {
                Ok(_) => self.next_wake_delay().await,
                Err(e) => {
                    tracing::warn!("Sync queue unavailable, backing off: {}", e);
                    self.config.poll_interval()
                }
            };

            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown_rx.recv() => {
                    break;
                }

                Some(()) = trigger_rx.recv() => {
                    tracing::debug!("SyncWorker woken up by trigger");
                }

                event = next_event(&mut events) => {
                    match event {
                        Ok(event) => {
                            tracing::debug!(
                                event = event.event_type(),
                                item_id = event.item_id(),
                                "SyncWorker woken up by queue event"
                            );
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::debug!("SyncWorker lagged {} queue events", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::warn!("Queue event channel closed; falling back to polling");
                            events = None;
                        }
                    }
                }

                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.metrics.set_running(false);
        tracing::info!("SyncWorker shutting down");
    }

    /// Claim and process batches until nothing is ready
    async fn drain(&self, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<usize, SyncError> {
        let mut total_processed = 0;

        loop {
            if shutdown_requested(shutdown_rx) {
                return Ok(total_processed);
            }

            let batch = self
                .queue
                .claim_batch(self.config.batch_size.max(1), Utc::now())
                .await?;
            if batch.is_empty() {
                if total_processed > 0 {
                    tracing::info!(
                        "SyncWorker finished - processed {} items",
                        total_processed
                    );
                }
                return Ok(total_processed);
            }

            total_processed += batch.len();
            self.process_batch(batch).await;
            tokio::task::yield_now().await;
        }
    }

    async fn process_batch(&self, batch: Vec<SyncQueueItem>) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut running: HashMap<task::Id, SyncQueueItem> = HashMap::new();

        for item in batch {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let ctx = self.clone();
            let claimed = item.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                ctx.handle_item(claimed).await;
            });
            running.insert(handle.id(), item);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, ())) => {
                    running.remove(&id);
                }
                Err(e) => {
                    let Some(item) = running.remove(&e.id()) else {
                        continue;
                    };
                    tracing::error!(
                        item_id = item.item_id,
                        key = %item.key,
                        "Sync task ended abnormally: {}",
                        e
                    );
                    self.record_failure(&item, SyncError::task_aborted(e.to_string()))
                        .await;
                }
            }
        }
    }

    async fn handle_item(&self, item: SyncQueueItem) {
        match self.processor.process(&item).await {
            Ok(outcome) => {
                if let Err(e) = self.queue.mark_done(item.item_id).await {
                    tracing::error!(item_id = item.item_id, "Failed to mark item done: {}", e);
                    return;
                }
                tracing::debug!(item_id = item.item_id, key = %item.key, ?outcome, "Item done");
                self.metrics.record_done(outcome.cascade_deleted()).await;
            }
            Err(err) => self.record_failure(&item, err).await,
        }
    }

    async fn record_failure(&self, item: &SyncQueueItem, err: SyncError) {
        let message = err.to_string();
        let attempts = item.attempts + 1;

        if err.is_transient() && attempts < self.config.max_attempts {
            let delay = self.config.backoff(item.attempts);
            let retry_in = chrono::Duration::from_std(delay).unwrap_or_else(|_| {
                chrono::Duration::milliseconds(self.config.backoff_max_ms as i64)
            });
            let next_attempt_at = Utc::now() + retry_in;

            match self
                .queue
                .mark_retry(item.item_id, &message, next_attempt_at)
                .await
            {
                Ok(_) => {
                    tracing::warn!(
                        item_id = item.item_id,
                        key = %item.key,
                        attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        "Sync item failed, will retry: {}",
                        message
                    );
                    self.metrics.record_retry(&message).await;
                }
                Err(e) => {
                    tracing::error!(item_id = item.item_id, "Failed to schedule retry: {}", e);
                }
            }
            return;
        }

        match self.queue.mark_failed(item.item_id, &message).await {
            Ok(()) => {
                tracing::error!(
                    item_id = item.item_id,
                    key = %item.key,
                    attempts,
                    transient = err.is_transient(),
                    "Sync item failed permanently: {}",
                    message
                );
                self.metrics.record_failure(&message).await;
            }
            Err(e) => {
                tracing::error!(item_id = item.item_id, "Failed to mark item failed: {}", e);
            }
        }
    }

    /// How long to sleep before the next pass if nothing wakes the worker
    async fn next_wake_delay(&self) -> Duration {
        let poll = self.config.poll_interval();
        match self.queue.next_ready_at().await {
            Ok(Some(ready_at)) => (ready_at - Utc::now())
                .to_std()
                .map(|until_ready| until_ready.min(poll))
                .unwrap_or(Duration::ZERO),
            Ok(None) => poll,
            Err(e) => {
                tracing::warn!("Failed to read next retry time: {}", e);
                poll
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryGraphStore, MemorySyncQueue};
    use crate::models::{EntityType, LayerRecord, NewSyncItem, SyncStatus, UserRecord};
    use crate::services::record_source::MemoryRecordSource;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Record source whose first fetch panics
    struct PanickingSource {
        inner: MemoryRecordSource,
        panicked: AtomicBool,
    }

    #[async_trait::async_trait]
    impl RecordSource for PanickingSource {
        async fn fetch(&self, key: &NodeKey) -> Result<Option<LayerRecord>, SyncError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("record source blew up on {}", key);
            }
            self.inner.fetch(key).await
        }
    }

    fn user(id: &str, version: u64) -> LayerRecord {
        LayerRecord::User(UserRecord {
            user_id: id.to_string(),
            version,
            display_name: Some(format!("User {id}")),
        })
    }

    fn setup() -> (Arc<MemoryRecordSource>, Arc<MemoryGraphStore>, ItemProcessor) {
        let source = Arc::new(MemoryRecordSource::new());
        let store = Arc::new(MemoryGraphStore::new());
        let processor =
            ItemProcessor::new(source.clone(), store.clone(), OrphanDetectorConfig::default());
        (source, store, processor)
    }

    fn queued(key: NodeKey, operation: SyncOperation, version: u64) -> SyncQueueItem {
        let now = Utc::now();
        SyncQueueItem {
            item_id: 1,
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
    async fn test_processor_upsert_and_replay() {
        let (source, store, processor) = setup();
        let key = source.insert(user("u1", 1)).await.unwrap();
        let item = queued(key.clone(), SyncOperation::Upsert, 1);

        let first = processor.process(&item).await.unwrap();
        assert!(matches!(
            first,
            ItemOutcome::Upserted {
                disposition: UpsertDisposition::Created,
                ..
            }
        ));

        let batches = store.batches_applied();
        let replay = processor.process(&item).await.unwrap();
        assert!(matches!(
            replay,
            ItemOutcome::Upserted {
                disposition: UpsertDisposition::Replay,
                ..
            }
        ));
        assert_eq!(store.batches_applied(), batches);
        assert_eq!(store.count_nodes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_processor_missing_record_completes() {
        let (_source, store, processor) = setup();
        let key = NodeKey::new(EntityType::User, "ghost").unwrap();

        let outcome = processor
            .process(&queued(key, SyncOperation::Upsert, 1))
            .await
            .unwrap();
        assert_eq!(outcome, ItemOutcome::SourceMissing);
        assert_eq!(store.count_nodes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_processor_skips_delete_older_than_graph() {
        let (source, store, processor) = setup();
        let key = source.insert(user("u1", 5)).await.unwrap();
        processor
            .process(&queued(key.clone(), SyncOperation::Upsert, 5))
            .await
            .unwrap();

        let outcome = processor
            .process(&queued(key.clone(), SyncOperation::Delete, 3))
            .await
            .unwrap();
        assert_eq!(outcome, ItemOutcome::StaleDelete);
        assert!(store.get_node(&key).await.unwrap().is_some());

        let outcome = processor
            .process(&queued(key.clone(), SyncOperation::Delete, 6))
            .await
            .unwrap();
        assert_eq!(outcome.cascade_deleted(), 1);
    }

    #[tokio::test]
    async fn test_worker_drains_and_stops() {
        let (source, store, processor) = setup();
        let queue = Arc::new(MemorySyncQueue::new());
        let metrics = Arc::new(WorkerMetrics::new());

        let worker = SyncWorker::start(
            queue.clone(),
            Arc::new(processor),
            WorkerConfig::default(),
            metrics.clone(),
        );
        assert!(worker.is_running());

        let key = source.insert(user("u1", 1)).await.unwrap();
        queue.enqueue(NewSyncItem::upsert(key.clone(), 1)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.stats().await.unwrap().done < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("item should be processed");

        assert!(store.get_node(&key).await.unwrap().is_some());
        worker.stop().await;
        assert!(!metrics.is_running());
        assert_eq!(metrics.processed_total(), 1);
    }

    async fn wait_for_done(queue: &MemorySyncQueue, done: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.stats().await.unwrap().done < done {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("items should be processed");
    }

    #[tokio::test]
    async fn test_wake_runs_pass_before_poll_tick() {
        let (source, store, processor) = setup();
        let queue = Arc::new(MemorySyncQueue::new());
        let worker = SyncWorker::start(
            queue.clone(),
            Arc::new(processor),
            WorkerConfig {
                subscription: SubscriptionMode::Poll { interval_ms: 60_000 },
                ..WorkerConfig::default()
            },
            Arc::new(WorkerMetrics::new()),
        );
        // Let the startup pass finish so the worker is parked on the poll timer
        tokio::time::sleep(Duration::from_millis(50)).await;

        let key = source.insert(user("u1", 1)).await.unwrap();
        queue.enqueue(NewSyncItem::upsert(key.clone(), 1)).await.unwrap();
        assert!(worker.wake());
        assert!(worker.wake(), "a second wake coalesces into the pending one");

        wait_for_done(&queue, 1).await;
        assert!(store.get_node(&key).await.unwrap().is_some());
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_wake_after_stop_is_rejected() {
        let (_source, _store, processor) = setup();
        let worker = SyncWorker::start(
            Arc::new(MemorySyncQueue::new()),
            Arc::new(processor),
            WorkerConfig::default(),
            Arc::new(WorkerMetrics::new()),
        );
        let waker = worker.waker();
        assert!(!waker.is_closed());

        worker.stop().await;
        assert!(waker.is_closed());
        assert!(!waker.wake());
    }

    #[tokio::test]
    async fn test_panicked_task_is_retried_not_stranded() {
        let source = Arc::new(PanickingSource {
            inner: MemoryRecordSource::new(),
            panicked: AtomicBool::new(false),
        });
        let store = Arc::new(MemoryGraphStore::new());
        let processor =
            ItemProcessor::new(source.clone(), store.clone(), OrphanDetectorConfig::default());
        let queue = Arc::new(MemorySyncQueue::new());
        let metrics = Arc::new(WorkerMetrics::new());

        let key = source.inner.insert(user("u1", 1)).await.unwrap();
        let item = queue.enqueue(NewSyncItem::upsert(key.clone(), 1)).await.unwrap();

        let worker = SyncWorker::start(
            queue.clone(),
            Arc::new(processor),
            WorkerConfig {
                backoff_base_ms: 10,
                backoff_max_ms: 50,
                ..WorkerConfig::default()
            },
            metrics.clone(),
        );
        wait_for_done(&queue, 1).await;
        worker.stop().await;

        let item = queue.get(item.item_id).await.unwrap().unwrap();
        assert_eq!(item.status, SyncStatus::Done);
        assert_eq!(item.attempts, 1);
        assert!(item
            .last_error
            .as_deref()
            .map_or(false, |e| e.contains("aborted")));
        assert!(store.get_node(&key).await.unwrap().is_some());

        let health = metrics.snapshot(queue.stats().await.unwrap()).await;
        assert_eq!(health.retried_total, 1);
        assert_eq!(health.failed_count, 0);
    }
}
