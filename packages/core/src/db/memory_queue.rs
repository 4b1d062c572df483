//! In-process `SyncQueue` implementation
//!
//! Items live in a `BTreeMap` keyed by `item_id`, so iteration order is
//! enqueue order. Nothing survives the process; use `LibsqlSyncQueue` where
//! crash recovery matters.

use crate::db::error::DatabaseError;
use crate::db::events::QueueEvent;
use crate::db::sync_queue::{SyncQueue, QUEUE_EVENT_CAPACITY};
use crate::models::{NewSyncItem, NodeKey, QueueStats, SyncQueueItem, SyncStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::{broadcast, Mutex};

#[derive(Debug, Default)]
struct QueueState {
    items: BTreeMap<i64, SyncQueueItem>,
    next_id: i64,
}

impl QueueState {
    fn item_mut(&mut self, item_id: i64) -> Result<&mut SyncQueueItem, DatabaseError> {
        self.items
            .get_mut(&item_id)
            .ok_or(DatabaseError::ItemNotFound(item_id))
    }
}

pub struct MemorySyncQueue {
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
}

impl Default for MemorySyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySyncQueue {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(QUEUE_EVENT_CAPACITY);
        Self {
            state: Mutex::new(QueueState {
                items: BTreeMap::new(),
                next_id: 1,
            }),
            events,
        }
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine; the worker may not be running yet
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SyncQueue for MemorySyncQueue {
    async fn enqueue(&self, item: NewSyncItem) -> Result<SyncQueueItem, DatabaseError> {
        let now = Utc::now();
        let queued = {
            let mut state = self.state.lock().await;
            let item_id = state.next_id;
            state.next_id += 1;

            let queued = SyncQueueItem {
                item_id,
                key: item.key,
                operation: item.operation,
                source_version: item.source_version,
                enqueued_at: now,
                status: SyncStatus::Pending,
                attempts: 0,
                last_error: None,
                next_attempt_at: now,
                updated_at: now,
            };
            state.items.insert(item_id, queued.clone());
            queued
        };

        self.emit(QueueEvent::Enqueued {
            item_id: queued.item_id,
            key: queued.key.clone(),
        });
        Ok(queued)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncQueueItem>, DatabaseError> {
        let mut state = self.state.lock().await;
        let mut seen_keys: HashSet<NodeKey> = HashSet::new();
        let mut claimed = Vec::new();

        for item in state.items.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if item.status.is_terminal() {
                continue;
            }
            // Only the head non-terminal item of each key is eligible
            if !seen_keys.insert(item.key.clone()) {
                continue;
            }
            if item.status == SyncStatus::Pending && item.next_attempt_at <= now {
                item.status = SyncStatus::InFlight;
                item.updated_at = now;
                claimed.push(item.clone());
            }
        }

        Ok(claimed)
    }

    async fn mark_done(&self, item_id: i64) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().await;
        let item = state.item_mut(item_id)?;
        item.status = SyncStatus::Done;
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_retry(
        &self,
        item_id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<SyncQueueItem, DatabaseError> {
        let updated = {
            let mut state = self.state.lock().await;
            let item = state.item_mut(item_id)?;
            item.status = SyncStatus::Pending;
            item.attempts += 1;
            item.last_error = Some(error.to_string());
            item.next_attempt_at = next_attempt_at;
            item.updated_at = Utc::now();
            item.clone()
        };

        self.emit(QueueEvent::Retried { item_id });
        Ok(updated)
    }

    async fn mark_failed(&self, item_id: i64, error: &str) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().await;
        let item = state.item_mut(item_id)?;
        item.status = SyncStatus::Failed;
        item.attempts += 1;
        item.last_error = Some(error.to_string());
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn requeue_in_flight(&self) -> Result<u64, DatabaseError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut recovered = 0;
        for item in state.items.values_mut() {
            if item.status == SyncStatus::InFlight {
                item.status = SyncStatus::Pending;
                item.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn retry_failed(&self, item_id: i64) -> Result<SyncQueueItem, DatabaseError> {
        let rearmed = {
            let mut state = self.state.lock().await;
            let item = state
                .items
                .get_mut(&item_id)
                .filter(|item| item.status == SyncStatus::Failed)
                .ok_or(DatabaseError::ItemNotFound(item_id))?;
            let now = Utc::now();
            item.status = SyncStatus::Pending;
            item.attempts = 0;
            item.next_attempt_at = now;
            item.updated_at = now;
            item.clone()
        };

        self.emit(QueueEvent::Rearmed { item_id });
        Ok(rearmed)
    }

    async fn purge_done(&self, older_than: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state
            .items
            .retain(|_, item| !(item.status == SyncStatus::Done && item.updated_at < older_than));
        Ok((before - state.items.len()) as u64)
    }

    async fn stats(&self) -> Result<QueueStats, DatabaseError> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for item in state.items.values() {
            match item.status {
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::InFlight => stats.in_flight += 1,
                SyncStatus::Done => stats.done += 1,
                SyncStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let state = self.state.lock().await;
        let mut seen_keys: HashSet<NodeKey> = HashSet::new();
        Ok(state
            .items
            .values()
            .filter(|item| !item.status.is_terminal())
            .filter(|item| seen_keys.insert(item.key.clone()))
            .filter(|item| item.status == SyncStatus::Pending)
            .map(|item| item.next_attempt_at)
            .min())
    }

    async fn get(&self, item_id: i64) -> Result<Option<SyncQueueItem>, DatabaseError> {
        Ok(self.state.lock().await.items.get(&item_id).cloned())
    }

    async fn list(
        &self,
        status: Option<SyncStatus>,
        limit: usize,
    ) -> Result<Vec<SyncQueueItem>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .filter(|item| status.map_or(true, |s| item.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}
