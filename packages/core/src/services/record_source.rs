//! Record Source
//!
//! Read port onto the primary store. The worker fetches the current record for
//! a queue item at processing time rather than carrying a payload in the queue,
//! so a burst of updates to one entity always projects the newest state.

use crate::models::{LayerRecord, NodeKey};
use crate::services::error::SyncError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Current record for `key`, or `None` if the primary store no longer has it
    ///
    /// # Errors
    ///
    /// `SyncError::SourceUnavailable` when the primary store cannot be read.
    async fn fetch(&self, key: &NodeKey) -> Result<Option<LayerRecord>, SyncError>;
}

/// In-process record source backed by a map
#[derive(Debug, Default)]
pub struct MemoryRecordSource {
    records: RwLock<HashMap<NodeKey, LayerRecord>>,
    fail_next: AtomicUsize,
}

impl MemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a record; returns its key
    pub async fn insert(&self, record: LayerRecord) -> Result<NodeKey, SyncError> {
        let key = record.key()?;
        self.records.write().await.insert(key.clone(), record);
        Ok(key)
    }

    pub async fn remove(&self, key: &NodeKey) -> Option<LayerRecord> {
        self.records.write().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Make the next `count` fetches fail with `SyncError::SourceUnavailable`
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn fetch(&self, key: &NodeKey) -> Result<Option<LayerRecord>, SyncError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::source_unavailable("injected failure"));
        }
        Ok(self.records.read().await.get(key).cloned())
    }
}
