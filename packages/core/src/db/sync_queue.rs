//! SyncQueue Trait - Durable Work Queue Abstraction
//!
//! The sync queue decouples primary-store writes from graph projection. Every
//! change notification becomes one item; the worker claims items in batches and
//! reports each outcome back.
//!
//! # Claim Rule
//!
//! Only the oldest non-terminal item of a key may be claimed, and only when it
//! is `Pending` and its `next_attempt_at` has passed. Consequences:
//!
//! - Items of one key are processed strictly in enqueue order
//! - At most one item per key is `InFlight` at any time
//! - A key waiting on a delayed retry holds back its later items, never other keys
//!
//! # Attempt Accounting
//!
//! `attempts` counts failed attempts. `mark_retry` and `mark_failed` both
//! increment it; a successful attempt leaves it unchanged.

use crate::db::error::DatabaseError;
use crate::db::events::QueueEvent;
use crate::models::{NewSyncItem, QueueStats, SyncQueueItem, SyncStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Capacity of the queue event broadcast channel
pub const QUEUE_EVENT_CAPACITY: usize = 256;

/// Abstraction over the persisted sync queue
#[async_trait]
pub trait SyncQueue: Send + Sync {
    //
    // PRODUCER
    //

    /// Append a new `Pending` item and notify subscribers
    async fn enqueue(&self, item: NewSyncItem) -> Result<SyncQueueItem, DatabaseError>;

    //
    // WORKER
    //

    /// Claim up to `limit` ready items, marking them `InFlight`
    ///
    /// Returned in `item_id` order.
    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncQueueItem>, DatabaseError>;

    async fn mark_done(&self, item_id: i64) -> Result<(), DatabaseError>;

    /// Return an item to `Pending`, not claimable before `next_attempt_at`
    async fn mark_retry(
        &self,
        item_id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<SyncQueueItem, DatabaseError>;

    /// Terminal failure; the item is never claimed again automatically
    async fn mark_failed(&self, item_id: i64, error: &str) -> Result<(), DatabaseError>;

    /// Put items a previous process left `InFlight` back to `Pending`
    ///
    /// Returns the number of items recovered.
    async fn requeue_in_flight(&self) -> Result<u64, DatabaseError>;

    //
    // OPERATOR
    //

    /// Re-arm a `Failed` item: back to `Pending`, attempts reset
    ///
    /// # Errors
    ///
    /// `DatabaseError::ItemNotFound` if no failed item has this id.
    async fn retry_failed(&self, item_id: i64) -> Result<SyncQueueItem, DatabaseError>;

    /// Delete `Done` items last updated before `older_than`
    async fn purge_done(&self, older_than: DateTime<Utc>) -> Result<u64, DatabaseError>;

    //
    // INSPECTION
    //

    async fn stats(&self) -> Result<QueueStats, DatabaseError>;

    /// Earliest time a claim could succeed
    ///
    /// Minimum `next_attempt_at` over `Pending` items that head their key.
    /// Items waiting behind an earlier item of the same key are not counted.
    async fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    async fn get(&self, item_id: i64) -> Result<Option<SyncQueueItem>, DatabaseError>;

    /// Items in `item_id` order, optionally restricted to one status
    async fn list(
        &self,
        status: Option<SyncStatus>,
        limit: usize,
    ) -> Result<Vec<SyncQueueItem>, DatabaseError>;

    /// Subscribe to work-availability events
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;
}
