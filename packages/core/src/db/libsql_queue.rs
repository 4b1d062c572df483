//! Durable Sync Queue on libsql
//!
//! Persists queue items in a single `sync_queue` table so pending work survives
//! restarts. The worker calls `requeue_in_flight` on start to recover items a
//! crashed process had claimed.
//!
//! # Schema
//!
//! - `sync_queue` - one row per item, `item_id` is `AUTOINCREMENT` so ids are
//!   never reused after a purge
//! - `idx_sync_queue_status(status, next_attempt_at)` - claim scans
//! - `idx_sync_queue_key(entity_type, stable_key, item_id)` - per-key head lookup
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microseconds, `Z`),
//! which sort lexicographically in time order.
//!
//! # Connections
//!
//! Every call opens its connection through `connect_with_timeout()`, which sets
//! a 5 second busy timeout. Claims run as one `UPDATE ... RETURNING` statement,
//! so two workers can never claim the same row.

use crate::db::error::DatabaseError;
use crate::db::events::QueueEvent;
use crate::db::sync_queue::{SyncQueue, QUEUE_EVENT_CAPACITY};
use crate::models::{NewSyncItem, NodeKey, QueueStats, SyncQueueItem, SyncStatus};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{params, Builder, Database};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

const ITEM_COLUMNS: &str = "item_id, entity_type, stable_key, operation, source_version, status, \
     attempts, enqueued_at, updated_at, next_attempt_at, last_error";

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(item_id: i64, raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::corrupt_row(item_id, format!("bad timestamp '{}': {}", raw, e)))
}

fn row_to_item(row: &libsql::Row) -> Result<SyncQueueItem, DatabaseError> {
    let item_id: i64 = row.get(0)?;
    let corrupt = |reason: String| DatabaseError::corrupt_row(item_id, reason);

    let entity_type: String = row.get(1)?;
    let stable_key: String = row.get(2)?;
    let operation: String = row.get(3)?;
    let source_version: i64 = row.get(4)?;
    let status: String = row.get(5)?;
    let attempts: i64 = row.get(6)?;
    let enqueued_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    let next_attempt_at: String = row.get(9)?;
    let last_error: Option<String> = row.get(10)?;

    let entity_type = entity_type.parse().map_err(|e| corrupt(format!("{}", e)))?;
    let key = NodeKey::new(entity_type, stable_key).map_err(|e| corrupt(format!("{}", e)))?;

    Ok(SyncQueueItem {
        item_id,
        key,
        operation: operation.parse().map_err(|e| corrupt(format!("{}", e)))?,
        source_version: u64::try_from(source_version)
            .map_err(|_| corrupt(format!("negative source_version {}", source_version)))?,
        enqueued_at: parse_timestamp(item_id, &enqueued_at)?,
        status: status.parse().map_err(|e| corrupt(format!("{}", e)))?,
        attempts: u32::try_from(attempts)
            .map_err(|_| corrupt(format!("attempts out of range: {}", attempts)))?,
        last_error,
        next_attempt_at: parse_timestamp(item_id, &next_attempt_at)?,
        updated_at: parse_timestamp(item_id, &updated_at)?,
    })
}

async fn collect_items(mut rows: libsql::Rows) -> Result<Vec<SyncQueueItem>, DatabaseError> {
    let mut items = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to read queue row: {}", e)))?
    {
        items.push(row_to_item(&row)?);
    }
    Ok(items)
}

/// `SyncQueue` backed by a libsql database file
#[derive(Clone)]
pub struct LibsqlSyncQueue {
    db: Arc<Database>,
    db_path: PathBuf,
    events: broadcast::Sender<QueueEvent>,
}

impl LibsqlSyncQueue {
    /// Open (or create) the queue database at `db_path`
    ///
    /// Creates the parent directory when missing and initializes the schema
    /// idempotently.
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        DatabaseError::permission_denied(db_path.clone())
                    } else {
                        DatabaseError::DirectoryCreationFailed(e)
                    }
                })?;
            }
        }

        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| DatabaseError::connection_failed(db_path.clone(), e))?;

        let (events, _) = broadcast::channel(QUEUE_EVENT_CAPACITY);
        let queue = Self {
            db: Arc::new(db),
            db_path,
            events,
        };
        queue.initialize_schema().await?;

        tracing::debug!(path = %queue.db_path.display(), "Sync queue database ready");
        Ok(queue)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// PRAGMA statements return rows, so they go through `query()`
    async fn execute_pragma(conn: &libsql::Connection, pragma: &str) -> Result<(), DatabaseError> {
        let mut stmt = conn.prepare(pragma).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        let _ = stmt.query(()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        Ok(())
    }

    async fn connect_with_timeout(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self.db.connect().map_err(DatabaseError::LibsqlError)?;
        Self::execute_pragma(&conn, "PRAGMA busy_timeout = 5000").await?;
        Ok(conn)
    }

    async fn initialize_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;
        Self::execute_pragma(&conn, "PRAGMA journal_mode = WAL").await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_queue (
                item_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                stable_key TEXT NOT NULL,
                operation TEXT NOT NULL,
                source_version INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                next_attempt_at TEXT NOT NULL,
                last_error TEXT
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::initialization_failed(format!("Failed to create sync_queue table: {}", e))
        })?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_status
             ON sync_queue(status, next_attempt_at)",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::initialization_failed(format!(
                "Failed to create idx_sync_queue_status: {}",
                e
            ))
        })?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_key
             ON sync_queue(entity_type, stable_key, item_id)",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::initialization_failed(format!(
                "Failed to create idx_sync_queue_key: {}",
                e
            ))
        })?;

        Ok(())
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    async fn query_items(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<SyncQueueItem>, DatabaseError> {
        let conn = self.connect_with_timeout().await?;
        let mut stmt = conn.prepare(sql).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to prepare {} query: {}", context, e))
        })?;
        let rows = stmt.query(params).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute {} query: {}", context, e))
        })?;
        collect_items(rows).await
    }

    async fn execute_update(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<u64, DatabaseError> {
        let conn = self.connect_with_timeout().await?;
        conn.execute(sql, params)
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to {}: {}", context, e)))
    }
}

#[async_trait]
impl SyncQueue for LibsqlSyncQueue {
    async fn enqueue(&self, item: NewSyncItem) -> Result<SyncQueueItem, DatabaseError> {
        let now = timestamp(Utc::now());
        let sql = format!(
            "INSERT INTO sync_queue
                (entity_type, stable_key, operation, source_version, status, attempts,
                 enqueued_at, updated_at, next_attempt_at)
             VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?)
             RETURNING {}",
            ITEM_COLUMNS
        );
        let queued = self
            .query_items(
                &sql,
                params![
                    item.key.entity_type.as_str(),
                    item.key.stable_key.clone(),
                    item.operation.as_str(),
                    item.source_version as i64,
                    now.clone(),
                    now.clone(),
                    now
                ],
                "enqueue",
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DatabaseError::sql_execution("enqueue returned no row"))?;

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
        let now = timestamp(now);
        // Eligible: pending, due, and no older non-terminal item for the same key
        let sql = format!(
            "UPDATE sync_queue SET status = 'inflight', updated_at = ?1
             WHERE item_id IN (
                 SELECT q.item_id FROM sync_queue q
                 WHERE q.status = 'pending'
                   AND q.next_attempt_at <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM sync_queue p
                       WHERE p.entity_type = q.entity_type
                         AND p.stable_key = q.stable_key
                         AND p.item_id < q.item_id
                         AND p.status IN ('pending', 'inflight')
                   )
                 ORDER BY q.item_id
                 LIMIT ?2
             )
             RETURNING {}",
            ITEM_COLUMNS
        );

        let mut claimed = self
            .query_items(&sql, params![now, limit as i64], "claim_batch")
            .await?;
        claimed.sort_by_key(|item| item.item_id);
        Ok(claimed)
    }

    async fn mark_done(&self, item_id: i64) -> Result<(), DatabaseError> {
        let changed = self
            .execute_update(
                "UPDATE sync_queue SET status = 'done', updated_at = ? WHERE item_id = ?",
                params![timestamp(Utc::now()), item_id],
                "mark item done",
            )
            .await?;
        if changed == 0 {
            return Err(DatabaseError::ItemNotFound(item_id));
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        item_id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<SyncQueueItem, DatabaseError> {
        let sql = format!(
            "UPDATE sync_queue
             SET status = 'pending', attempts = attempts + 1, last_error = ?,
                 next_attempt_at = ?, updated_at = ?
             WHERE item_id = ?
             RETURNING {}",
            ITEM_COLUMNS
        );
        let updated = self
            .query_items(
                &sql,
                params![
                    error.to_string(),
                    timestamp(next_attempt_at),
                    timestamp(Utc::now()),
                    item_id
                ],
                "mark_retry",
            )
            .await?
            .into_iter()
            .next()
            .ok_or(DatabaseError::ItemNotFound(item_id))?;

        self.emit(QueueEvent::Retried { item_id });
        Ok(updated)
    }

    async fn mark_failed(&self, item_id: i64, error: &str) -> Result<(), DatabaseError> {
        let changed = self
            .execute_update(
                "UPDATE sync_queue
                 SET status = 'failed', attempts = attempts + 1, last_error = ?, updated_at = ?
                 WHERE item_id = ?",
                params![error.to_string(), timestamp(Utc::now()), item_id],
                "mark item failed",
            )
            .await?;
        if changed == 0 {
            return Err(DatabaseError::ItemNotFound(item_id));
        }
        Ok(())
    }

    async fn requeue_in_flight(&self) -> Result<u64, DatabaseError> {
        self.execute_update(
            "UPDATE sync_queue SET status = 'pending', updated_at = ? WHERE status = 'inflight'",
            params![timestamp(Utc::now())],
            "requeue in-flight items",
        )
        .await
    }

    async fn retry_failed(&self, item_id: i64) -> Result<SyncQueueItem, DatabaseError> {
        let now = timestamp(Utc::now());
        let sql = format!(
            "UPDATE sync_queue
             SET status = 'pending', attempts = 0, next_attempt_at = ?1, updated_at = ?1
             WHERE item_id = ?2 AND status = 'failed'
             RETURNING {}",
            ITEM_COLUMNS
        );
        let rearmed = self
            .query_items(&sql, params![now, item_id], "retry_failed")
            .await?
            .into_iter()
            .next()
            .ok_or(DatabaseError::ItemNotFound(item_id))?;

        self.emit(QueueEvent::Rearmed { item_id });
        Ok(rearmed)
    }

    async fn purge_done(&self, older_than: DateTime<Utc>) -> Result<u64, DatabaseError> {
        self.execute_update(
            "DELETE FROM sync_queue WHERE status = 'done' AND updated_at < ?",
            params![timestamp(older_than)],
            "purge done items",
        )
        .await
    }

    async fn stats(&self) -> Result<QueueStats, DatabaseError> {
        let conn = self.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM sync_queue GROUP BY status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to query stats: {}", e)))?;

        let mut stats = QueueStats::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))?
        {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = count.max(0) as u64;
            match status.parse::<SyncStatus>() {
                Ok(SyncStatus::Pending) => stats.pending = count,
                Ok(SyncStatus::InFlight) => stats.in_flight = count,
                Ok(SyncStatus::Done) => stats.done = count,
                Ok(SyncStatus::Failed) => stats.failed = count,
                Err(e) => tracing::warn!("Ignoring unknown queue status in stats: {}", e),
            }
        }
        Ok(stats)
    }

    async fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let conn = self.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                "SELECT MIN(q.next_attempt_at) FROM sync_queue q
                 WHERE q.status = 'pending'
                   AND NOT EXISTS (
                       SELECT 1 FROM sync_queue p
                       WHERE p.entity_type = q.entity_type
                         AND p.stable_key = q.stable_key
                         AND p.item_id < q.item_id
                         AND p.status IN ('pending', 'inflight')
                   )",
                (),
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to query next_ready_at: {}", e))
            })?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))?
        else {
            return Ok(None);
        };
        let raw: Option<String> = row.get(0)?;
        raw.map(|raw| parse_timestamp(0, &raw)).transpose()
    }

    async fn get(&self, item_id: i64) -> Result<Option<SyncQueueItem>, DatabaseError> {
        let sql = format!("SELECT {} FROM sync_queue WHERE item_id = ?", ITEM_COLUMNS);
        Ok(self
            .query_items(&sql, params![item_id], "get")
            .await?
            .into_iter()
            .next())
    }

    async fn list(
        &self,
        status: Option<SyncStatus>,
        limit: usize,
    ) -> Result<Vec<SyncQueueItem>, DatabaseError> {
        match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM sync_queue WHERE status = ? ORDER BY item_id LIMIT ?",
                    ITEM_COLUMNS
                );
                self.query_items(&sql, params![status.as_str(), limit as i64], "list")
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM sync_queue ORDER BY item_id LIMIT ?",
                    ITEM_COLUMNS
                );
                self.query_items(&sql, params![limit as i64], "list").await
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;
    use tempfile::TempDir;

    async fn open() -> (LibsqlSyncQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let queue = LibsqlSyncQueue::new(dir.path().join("queue.db")).await.unwrap();
        (queue, dir)
    }

    fn key(id: &str) -> NodeKey {
        NodeKey::new(EntityType::Conversation, id).unwrap()
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(timestamp(early) < timestamp(late));
        assert_eq!(timestamp(early), "2026-01-01T09:00:00.000000Z");
    }

    #[tokio::test]
    async fn test_enqueue_and_get_round_trip() {
        let (queue, _dir) = open().await;
        let item = queue.enqueue(NewSyncItem::upsert(key("c1"), 4)).await.unwrap();

        assert_eq!(item.status, SyncStatus::Pending);
        assert_eq!(item.attempts, 0);
        let fetched = queue.get(item.item_id).await.unwrap().unwrap();
        assert_eq!(fetched.key, key("c1"));
        assert_eq!(fetched.source_version, 4);
    }

    #[tokio::test]
    async fn test_claim_enforces_per_key_order() {
        let (queue, _dir) = open().await;
        let first = queue.enqueue(NewSyncItem::upsert(key("c1"), 1)).await.unwrap();
        let second = queue.enqueue(NewSyncItem::delete(key("c1"), 2)).await.unwrap();
        let other = queue.enqueue(NewSyncItem::upsert(key("c2"), 1)).await.unwrap();

        let claimed = queue.claim_batch(10, Utc::now()).await.unwrap();
        let ids: Vec<i64> = claimed.iter().map(|i| i.item_id).collect();
        assert_eq!(ids, vec![first.item_id, other.item_id]);

        queue.mark_done(first.item_id).await.unwrap();
        let claimed = queue.claim_batch(10, Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].item_id, second.item_id);
        assert_eq!(claimed[0].status, SyncStatus::InFlight);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");

        let item_id = {
            let queue = LibsqlSyncQueue::new(path.clone()).await.unwrap();
            let item = queue.enqueue(NewSyncItem::upsert(key("c1"), 1)).await.unwrap();
            queue.claim_batch(1, Utc::now()).await.unwrap();
            item.item_id
        };

        let reopened = LibsqlSyncQueue::new(path).await.unwrap();
        assert_eq!(reopened.stats().await.unwrap().in_flight, 1);
        assert_eq!(reopened.requeue_in_flight().await.unwrap(), 1);

        let claimed = reopened.claim_batch(1, Utc::now()).await.unwrap();
        assert_eq!(claimed[0].item_id, item_id);
    }

    #[tokio::test]
    async fn test_retry_failed_and_purge() {
        let (queue, _dir) = open().await;
        let item = queue.enqueue(NewSyncItem::upsert(key("c1"), 1)).await.unwrap();
        queue.claim_batch(1, Utc::now()).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(30);
        let retried = queue.mark_retry(item.item_id, "timeout", later).await.unwrap();
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.last_error.as_deref(), Some("timeout"));
        assert!(queue.claim_batch(1, Utc::now()).await.unwrap().is_empty());
        assert!(queue.next_ready_at().await.unwrap().is_some());

        queue.claim_batch(1, later).await.unwrap();
        queue.mark_failed(item.item_id, "gave up").await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.outstanding(), 0);

        let rearmed = queue.retry_failed(item.item_id).await.unwrap();
        assert_eq!(rearmed.attempts, 0);
        queue.claim_batch(1, Utc::now()).await.unwrap();
        queue.mark_done(item.item_id).await.unwrap();

        let purged = queue
            .purge_done(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(queue.list(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_item_is_reported() {
        let (queue, _dir) = open().await;
        assert!(matches!(
            queue.mark_done(42).await,
            Err(DatabaseError::ItemNotFound(42))
        ));
    }
}
