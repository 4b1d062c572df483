//! Sync Health
//!
//! `WorkerMetrics` is shared between the worker's item tasks and the engine.
//! `SyncHealth` is the snapshot returned by `GraphSyncEngine::get_health`,
//! combining those counters with the queue's current status counts.

use crate::models::QueueStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Counters updated by the sync worker
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    processed_total: AtomicU64,
    retried_total: AtomicU64,
    failed_total: AtomicU64,
    cascade_deleted_total: AtomicU64,
    running: AtomicBool,
    last_processed_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_done(&self, cascade_deleted: usize) {
        self.processed_total.fetch_add(1, Ordering::Relaxed);
        self.cascade_deleted_total
            .fetch_add(cascade_deleted as u64, Ordering::Relaxed);
        *self.last_processed_at.write().await = Some(Utc::now());
    }

    pub async fn record_retry(&self, error: &str) {
        self.retried_total.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write().await = Some(error.to_string());
    }

    pub async fn record_failure(&self, error: &str) {
        self.failed_total.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write().await = Some(error.to_string());
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::Relaxed)
    }

    /// Combine the counters with queue status counts
    pub async fn snapshot(&self, stats: QueueStats) -> SyncHealth {
        SyncHealth {
            pending_count: stats.pending,
            in_flight_count: stats.in_flight,
            failed_count: stats.failed,
            done_count: stats.done,
            last_processed_at: *self.last_processed_at.read().await,
            processed_total: self.processed_total.load(Ordering::Relaxed),
            retried_total: self.retried_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            cascade_deleted_total: self.cascade_deleted_total.load(Ordering::Relaxed),
            last_error: self.last_error.read().await.clone(),
            worker_running: self.is_running(),
        }
    }
}

/// Point-in-time view of synchronization health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealth {
    pub pending_count: u64,
    pub in_flight_count: u64,
    /// Items that exhausted their retries or failed permanently
    pub failed_count: u64,
    pub done_count: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Items completed by this engine instance
    pub processed_total: u64,
    pub retried_total: u64,
    pub failed_total: u64,
    /// Graph nodes removed by cascades, targets included
    pub cascade_deleted_total: u64,
    pub last_error: Option<String>,
    pub worker_running: bool,
}

impl SyncHealth {
    /// No outstanding work and nothing failed
    pub fn is_idle_and_clean(&self) -> bool {
        self.pending_count == 0 && self.in_flight_count == 0 && self.failed_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_combines_counters_and_stats() {
        let metrics = WorkerMetrics::new();
        metrics.record_done(3).await;
        metrics.record_retry("backend down").await;
        metrics.set_running(true);

        let health = metrics
            .snapshot(QueueStats {
                pending: 2,
                in_flight: 1,
                done: 5,
                failed: 0,
            })
            .await;

        assert_eq!(health.pending_count, 2);
        assert_eq!(health.processed_total, 1);
        assert_eq!(health.retried_total, 1);
        assert_eq!(health.cascade_deleted_total, 3);
        assert_eq!(health.last_error.as_deref(), Some("backend down"));
        assert!(health.last_processed_at.is_some());
        assert!(health.worker_running);
        assert!(!health.is_idle_and_clean());
    }

    #[test]
    fn test_health_serializes_camel_case() {
        let health = SyncHealth {
            pending_count: 0,
            in_flight_count: 0,
            failed_count: 1,
            done_count: 0,
            last_processed_at: None,
            processed_total: 0,
            retried_total: 0,
            failed_total: 1,
            cascade_deleted_total: 0,
            last_error: None,
            worker_running: false,
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["failedCount"], 1);
        assert_eq!(json["workerRunning"], false);
    }
}
