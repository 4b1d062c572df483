//! MemGraph Sync Core
//!
//! Keeps a property-graph projection of a layered memory store consistent with
//! the store as records are created, updated and deleted.
//!
//! # Architecture
//!
//! - **Durable queue**: every primary-store change becomes one sync queue item
//! - **Reactive worker**: drains the queue in batches with bounded parallelism
//! - **Idempotent projection**: version-guarded node merges and owned-edge
//!   reconciliation, safe under at-least-once delivery
//! - **Orphan-safe deletes**: cycle-aware, depth-bounded orphan detection and
//!   atomic cascade deletion
//!
//! # Modules
//!
//! - [`models`] - Data structures (graph keys, nodes, edges, queue items, records)
//! - [`db`] - Graph Store Port, its adapters, and the sync queue
//! - [`services`] - Synchronizers, orphan detection, worker and engine facade
//! - [`config`] - Engine and worker configuration

pub mod config;
pub mod db;
pub mod models;
pub mod services;

// Re-export commonly used types
pub use config::{EngineConfig, OrphanDetectorConfig, SubscriptionMode, WorkerConfig};
pub use models::*;
pub use services::*;
