//! Sync Services
//!
//! This module contains the business logic of graph synchronization:
//!
//! - `EntitySynchronizer` - Version-guarded node upserts
//! - `RelationshipSynchronizer` - Reconciles the edges a node owns
//! - `OrphanDetector` - Finds nodes that lose their last anchor on deletion
//! - `DeleteCascader` - Deletes a node and its orphans in one batch
//! - `SyncWorker` - Background consumer of the sync queue
//! - `GraphSyncEngine` - Facade tying queue, graph store and worker together
//!
//! Services depend on the `GraphStore` and `SyncQueue` traits from `db` and
//! never on a concrete backend.

pub mod delete_cascade;
pub mod engine;
pub mod entity_sync;
pub mod error;
pub mod health;
pub mod orphan_detector;
pub mod record_source;
pub mod relationship_sync;
pub mod sync_worker;

pub use delete_cascade::{CascadeResult, DeleteCascader};
pub use engine::{GraphSyncEngine, SyncOptions};
pub use entity_sync::{EntitySynchronizer, UpsertDisposition, UpsertPlan};
pub use error::SyncError;
pub use health::{SyncHealth, WorkerMetrics};
pub use orphan_detector::{DeletionContext, OrphanDetector, OrphanReport};
pub use record_source::{MemoryRecordSource, RecordSource};
pub use relationship_sync::{EdgePlan, EdgeReconciliation, RelationshipSynchronizer};
pub use sync_worker::{ItemOutcome, ItemProcessor, SyncWaker, SyncWorker};
