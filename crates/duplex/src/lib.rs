//! Duplex: one data-access façade over a document store and a relational store
//!
//! Duplex keeps two physically distinct stores eventually consistent:
//! - **Primary store**: schemaless documents with per-record revisions. Authoritative.
//! - **Secondary store**: relational rows for joins, grouping and aggregation
//! - **Routing**: reads go where their structural features fit best
//! - **Dual writes**: primary first, then secondary, with a compensation queue
//!   for secondary failures
//! - **Reconciliation**: background merge-join scans that find and repair drift
//!
//! # Quick Start
//!
//! ```no_run
//! use duplex::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let store = DuplexStore::open_sqlite(
//!     Arc::new(MemoryPrimaryStore::new()),
//!     SqliteConfig::new("./data/secondary.db"),
//!     DuplexConfig::default().with_collection("users"),
//! )?;
//!
//! // Dual write: primary, then secondary
//! let receipt = store
//!     .upsert(Record::new("users", "u1").with("name", "Alice"))
//!     .await?;
//! assert!(receipt.revision.is_some());
//!
//! // Relational reads are routed to the secondary store
//! let read = ReadRequest::new("users", StructuralFeatureSet::read().with(Feature::GroupBy))
//!     .with_predicate(Predicate::All);
//! let records = store.read(&read).await?;
//! println!("{} users", records.len());
//!
//! // Compensation worker and reconciler in the background
//! let background = store.spawn_background();
//! background.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod classifier;
pub mod compensation;
pub mod coordinator;
pub mod hooks;
pub mod memory;
pub mod prelude;
pub mod reconciler;
pub mod retry;
pub mod routing;
pub mod shutdown;
pub mod store;
pub mod translator;
pub mod worker;

// Re-export core types
pub use duplex_core::{
    config::{
        ConflictResolution, DuplexConfig, FeatureOverride, RoutingConfig, TranslatorConfig,
        WriteMode,
    },
    error::{BackendError, BackendErrorKind, DuplexError, Result},
    observe,
    traits::{
        BackendResult, CheckpointStore, NoopHooks, ObservabilityHooks, PrimaryStore,
        SecondaryStore,
    },
    types::{
        Attributes, ColumnValue, CompensationOp, CompensationPayload, CompensationTask,
        DriftReport, Feature, Predicate, Record, ReconcileCheckpoint, Revision, RoutingDecision,
        Row, RowMutation, StructuralFeatureSet, Target, TaskId, WriteOp, WriteOutcome,
        WriteReceipt, WriteState,
    },
};

// Re-export implementations
pub use duplex_sqlite::{SqliteCheckpointStore, SqliteConfig, SqliteSecondaryStore, SynchronousMode};

// Re-export main types from this crate
pub use checkpoint::MemoryCheckpointStore;
pub use classifier::QueryClassifier;
pub use compensation::{ClaimedTask, CompensationQueue, DeadLetter, Enqueued, LeaseToken};
pub use coordinator::{DualWriteCoordinator, WriteOptions};
pub use hooks::TracingHooks;
pub use memory::{MemoryPrimaryStore, MemorySecondaryStore};
pub use reconciler::{ConsistencyReconciler, ReconcilerConfig};
pub use retry::BackoffPolicy;
pub use routing::RoutingEngine;
pub use shutdown::ShutdownHandle;
pub use store::{BackgroundHandle, DuplexStore, DuplexStoreBuilder, ReadRequest};
pub use translator::SchemaTranslator;
pub use worker::{
    CompensationMetrics, CompensationMetricsSnapshot, CompensationStats, CompensationWorker,
    CompensationWorkerConfig,
};
