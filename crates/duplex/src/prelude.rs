//! Duplex Prelude
//!
//! Import this to get all commonly used types and traits:
//!
//! ```
//! use duplex::prelude::*;
//! ```

// Core types
pub use crate::{
    DriftReport, DuplexError, Record, Result, Revision, RoutingDecision, Row, Target,
    WriteReceipt, WriteState,
};

// Configs
pub use crate::{ConflictResolution, DuplexConfig, RoutingConfig, SqliteConfig, WriteMode};

// Traits
pub use crate::{CheckpointStore, ObservabilityHooks, PrimaryStore, SecondaryStore};

// Queries
pub use crate::{Feature, Predicate, ReadRequest, StructuralFeatureSet};

// Façade and components
pub use crate::{
    BackgroundHandle, CompensationWorker, CompensationWorkerConfig, ConsistencyReconciler,
    DualWriteCoordinator, DuplexStore, RoutingEngine, SchemaTranslator, WriteOptions,
};

// Implementations
pub use crate::{
    MemoryCheckpointStore, MemoryPrimaryStore, MemorySecondaryStore, SqliteCheckpointStore,
    SqliteSecondaryStore, TracingHooks,
};

// Re-export common external deps
pub use anyhow;
pub use serde::{Deserialize, Serialize};
pub use std::sync::Arc;
pub use tracing;
