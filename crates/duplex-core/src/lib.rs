//! Duplex Core: types and traits for the hybrid consistency layer
//!
//! One logical data-access façade backed by two stores:
//! - Primary store: schemaless documents, per-record revisions, authoritative
//! - Secondary store: relational rows for joins, grouping and aggregation
//!
//! This crate holds everything both sides agree on:
//! - The canonical [`Record`] and relational [`Row`] shapes
//! - Adapter traits ([`PrimaryStore`], [`SecondaryStore`], [`CheckpointStore`])
//! - The error taxonomy and the retryable [`BackendError`]
//! - Configuration and observability hooks

pub mod config;
pub mod error;
pub mod observe;
pub mod traits;
pub mod types;

pub use config::{
    ConflictResolution, DuplexConfig, FeatureOverride, RoutingConfig, TranslatorConfig, WriteMode,
};
pub use error::{BackendError, BackendErrorKind, DuplexError, Result};
pub use traits::{
    BackendResult, CheckpointStore, NoopHooks, ObservabilityHooks, PrimaryStore, SecondaryStore,
};
pub use types::{
    Attributes, ColumnValue, CompensationOp, CompensationPayload, CompensationTask, DriftReport,
    Feature, Predicate, Record, ReconcileCheckpoint, Revision, RoutingDecision, Row, RowMutation,
    StructuralFeatureSet, Target, TaskId, WriteOp, WriteOutcome, WriteReceipt, WriteState,
};
