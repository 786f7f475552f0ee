pub mod compensation;
pub mod drift;
pub mod record;
pub mod routing;
pub mod row;
pub mod write;

pub use compensation::{CompensationOp, CompensationPayload, CompensationTask, TaskId};
pub use drift::{DriftReport, ReconcileCheckpoint};
pub use record::{Attributes, Record, Revision};
pub use routing::{Feature, RoutingDecision, StructuralFeatureSet, Target};
pub use row::{ColumnValue, Predicate, Row, RowMutation};
pub use write::{WriteOp, WriteOutcome, WriteReceipt, WriteState};
