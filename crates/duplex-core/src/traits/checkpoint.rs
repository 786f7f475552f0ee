use crate::error::Result;
use crate::types::ReconcileCheckpoint;

/// Persistence for reconciler resume points, one per collection.
///
/// Only the holder of the reconciler run-lock writes here.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, collection: &str) -> Result<Option<ReconcileCheckpoint>>;

    fn save(&self, checkpoint: &ReconcileCheckpoint) -> Result<()>;

    /// Forget the resume point so the next pass starts from the beginning.
    fn clear(&self, collection: &str) -> Result<()>;
}
