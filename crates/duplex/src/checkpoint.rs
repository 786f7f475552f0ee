//! In-process reconciler checkpoints.

use duplex_core::{CheckpointStore, ReconcileCheckpoint, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Checkpoints kept in memory. A restart scans from the beginning; use
/// [`SqliteCheckpointStore`](duplex_sqlite::SqliteCheckpointStore) to resume
/// across restarts.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, ReconcileCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, collection: &str) -> Result<Option<ReconcileCheckpoint>> {
        Ok(self.checkpoints.read().get(collection).cloned())
    }

    fn save(&self, checkpoint: &ReconcileCheckpoint) -> Result<()> {
        self.checkpoints
            .write()
            .insert(checkpoint.collection.clone(), checkpoint.clone());
        Ok(())
    }

    fn clear(&self, collection: &str) -> Result<()> {
        self.checkpoints.write().remove(collection);
        Ok(())
    }
}
