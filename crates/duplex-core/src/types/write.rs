use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::types::{Revision, Target, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    Upsert,
    Delete,
}

/// Lifecycle of a single write.
///
/// ```text
/// Pending -> PrimaryWritten -> SecondaryWritten     (success)
///                           -> CompensationQueued   (partial success)
/// Pending -> Abandoned                              (failure)
/// Pending -> SecondaryWritten                       (secondary_only mode)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteState {
    Pending,
    PrimaryWritten,
    SecondaryWritten,
    CompensationQueued,
    Abandoned,
}

impl WriteState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WriteState::SecondaryWritten | WriteState::CompensationQueued | WriteState::Abandoned
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: WriteState) -> bool {
        use WriteState::*;
        matches!(
            (self, next),
            (Pending, PrimaryWritten)
                | (Pending, Abandoned)
                | (Pending, SecondaryWritten)
                | (PrimaryWritten, SecondaryWritten)
                | (PrimaryWritten, CompensationQueued)
        )
    }
}

/// Result of one write attempt against one store.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub target: Target,
    pub collection: String,
    pub id: String,
    pub op: WriteOp,
    pub success: bool,
    pub error: Option<BackendError>,
    /// Number of attempts made, including the successful one.
    pub attempt: u32,
}

impl WriteOutcome {
    pub fn succeeded(target: Target, collection: &str, id: &str, op: WriteOp, attempt: u32) -> Self {
        Self {
            target,
            collection: collection.to_string(),
            id: id.to_string(),
            op,
            success: true,
            error: None,
            attempt,
        }
    }

    pub fn failed(
        target: Target,
        collection: &str,
        id: &str,
        op: WriteOp,
        attempt: u32,
        error: BackendError,
    ) -> Self {
        Self {
            target,
            collection: collection.to_string(),
            id: id.to_string(),
            op,
            success: false,
            error: Some(error),
            attempt,
        }
    }
}

/// What the caller gets back from a successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReceipt {
    pub collection: String,
    pub id: String,
    pub op: WriteOp,
    /// New primary revision; `None` for deletes and secondary-only writes.
    pub revision: Option<Revision>,
    pub state: WriteState,
    pub outcomes: Vec<WriteOutcome>,
    /// Set when the secondary write was handed to the compensation queue.
    pub compensation: Option<TaskId>,
}

impl WriteReceipt {
    pub fn is_fully_replicated(&self) -> bool {
        self.state == WriteState::SecondaryWritten
    }
}
