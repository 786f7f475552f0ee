use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Record, Revision};

/// Identifier of a compensation task, unique within one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationOp {
    Upsert,
    Delete,
}

/// What the compensation worker replays against the secondary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompensationPayload {
    /// Post-write record as committed on the primary.
    Record(Record),
    /// Marker for a delete that already succeeded on the primary.
    Tombstone {
        id: String,
        revision: Option<Revision>,
    },
}

impl CompensationPayload {
    pub fn op(&self) -> CompensationOp {
        match self {
            CompensationPayload::Record(_) => CompensationOp::Upsert,
            CompensationPayload::Tombstone { .. } => CompensationOp::Delete,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            CompensationPayload::Record(record) => &record.id,
            CompensationPayload::Tombstone { id, .. } => id,
        }
    }
}

/// A secondary write that must be retried after the primary committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationTask {
    pub id: TaskId,
    pub collection: String,
    pub operation: CompensationOp,
    pub payload: CompensationPayload,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl CompensationTask {
    pub fn record_id(&self) -> &str {
        self.payload.record_id()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at <= now
    }
}
