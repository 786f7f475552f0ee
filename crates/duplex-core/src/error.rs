use std::fmt;
use std::io;
use thiserror::Error;

use crate::types::Revision;

#[derive(Error, Debug)]
pub enum DuplexError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The primary store rejected the write because the caller's expected
    /// revision is stale. Retry with a fresh read.
    #[error("Revision conflict on {collection}/{id}: expected {expected:?}, found {actual:?}")]
    RevisionConflict {
        collection: String,
        id: String,
        expected: Option<Revision>,
        actual: Option<Revision>,
    },

    /// The primary write failed definitively. Nothing was written anywhere.
    #[error("Primary write failed: {0}")]
    PrimaryWrite(BackendError),

    /// The secondary write failed after the primary committed. Only surfaced
    /// by single-target paths; dual writes compensate instead.
    #[error("Secondary write failed: {0}")]
    SecondaryWrite(BackendError),

    /// Schema contract violation between record and row shapes. Never retried.
    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    #[error("Reconciler pass already in progress")]
    ReconcileInProgress,

    #[error("Deadline exceeded before the primary write was issued")]
    DeadlineExceeded,

    #[error("Backend error: {0}")]
    Backend(BackendError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl DuplexError {
    /// Whether the caller can reasonably retry the whole operation.
    ///
    /// Transient backend errors are already retried internally before they
    /// surface, so only revision conflicts qualify here.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DuplexError::RevisionConflict { .. })
    }

    /// Short, stable label used for metrics and hook payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            DuplexError::Io(_) => "io",
            DuplexError::Serialization(_) => "serialization",
            DuplexError::RevisionConflict { .. } => "revision_conflict",
            DuplexError::PrimaryWrite(_) => "primary_write_failure",
            DuplexError::SecondaryWrite(_) => "secondary_write_failure",
            DuplexError::Mapping(_) => "mapping",
            DuplexError::Reconciliation(_) => "reconciliation",
            DuplexError::ReconcileInProgress => "reconcile_in_progress",
            DuplexError::DeadlineExceeded => "deadline_exceeded",
            DuplexError::Backend(_) => "backend",
            DuplexError::Config(_) => "config",
            DuplexError::NotFound(_) => "not_found",
            DuplexError::InvalidState(_) => "invalid_state",
            DuplexError::Other(_) => "other",
        }
    }
}

impl From<serde_json::Error> for DuplexError {
    fn from(err: serde_json::Error) -> Self {
        DuplexError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DuplexError>;

/// Classification of a single adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Timeout, connection reset, or similar; safe to retry.
    Transient,
    /// Store is unreachable; safe to retry.
    Unavailable,
    /// Optimistic concurrency check failed on the primary.
    RevisionConflict,
    NotFound,
    /// Store refused the request (constraint, unsupported statement, ...).
    Rejected,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendErrorKind::Transient => "transient",
            BackendErrorKind::Unavailable => "unavailable",
            BackendErrorKind::RevisionConflict => "revision_conflict",
            BackendErrorKind::NotFound => "not_found",
            BackendErrorKind::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Error value returned by store adapters.
///
/// Adapters never retry on their own. They report what happened and whether
/// a retry could change the result; the callers own the backoff loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    /// Current revision on the primary, populated for revision conflicts.
    pub current_revision: Option<Revision>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            current_revision: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transient, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unavailable, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Rejected, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, message)
    }

    pub fn revision_conflict(current: Option<Revision>) -> Self {
        Self {
            kind: BackendErrorKind::RevisionConflict,
            message: "revision mismatch".to_string(),
            current_revision: current,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::Transient | BackendErrorKind::Unavailable
        )
    }
}
