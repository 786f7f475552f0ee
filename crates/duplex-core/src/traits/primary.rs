use async_trait::async_trait;

use crate::traits::BackendResult;
use crate::types::{Record, Revision};

/// Adapter for the authoritative document store.
///
/// Implementations perform exactly one round trip per call and never retry;
/// failures carry a [`BackendErrorKind`](crate::error::BackendErrorKind) so
/// the caller can decide.
#[async_trait]
pub trait PrimaryStore: Send + Sync + 'static {
    /// Point read. Always fresh.
    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Record>>;

    /// Create or replace a record and return its new revision.
    ///
    /// With `expected = Some(rev)` the write only succeeds if the stored
    /// revision equals `rev`, otherwise it fails with
    /// `BackendErrorKind::RevisionConflict`. `None` only creates: it
    /// conflicts if the record already exists.
    async fn put(&self, record: &Record, expected: Option<&Revision>) -> BackendResult<Revision>;

    /// Delete a record, with the same optimistic check as [`put`](Self::put).
    /// `None` deletes unconditionally.
    async fn delete(
        &self,
        collection: &str,
        id: &str,
        expected: Option<&Revision>,
    ) -> BackendResult<()>;

    /// Records with `id > after_id`, ascending by id, at most `page_size`.
    async fn list_page(
        &self,
        collection: &str,
        after_id: Option<&str>,
        page_size: usize,
    ) -> BackendResult<Vec<Record>>;

    /// Unconditional multi-record write; one result per input, same order.
    async fn bulk_write(&self, records: &[Record]) -> BackendResult<Vec<BackendResult<Revision>>>;

    /// Execute a compiled selector against one collection.
    async fn find(
        &self,
        collection: &str,
        selector: &serde_json::Value,
    ) -> BackendResult<Vec<Record>>;
}
