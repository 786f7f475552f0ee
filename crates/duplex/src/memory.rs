//! In-memory store adapters
//!
//! Used by tests and embedded callers. Both stores support fault injection:
//! [`set_available`](MemoryPrimaryStore::set_available) takes a store offline
//! and [`fail_next`](MemoryPrimaryStore::fail_next) queues errors for the next
//! calls, so every partial-failure path can be driven without a network.

use async_trait::async_trait;
use duplex_core::{
    BackendError, BackendResult, ColumnValue, Predicate, PrimaryStore, Record, Revision, Row,
    RowMutation, SecondaryStore,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use xxhash_rust::xxh3::xxh3_64;

/// Shared fault-injection switches.
#[derive(Debug)]
struct Faults {
    available: AtomicBool,
    queued: Mutex<VecDeque<BackendError>>,
    calls: AtomicU64,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            available: AtomicBool::new(true),
            queued: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
        }
    }
}

impl Faults {
    fn check(&self, store: &str) -> BackendResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable(format!("{} store is offline", store)));
        }
        match self.queued.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Revision for generation `n` of a document: `n-<hash of content>`.
fn next_revision(previous: Option<&Revision>, record: &Record) -> Revision {
    let generation = previous
        .and_then(|r| r.as_str().split_once('-'))
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    let body = serde_json::to_vec(&record.attributes).unwrap_or_default();
    let mut key = previous.map(|r| r.as_str().as_bytes().to_vec()).unwrap_or_default();
    key.extend_from_slice(&body);
    Revision::new(format!("{}-{:016x}", generation, xxh3_64(&key)))
}

type Collection = BTreeMap<String, Record>;

/// Document store with optimistic per-record revisions.
///
/// `put` with no expected revision only creates; updating an existing record
/// requires its current revision. `delete` with no expected revision is
/// unconditional.
#[derive(Debug, Default)]
pub struct MemoryPrimaryStore {
    collections: Mutex<HashMap<String, Collection>>,
    faults: Faults,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.faults.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next call with `error`. Errors queue up in order.
    pub fn fail_next(&self, error: BackendError) {
        self.faults.queued.lock().push_back(error);
    }

    /// Adapter calls made so far, including failed ones.
    pub fn calls(&self) -> u64 {
        self.faults.calls.load(Ordering::Relaxed)
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Read a record without going through fault injection.
    pub fn peek(&self, collection: &str, id: &str) -> Option<Record> {
        self.collections
            .lock()
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    /// Write a record directly, bypassing revision checks. Returns the
    /// assigned revision.
    pub fn insert_raw(&self, record: Record) -> Revision {
        let mut collections = self.collections.lock();
        let docs = collections.entry(record.collection.clone()).or_default();
        let previous = docs.get(&record.id).and_then(|r| r.revision.clone());
        let revision = next_revision(previous.as_ref(), &record);
        let mut stored = record;
        stored.revision = Some(revision.clone());
        docs.insert(stored.id.clone(), stored);
        revision
    }

    fn put_locked(
        docs: &mut Collection,
        record: &Record,
        expected: Option<&Revision>,
    ) -> BackendResult<Revision> {
        let current = docs.get(&record.id).and_then(|r| r.revision.clone());
        if current.as_ref() != expected {
            return Err(BackendError::revision_conflict(current));
        }
        let revision = next_revision(current.as_ref(), record);
        let mut stored = record.clone();
        stored.revision = Some(revision.clone());
        docs.insert(stored.id.clone(), stored);
        Ok(revision)
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Record>> {
        self.faults.check("primary")?;
        Ok(self.peek(collection, id))
    }

    async fn put(&self, record: &Record, expected: Option<&Revision>) -> BackendResult<Revision> {
        self.faults.check("primary")?;
        let mut collections = self.collections.lock();
        let docs = collections.entry(record.collection.clone()).or_default();
        Self::put_locked(docs, record, expected)
    }

    async fn delete(
        &self,
        collection: &str,
        id: &str,
        expected: Option<&Revision>,
    ) -> BackendResult<()> {
        self.faults.check("primary")?;
        let mut collections = self.collections.lock();
        let Some(docs) = collections.get_mut(collection) else {
            return Err(BackendError::not_found(format!("{}/{}", collection, id)));
        };
        let current = match docs.get(id) {
            Some(record) => record.revision.clone(),
            None => return Err(BackendError::not_found(format!("{}/{}", collection, id))),
        };
        if let Some(expected) = expected {
            if current.as_ref() != Some(expected) {
                return Err(BackendError::revision_conflict(current));
            }
        }
        docs.remove(id);
        Ok(())
    }

    async fn list_page(
        &self,
        collection: &str,
        after_id: Option<&str>,
        page_size: usize,
    ) -> BackendResult<Vec<Record>> {
        self.faults.check("primary")?;
        let collections = self.collections.lock();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .values()
            .filter(|r| after_id.map_or(true, |after| r.id.as_str() > after))
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn bulk_write(&self, records: &[Record]) -> BackendResult<Vec<BackendResult<Revision>>> {
        self.faults.check("primary")?;
        let mut collections = self.collections.lock();
        Ok(records
            .iter()
            .map(|record| {
                let docs = collections.entry(record.collection.clone()).or_default();
                Self::put_locked(docs, record, record.revision.as_ref())
            })
            .collect())
    }

    async fn find(&self, collection: &str, selector: &Value) -> BackendResult<Vec<Record>> {
        self.faults.check("primary")?;
        let Value::Object(fields) = selector else {
            return Err(BackendError::rejected("selector must be a JSON object"));
        };
        let collections = self.collections.lock();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .values()
            .filter(|r| {
                fields
                    .iter()
                    .all(|(name, want)| r.attributes.get(name) == Some(want))
            })
            .cloned()
            .collect())
    }
}

/// Relational store holding one ordered table per collection.
///
/// Supports `Predicate::All` and `Predicate::Eq`; raw SQL predicates are
/// rejected.
#[derive(Debug, Default)]
pub struct MemorySecondaryStore {
    tables: Mutex<HashMap<String, BTreeMap<String, Row>>>,
    faults: Faults,
}

impl MemorySecondaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.faults.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_next(&self, error: BackendError) {
        self.faults.queued.lock().push_back(error);
    }

    pub fn calls(&self) -> u64 {
        self.faults.calls.load(Ordering::Relaxed)
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables.lock().get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Read a row by id without going through fault injection.
    pub fn peek(&self, table: &str, id: &str) -> Option<Row> {
        self.tables
            .lock()
            .get(table)
            .and_then(|t| t.get(id))
            .cloned()
    }

    /// Insert a row directly, keyed by the text value of `id_column`.
    pub fn insert_raw(&self, row: Row, id_column: &str) {
        if let Some(id) = row.get(id_column).and_then(|v| v.as_text()).map(str::to_string) {
            self.tables
                .lock()
                .entry(row.table.clone())
                .or_default()
                .insert(id, row);
        }
    }
}

#[async_trait]
impl SecondaryStore for MemorySecondaryStore {
    async fn execute_row(&self, mutation: &RowMutation) -> BackendResult<()> {
        self.faults.check("secondary")?;
        let mut tables = self.tables.lock();
        match mutation {
            RowMutation::Upsert { row, id_column } => {
                let id = row
                    .get(id_column)
                    .and_then(|v| v.as_text())
                    .ok_or_else(|| {
                        BackendError::rejected(format!(
                            "row for '{}' has no text '{}' column",
                            row.table, id_column
                        ))
                    })?
                    .to_string();
                // NULL cells are not stored, matching a relational read-back.
                let mut stored = Row::new(row.table.clone());
                stored.columns = row
                    .columns
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .cloned()
                    .collect();
                tables.entry(row.table.clone()).or_default().insert(id, stored);
            }
            RowMutation::Delete { table, id, .. } => {
                if let Some(rows) = tables.get_mut(table) {
                    rows.remove(id);
                }
            }
        }
        Ok(())
    }

    async fn query(&self, table: &str, predicate: &Predicate) -> BackendResult<Vec<Row>> {
        self.faults.check("secondary")?;
        let tables = self.tables.lock();
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        match predicate {
            Predicate::All => Ok(rows.values().cloned().collect()),
            Predicate::Eq { column, value } => Ok(rows
                .values()
                .filter(|row| {
                    row.get(column).unwrap_or(&ColumnValue::Null) == value
                })
                .cloned()
                .collect()),
            Predicate::Sql { .. } => Err(BackendError::rejected(
                "memory secondary store does not execute SQL predicates",
            )),
        }
    }

    async fn list_page(
        &self,
        table: &str,
        _id_column: &str,
        after_id: Option<&str>,
        page_size: usize,
    ) -> BackendResult<Vec<Row>> {
        self.faults.check("secondary")?;
        let tables = self.tables.lock();
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|(id, _)| after_id.map_or(true, |after| id.as_str() > after))
            .take(page_size)
            .map(|(_, row)| row.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::BackendErrorKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_primary_optimistic_concurrency() {
        let store = MemoryPrimaryStore::new();
        let record = Record::new("users", "u1").with("name", "Alice");

        let r1 = store.put(&record, None).await.unwrap();
        assert!(r1.as_str().starts_with("1-"));

        // create-only without a revision
        let err = store.put(&record, None).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::RevisionConflict);
        assert_eq!(err.current_revision.as_ref(), Some(&r1));

        let r2 = store
            .put(&record.clone().with("name", "Alicia"), Some(&r1))
            .await
            .unwrap();
        assert!(r2.as_str().starts_with("2-"));

        let err = store.put(&record, Some(&r1)).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::RevisionConflict);

        assert!(store.delete("users", "u1", Some(&r1)).await.is_err());
        store.delete("users", "u1", Some(&r2)).await.unwrap();
        let err = store.delete("users", "u1", None).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_primary_paging_and_find() {
        let store = MemoryPrimaryStore::new();
        for (id, team) in [("c", "red"), ("a", "blue"), ("b", "red")] {
            store.insert_raw(Record::new("users", id).with("team", team));
        }

        let page = store.list_page("users", None, 2).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let page = store.list_page("users", Some("b"), 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "c");

        let red = store.find("users", &json!({"team": "red"})).await.unwrap();
        assert_eq!(red.len(), 2);
        assert!(store.find("users", &json!(["bad"])).await.is_err());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemorySecondaryStore::new();
        let upsert = RowMutation::Upsert {
            row: Row::new("users").with("id", "u1").with("name", "Alice"),
            id_column: "id".into(),
        };

        store.set_available(false);
        let err = store.execute_row(&upsert).await.unwrap_err();
        assert!(err.is_retryable());
        store.set_available(true);

        store.fail_next(BackendError::rejected("constraint"));
        assert!(store.execute_row(&upsert).await.is_err());
        store.execute_row(&upsert).await.unwrap();
        assert_eq!(store.len("users"), 1);
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn test_secondary_query_and_delete() {
        let store = MemorySecondaryStore::new();
        for (id, team) in [("u1", "red"), ("u2", "blue")] {
            store
                .execute_row(&RowMutation::Upsert {
                    row: Row::new("users")
                        .with("id", id)
                        .with("team", team)
                        .with("note", ColumnValue::Null),
                    id_column: "id".into(),
                })
                .await
                .unwrap();
        }
        assert!(store.peek("users", "u1").unwrap().get("note").is_none());

        let red = store
            .query(
                "users",
                &Predicate::Eq {
                    column: "team".into(),
                    value: "red".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(red.len(), 1);

        let delete = RowMutation::Delete {
            table: "users".into(),
            id_column: "id".into(),
            id: "u1".into(),
        };
        store.execute_row(&delete).await.unwrap();
        // deleting an absent row succeeds
        store.execute_row(&delete).await.unwrap();
        assert_eq!(store.len("users"), 1);
    }
}
