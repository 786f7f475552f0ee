//! Dual-write behavior through the public façade: partial failures,
//! compensation replay and optimistic concurrency.

use duplex::prelude::*;
use duplex::{BackendResult, ColumnValue, CompensationPayload, CompensationTask, Revision, WriteOp};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

type MemoryDuplex = DuplexStore<MemoryPrimaryStore, MemorySecondaryStore>;

fn config() -> DuplexConfig {
    DuplexConfig::default()
        .with_collection("users")
        .with_max_retries(3)
        .with_backoff(0, 1.0, 0)
        .with_backoff_jitter(0.0)
}

fn create_store(
    config: DuplexConfig,
) -> (Arc<MemoryPrimaryStore>, Arc<MemorySecondaryStore>, MemoryDuplex) {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let secondary = Arc::new(MemorySecondaryStore::new());
    let store = DuplexStore::new(primary.clone(), secondary.clone(), config).unwrap();
    (primary, secondary, store)
}

#[derive(Default)]
struct RecordingHooks {
    exhausted: Mutex<Vec<CompensationTask>>,
}

impl ObservabilityHooks for RecordingHooks {
    fn on_compensation_exhausted(&self, task: &CompensationTask) {
        self.exhausted.lock().push(task.clone());
    }
}

#[tokio::test]
async fn test_insert_while_secondary_unreachable_converges() {
    let (primary, secondary, store) = create_store(config());

    secondary.set_available(false);
    let receipt = store
        .upsert(Record::new("users", "u1").with("name", "Alice"))
        .await
        .unwrap();

    // The caller still sees success, backed by the primary.
    assert_eq!(receipt.state, WriteState::CompensationQueued);
    assert!(primary.peek("users", "u1").is_some());
    assert!(secondary.peek("users", "u1").is_none());
    let task_id = receipt.compensation.unwrap();
    let task = store.coordinator().queue().find("users", "u1").unwrap();
    assert_eq!(task.id, task_id);

    secondary.set_available(true);
    let stats = store.drain_compensations().await;
    assert_eq!(stats.succeeded, 1);
    assert!(store.coordinator().queue().is_empty());

    let row = secondary.peek("users", "u1").unwrap();
    assert_eq!(row.get("name"), Some(&ColumnValue::Text("Alice".into())));

    let reports = store.reconcile_once().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].has_drift());
    assert!(!reports[0].mentions("u1"));
    assert_eq!(reports[0].matching_count, 1);
}

#[tokio::test]
async fn test_concurrent_updates_from_stale_revision() {
    let (primary, secondary, store) = create_store(config());
    let store = Arc::new(store);

    let created = store
        .upsert(Record::new("users", "u2").with("name", "Bob"))
        .await
        .unwrap();
    let r1 = created.revision.unwrap();

    let a = Record::new("users", "u2")
        .with("name", "Bobby")
        .with_revision(r1.clone());
    let b = Record::new("users", "u2")
        .with("name", "Robert")
        .with_revision(r1.clone());

    let (first, second) = tokio::join!(
        {
            let store = store.clone();
            async move { store.upsert(a).await }
        },
        {
            let store = store.clone();
            async move { store.upsert(b).await }
        }
    );

    let (winner, loser) = match (first, second) {
        (Ok(w), Err(l)) | (Err(l), Ok(w)) => (w, l),
        other => panic!("expected exactly one success, got {:?}", other),
    };
    assert!(matches!(loser, DuplexError::RevisionConflict { .. }));
    assert!(loser.is_retryable());

    let r2 = winner.revision.unwrap();
    assert_ne!(r2, r1);
    let stored = primary.peek("users", "u2").unwrap();
    assert_eq!(stored.revision, Some(r2));

    // The secondary follows the winning write only.
    let row = secondary.peek("users", "u2").unwrap();
    assert_eq!(
        row.get("name").and_then(|v| v.as_text()),
        stored.get("name").and_then(|v| v.as_str())
    );
}

#[tokio::test]
async fn test_primary_failure_writes_nothing() {
    let (primary, secondary, store) = create_store(config());

    primary.set_available(false);
    let result = store
        .upsert(Record::new("users", "u1").with("name", "Alice"))
        .await;
    assert!(matches!(result, Err(DuplexError::PrimaryWrite(_))));
    assert!(secondary.peek("users", "u1").is_none());
    assert!(store.coordinator().queue().is_empty());
}

#[tokio::test]
async fn test_exhausted_compensation_is_dead_lettered() {
    let hooks = Arc::new(RecordingHooks::default());
    let primary = Arc::new(MemoryPrimaryStore::new());
    let secondary = Arc::new(MemorySecondaryStore::new());
    let store = DuplexStore::builder(primary.clone(), secondary.clone(), config())
        .with_hooks(hooks.clone())
        .build()
        .unwrap();

    secondary.set_available(false);
    store
        .upsert(Record::new("users", "u1").with("name", "Alice"))
        .await
        .unwrap();

    let stats = store.drain_compensations().await;
    assert_eq!(stats.claimed, 3);
    assert_eq!(stats.rescheduled, 2);
    assert_eq!(stats.dead_lettered, 1);

    let queue = store.coordinator().queue();
    assert!(queue.is_empty());
    let letters = queue.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].task.record_id(), "u1");
    assert_eq!(hooks.exhausted.lock().len(), 1);

    let snapshot = store.worker().metrics().snapshot();
    assert_eq!(snapshot.dead_letters, 1);
    assert_eq!(snapshot.failures, 3);

    // Operator requeues once the secondary is back.
    secondary.set_available(true);
    let requeued = queue
        .requeue_dead_letter(letters[0].task.id, chrono::Utc::now())
        .unwrap();
    assert_eq!(requeued, letters[0].task.id);
    assert_eq!(store.drain_compensations().await.succeeded, 1);
    assert!(secondary.peek("users", "u1").is_some());
    assert_eq!(queue.dead_letter_count(), 0);
}

#[tokio::test]
async fn test_newer_write_replaces_pending_compensation() {
    let (_, secondary, store) = create_store(config());

    secondary.set_available(false);
    let first = store
        .upsert(Record::new("users", "u1").with("name", "Alice"))
        .await
        .unwrap();
    let second = store
        .upsert(
            Record::new("users", "u1")
                .with("name", "Alicia")
                .with_revision(first.revision.clone().unwrap()),
        )
        .await
        .unwrap();

    // Coalesced onto one task carrying the latest state.
    assert_eq!(first.compensation, second.compensation);
    assert_eq!(store.coordinator().queue().len(), 1);

    secondary.set_available(true);
    store.drain_compensations().await;
    let row = secondary.peek("users", "u1").unwrap();
    assert_eq!(row.get("name"), Some(&ColumnValue::Text("Alicia".into())));
}

#[tokio::test]
async fn test_successful_write_discards_stale_compensation() {
    let (_, secondary, store) = create_store(config());

    secondary.set_available(false);
    let first = store
        .upsert(Record::new("users", "u1").with("name", "Alice"))
        .await
        .unwrap();
    assert!(first.compensation.is_some());

    secondary.set_available(true);
    let second = store
        .upsert(
            Record::new("users", "u1")
                .with("name", "Alicia")
                .with_revision(first.revision.unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(second.state, WriteState::SecondaryWritten);
    assert!(store.coordinator().queue().is_empty());
}

#[tokio::test]
async fn test_delete_while_secondary_unreachable_replays_tombstone() {
    let (primary, secondary, store) = create_store(config());

    let created = store
        .upsert(Record::new("users", "u1").with("name", "Alice"))
        .await
        .unwrap();
    assert!(secondary.peek("users", "u1").is_some());

    secondary.set_available(false);
    let receipt = store
        .delete("users", "u1", created.revision)
        .await
        .unwrap();
    assert_eq!(receipt.op, WriteOp::Delete);
    assert_eq!(receipt.state, WriteState::CompensationQueued);
    assert!(primary.peek("users", "u1").is_none());

    secondary.set_available(true);
    store.drain_compensations().await;
    assert!(secondary.peek("users", "u1").is_none());
}

#[tokio::test]
async fn test_bulk_upsert_reports_per_record() {
    let (_, secondary, store) = create_store(config());

    let results = store
        .bulk_upsert(vec![
            Record::new("users", "a").with("n", 1),
            Record::new("users", "").with("n", 2),
            Record::new("users", "c").with("n", 3),
        ])
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(
        results[0].as_ref().unwrap().state,
        WriteState::SecondaryWritten
    );
    assert!(matches!(results[1], Err(DuplexError::Mapping(_))));
    assert!(results[2].is_ok());
    assert_eq!(secondary.len("users"), 2);
}

#[tokio::test]
async fn test_late_compensation_replays_current_primary_state() {
    let (primary, secondary, store) = create_store(config());

    let first = store
        .upsert(Record::new("users", "u1").with("name", "Alice"))
        .await
        .unwrap();
    let stale = primary.peek("users", "u1").unwrap();
    store
        .upsert(
            Record::new("users", "u1")
                .with("name", "Alicia")
                .with_revision(first.revision.unwrap()),
        )
        .await
        .unwrap();

    // An older write's compensation arriving after the newer write settled.
    store.coordinator().queue().enqueue(
        "users",
        CompensationPayload::Record(stale),
        chrono::Utc::now(),
        Some("secondary timed out".into()),
    );
    assert_eq!(store.drain_compensations().await.succeeded, 1);

    let row = secondary.peek("users", "u1").unwrap();
    assert_eq!(row.get("name"), Some(&ColumnValue::Text("Alicia".into())));
    let reports = store.reconcile_once().await.unwrap();
    assert!(!reports[0].has_drift(), "{:?}", reports[0]);
}

/// Primary whose `put` parks until released, to drop callers mid-write.
struct SlowPrimary {
    inner: MemoryPrimaryStore,
    entered: Notify,
    release: Notify,
}

#[async_trait::async_trait]
impl PrimaryStore for SlowPrimary {
    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Record>> {
        self.inner.get(collection, id).await
    }

    async fn put(&self, record: &Record, expected: Option<&Revision>) -> BackendResult<Revision> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.put(record, expected).await
    }

    async fn delete(
        &self,
        collection: &str,
        id: &str,
        expected: Option<&Revision>,
    ) -> BackendResult<()> {
        self.inner.delete(collection, id, expected).await
    }

    async fn list_page(
        &self,
        collection: &str,
        after_id: Option<&str>,
        page_size: usize,
    ) -> BackendResult<Vec<Record>> {
        self.inner.list_page(collection, after_id, page_size).await
    }

    async fn bulk_write(&self, records: &[Record]) -> BackendResult<Vec<BackendResult<Revision>>> {
        self.inner.bulk_write(records).await
    }

    async fn find(
        &self,
        collection: &str,
        selector: &serde_json::Value,
    ) -> BackendResult<Vec<Record>> {
        self.inner.find(collection, selector).await
    }
}

#[tokio::test]
async fn test_dropped_caller_does_not_cancel_in_flight_write() {
    let primary = Arc::new(SlowPrimary {
        inner: MemoryPrimaryStore::new(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let secondary = Arc::new(MemorySecondaryStore::new());
    let store = Arc::new(DuplexStore::new(primary.clone(), secondary.clone(), config()).unwrap());

    let caller = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .upsert(Record::new("users", "u1").with("name", "Alice"))
                .await
        })
    };

    primary.entered.notified().await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());
    primary.release.notify_one();

    // The write finishes on its own task: primary, then secondary.
    tokio::time::timeout(Duration::from_secs(5), async {
        while secondary.peek("users", "u1").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("secondary row should appear after the caller went away");
    assert!(primary.inner.peek("users", "u1").is_some());
    assert!(store.coordinator().queue().is_empty());
}
