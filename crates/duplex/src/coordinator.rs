//! Dual-write coordinator
//!
//! Every write goes to the primary store first. Only after the primary
//! commits is the secondary written; if that fails (after transient retries)
//! the post-write state is handed to the [`CompensationQueue`] and the caller
//! still gets success, since the primary is authoritative.
//!
//! ```text
//! Pending -> PrimaryWritten -> SecondaryWritten     (success)
//!                           -> CompensationQueued   (partial success)
//! Pending -> Abandoned                              (failure)
//! Pending -> SecondaryWritten                       (secondary_only mode)
//! ```
//!
//! A caller deadline can abort a write only before the primary write is
//! issued. Past that point the write runs on a spawned task, so dropping the
//! caller's future does not interrupt the secondary write or the compensation
//! hand-off.

use crate::compensation::{CompensationQueue, Enqueued};
use crate::hooks::TracingHooks;
use crate::retry::{with_retries, BackoffPolicy};
use crate::translator::SchemaTranslator;
use chrono::Utc;
use duplex_core::{
    observe, BackendError, BackendErrorKind, ColumnValue, CompensationPayload, DuplexConfig,
    DuplexError, ObservabilityHooks, PrimaryStore, Record, Result, Revision, Row, RowMutation,
    SecondaryStore, Target, WriteMode, WriteOp, WriteOutcome, WriteReceipt, WriteState,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Per-call write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Abort if the primary write has not been issued by then.
    pub deadline: Option<Instant>,
}

impl WriteOptions {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    fn check(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(DuplexError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

/// Orders writes across both stores and owns the compensation queue.
pub struct DualWriteCoordinator<P, S>
where
    P: PrimaryStore,
    S: SecondaryStore,
{
    primary: Arc<P>,
    secondary: Arc<S>,
    translator: SchemaTranslator,
    queue: Arc<CompensationQueue>,
    hooks: Arc<dyn ObservabilityHooks>,
    policy: BackoffPolicy,
    write_mode: WriteMode,
    permits: Arc<Semaphore>,
}

impl<P, S> Clone for DualWriteCoordinator<P, S>
where
    P: PrimaryStore,
    S: SecondaryStore,
{
    fn clone(&self) -> Self {
        Self {
            primary: self.primary.clone(),
            secondary: self.secondary.clone(),
            translator: self.translator.clone(),
            queue: self.queue.clone(),
            hooks: self.hooks.clone(),
            policy: self.policy.clone(),
            write_mode: self.write_mode,
            permits: self.permits.clone(),
        }
    }
}

/// Running record of one write's state and per-store outcomes.
struct Progress {
    collection: String,
    id: String,
    op: WriteOp,
    state: WriteState,
    outcomes: Vec<WriteOutcome>,
}

impl Progress {
    fn new(collection: &str, id: &str, op: WriteOp) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            op,
            state: WriteState::Pending,
            outcomes: Vec::with_capacity(2),
        }
    }

    fn advance(&mut self, next: WriteState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal write transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(
            collection = %self.collection,
            id = %self.id,
            "write state {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn receipt(self, revision: Option<Revision>, compensation: Option<Enqueued>) -> WriteReceipt {
        WriteReceipt {
            collection: self.collection,
            id: self.id,
            op: self.op,
            revision,
            state: self.state,
            outcomes: self.outcomes,
            compensation: compensation.map(Enqueued::task_id),
        }
    }
}

impl<P, S> DualWriteCoordinator<P, S>
where
    P: PrimaryStore,
    S: SecondaryStore,
{
    pub fn new(primary: Arc<P>, secondary: Arc<S>, config: &DuplexConfig) -> Self {
        Self {
            primary,
            secondary,
            translator: SchemaTranslator::new(config.translator.clone()),
            queue: Arc::new(CompensationQueue::new()),
            hooks: Arc::new(TracingHooks),
            policy: BackoffPolicy::from_config(config),
            write_mode: config.write_mode,
            permits: Arc::new(Semaphore::new(config.max_in_flight_writes)),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ObservabilityHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Share an existing queue, e.g. one drained by an external worker pool.
    pub fn with_queue(mut self, queue: Arc<CompensationQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue(&self) -> &Arc<CompensationQueue> {
        &self.queue
    }

    pub fn translator(&self) -> &SchemaTranslator {
        &self.translator
    }

    pub fn hooks(&self) -> &Arc<dyn ObservabilityHooks> {
        &self.hooks
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn primary(&self) -> &Arc<P> {
        &self.primary
    }

    pub fn secondary(&self) -> &Arc<S> {
        &self.secondary
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    /// Insert or update `record`.
    ///
    /// `record.revision` is the caller's expected revision: `None` creates,
    /// `Some` updates only if the primary still holds that revision.
    pub async fn upsert(&self, record: Record) -> Result<WriteReceipt> {
        self.upsert_with(record, WriteOptions::default()).await
    }

    pub async fn upsert_with(&self, record: Record, options: WriteOptions) -> Result<WriteReceipt> {
        // Mapping problems surface before either store is touched.
        let row = self.translator.to_secondary(&record)?;
        let permit = self.admit(&options).await?;

        let this = self.clone();
        self.detach(async move {
            let _permit = permit;
            this.run_upsert(record, row).await
        })
        .await
    }

    /// Delete `collection/id`, optionally guarded by `expected`.
    pub async fn delete(
        &self,
        collection: &str,
        id: &str,
        expected: Option<Revision>,
    ) -> Result<WriteReceipt> {
        self.delete_with(collection, id, expected, WriteOptions::default())
            .await
    }

    pub async fn delete_with(
        &self,
        collection: &str,
        id: &str,
        expected: Option<Revision>,
        options: WriteOptions,
    ) -> Result<WriteReceipt> {
        if id.is_empty() {
            return Err(DuplexError::Mapping(format!(
                "delete in '{}' has an empty id",
                collection
            )));
        }
        let permit = self.admit(&options).await?;

        let this = self.clone();
        let (collection, id) = (collection.to_string(), id.to_string());
        self.detach(async move {
            let _permit = permit;
            this.run_delete(&collection, &id, expected).await
        })
        .await
    }

    /// Upsert many records with one primary bulk write.
    ///
    /// Results come back in input order. Each record that committed on the
    /// primary gets its own secondary write and, on failure, its own
    /// compensation task. The outer error is reserved for the bulk call
    /// itself failing.
    pub async fn bulk_upsert(&self, records: Vec<Record>) -> Result<Vec<Result<WriteReceipt>>> {
        let mut results: Vec<Option<Result<WriteReceipt>>> = Vec::with_capacity(records.len());
        let mut batch = Vec::new();
        for record in records {
            match self.translator.to_secondary(&record) {
                Ok(row) => {
                    batch.push((results.len(), record, row));
                    results.push(None);
                }
                Err(e) => results.push(Some(Err(e))),
            }
        }
        if batch.is_empty() {
            return Ok(results.into_iter().flatten().collect());
        }

        let permit = self.admit(&WriteOptions::default()).await?;
        let this = self.clone();
        let done = self
            .detach(async move {
                let _permit = permit;
                this.run_bulk(batch).await
            })
            .await?;

        for (index, result) in done {
            results[index] = Some(result);
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Wait for a write slot, honouring the deadline.
    async fn admit(&self, options: &WriteOptions) -> Result<OwnedSemaphorePermit> {
        options.check()?;
        let acquire = self.permits.clone().acquire_owned();
        let permit = match options.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, acquire)
                .await
                .map_err(|_| DuplexError::DeadlineExceeded)?,
            None => acquire.await,
        }
        .map_err(|_| DuplexError::InvalidState("write pool is closed".into()))?;
        options.check()?;
        Ok(permit)
    }

    /// Run the post-admission path on its own task.
    async fn detach<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        tokio::spawn(work)
            .await
            .map_err(|e| DuplexError::InvalidState(format!("write task failed: {}", e)))?
    }

    fn report(&self, outcome: WriteOutcome, progress: &mut Progress) {
        observe::record_write_outcome(store_label(outcome.target), outcome.success);
        self.hooks.on_write_outcome(&outcome);
        progress.outcomes.push(outcome);
    }

    async fn run_upsert(&self, record: Record, row: Row) -> Result<WriteReceipt> {
        let started = StdInstant::now();
        let mut progress = Progress::new(&record.collection, &record.id, WriteOp::Upsert);
        let key = record.key();

        let result = match self.write_mode {
            WriteMode::SecondaryOnly => {
                let mutation = self.row_upsert(row);
                match self.write_secondary_only(&mut progress, &mutation, &key).await {
                    Ok(()) => Ok(progress.receipt(None, None)),
                    Err(e) => Err(e),
                }
            }
            WriteMode::PrimaryOnly | WriteMode::DualWrite => {
                match self.put_primary(&mut progress, &record, &key).await {
                    Err(e) => Err(e),
                    Ok(revision) if self.write_mode == WriteMode::PrimaryOnly => {
                        Ok(progress.receipt(Some(revision), None))
                    }
                    Ok(revision) => {
                        let mut committed = record;
                        committed.revision = Some(revision.clone());
                        let mut row = row;
                        row.set(
                            self.translator.revision_column(),
                            ColumnValue::Text(revision.as_str().to_string()),
                        );
                        let mutation = self.row_upsert(row);
                        let payload = CompensationPayload::Record(committed);
                        let queued = self
                            .replicate(&mut progress, &mutation, payload, &key)
                            .await;
                        Ok(progress.receipt(Some(revision), queued))
                    }
                }
            }
        };
        observe::record_write_duration(started.elapsed());
        result
    }

    async fn run_delete(
        &self,
        collection: &str,
        id: &str,
        expected: Option<Revision>,
    ) -> Result<WriteReceipt> {
        let started = StdInstant::now();
        let mut progress = Progress::new(collection, id, WriteOp::Delete);
        let key = format!("{}/{}", collection, id);
        let mutation = self.translator.delete_mutation(collection, id);

        let result = match self.write_mode {
            WriteMode::SecondaryOnly => {
                match self.write_secondary_only(&mut progress, &mutation, &key).await {
                    Ok(()) => Ok(progress.receipt(None, None)),
                    Err(e) => Err(e),
                }
            }
            WriteMode::PrimaryOnly | WriteMode::DualWrite => {
                let attempt = with_retries(&self.policy, "primary", &key, || {
                    self.primary.delete(collection, id, expected.as_ref())
                })
                .await;
                match attempt.result {
                    Err(e) => {
                        self.report(
                            WriteOutcome::failed(
                                Target::Primary,
                                collection,
                                id,
                                WriteOp::Delete,
                                attempt.attempts,
                                e.clone(),
                            ),
                            &mut progress,
                        );
                        progress.advance(WriteState::Abandoned);
                        Err(primary_error(collection, id, expected.clone(), e))
                    }
                    Ok(()) => {
                        self.report(
                            WriteOutcome::succeeded(
                                Target::Primary,
                                collection,
                                id,
                                WriteOp::Delete,
                                attempt.attempts,
                            ),
                            &mut progress,
                        );
                        progress.advance(WriteState::PrimaryWritten);
                        if self.write_mode == WriteMode::PrimaryOnly {
                            Ok(progress.receipt(None, None))
                        } else {
                            let payload = CompensationPayload::Tombstone {
                                id: id.to_string(),
                                revision: expected,
                            };
                            let queued = self
                                .replicate(&mut progress, &mutation, payload, &key)
                                .await;
                            Ok(progress.receipt(None, queued))
                        }
                    }
                }
            }
        };
        observe::record_write_duration(started.elapsed());
        result
    }

    async fn run_bulk(
        &self,
        batch: Vec<(usize, Record, Row)>,
    ) -> Result<Vec<(usize, Result<WriteReceipt>)>> {
        let records: Vec<Record> = batch.iter().map(|(_, r, _)| r.clone()).collect();

        if self.write_mode == WriteMode::SecondaryOnly {
            let mut out = Vec::with_capacity(batch.len());
            for (index, record, row) in batch {
                out.push((index, self.run_upsert(record, row).await));
            }
            return Ok(out);
        }

        let seed = format!("bulk/{}", records.len());
        let attempt = with_retries(&self.policy, "primary", &seed, || {
            self.primary.bulk_write(&records)
        })
        .await;
        let outcomes = attempt.result.map_err(DuplexError::PrimaryWrite)?;
        if outcomes.len() != batch.len() {
            return Err(DuplexError::InvalidState(format!(
                "bulk write returned {} outcomes for {} records",
                outcomes.len(),
                batch.len()
            )));
        }

        let mut out = Vec::with_capacity(batch.len());
        for ((index, record, mut row), outcome) in batch.into_iter().zip(outcomes) {
            let mut progress = Progress::new(&record.collection, &record.id, WriteOp::Upsert);
            let key = record.key();
            match outcome {
                Err(e) => {
                    self.report(
                        WriteOutcome::failed(
                            Target::Primary,
                            &record.collection,
                            &record.id,
                            WriteOp::Upsert,
                            attempt.attempts,
                            e.clone(),
                        ),
                        &mut progress,
                    );
                    progress.advance(WriteState::Abandoned);
                    out.push((
                        index,
                        Err(primary_error(&record.collection, &record.id, record.revision, e)),
                    ));
                }
                Ok(revision) => {
                    self.report(
                        WriteOutcome::succeeded(
                            Target::Primary,
                            &record.collection,
                            &record.id,
                            WriteOp::Upsert,
                            attempt.attempts,
                        ),
                        &mut progress,
                    );
                    progress.advance(WriteState::PrimaryWritten);
                    if self.write_mode == WriteMode::PrimaryOnly {
                        out.push((index, Ok(progress.receipt(Some(revision), None))));
                        continue;
                    }
                    row.set(
                        self.translator.revision_column(),
                        ColumnValue::Text(revision.as_str().to_string()),
                    );
                    let mut committed = record;
                    committed.revision = Some(revision.clone());
                    let mutation = self.row_upsert(row);
                    let queued = self
                        .replicate(
                            &mut progress,
                            &mutation,
                            CompensationPayload::Record(committed),
                            &key,
                        )
                        .await;
                    out.push((index, Ok(progress.receipt(Some(revision), queued))));
                }
            }
        }
        Ok(out)
    }

    async fn put_primary(
        &self,
        progress: &mut Progress,
        record: &Record,
        key: &str,
    ) -> Result<Revision> {
        let attempt = with_retries(&self.policy, "primary", key, || {
            self.primary.put(record, record.revision.as_ref())
        })
        .await;
        match attempt.result {
            Ok(revision) => {
                self.report(
                    WriteOutcome::succeeded(
                        Target::Primary,
                        &record.collection,
                        &record.id,
                        WriteOp::Upsert,
                        attempt.attempts,
                    ),
                    progress,
                );
                progress.advance(WriteState::PrimaryWritten);
                Ok(revision)
            }
            Err(e) => {
                self.report(
                    WriteOutcome::failed(
                        Target::Primary,
                        &record.collection,
                        &record.id,
                        WriteOp::Upsert,
                        attempt.attempts,
                        e.clone(),
                    ),
                    progress,
                );
                progress.advance(WriteState::Abandoned);
                Err(primary_error(
                    &record.collection,
                    &record.id,
                    record.revision.clone(),
                    e,
                ))
            }
        }
    }

    /// Secondary half of a dual write. Returns the compensation task when
    /// the secondary could not be written.
    async fn replicate(
        &self,
        progress: &mut Progress,
        mutation: &RowMutation,
        payload: CompensationPayload,
        key: &str,
    ) -> Option<Enqueued> {
        let attempt = with_retries(&self.policy, "secondary", key, || {
            self.secondary.execute_row(mutation)
        })
        .await;
        let (collection, id, op) = (progress.collection.clone(), progress.id.clone(), progress.op);

        match attempt.result {
            Ok(()) => {
                self.report(
                    WriteOutcome::succeeded(Target::Secondary, &collection, &id, op, attempt.attempts),
                    progress,
                );
                progress.advance(WriteState::SecondaryWritten);
                if let Some(task) = self.queue.discard_for(&collection, &id, payload) {
                    tracing::debug!(task = %task, key, "Dropped compensation superseded by a fresh write");
                }
                None
            }
            Err(e) => {
                self.report(
                    WriteOutcome::failed(
                        Target::Secondary,
                        &collection,
                        &id,
                        op,
                        attempt.attempts,
                        e.clone(),
                    ),
                    progress,
                );
                let due = Utc::now()
                    + chrono::Duration::from_std(self.policy.delay_with_jitter(0, key))
                        .unwrap_or_else(|_| chrono::Duration::zero());
                let queued = self
                    .queue
                    .enqueue(&collection, payload, due, Some(e.to_string()));
                observe::record_compensation("enqueued");
                progress.advance(WriteState::CompensationQueued);
                tracing::warn!(
                    key,
                    task = %queued.task_id(),
                    attempts = attempt.attempts,
                    "Secondary write failed after primary commit, compensation queued: {}",
                    e
                );
                Some(queued)
            }
        }
    }

    async fn write_secondary_only(
        &self,
        progress: &mut Progress,
        mutation: &RowMutation,
        key: &str,
    ) -> Result<()> {
        let attempt = with_retries(&self.policy, "secondary", key, || {
            self.secondary.execute_row(mutation)
        })
        .await;
        let (collection, id, op) = (progress.collection.clone(), progress.id.clone(), progress.op);
        match attempt.result {
            Ok(()) => {
                self.report(
                    WriteOutcome::succeeded(Target::Secondary, &collection, &id, op, attempt.attempts),
                    progress,
                );
                progress.advance(WriteState::SecondaryWritten);
                Ok(())
            }
            Err(e) => {
                self.report(
                    WriteOutcome::failed(
                        Target::Secondary,
                        &collection,
                        &id,
                        op,
                        attempt.attempts,
                        e.clone(),
                    ),
                    progress,
                );
                progress.advance(WriteState::Abandoned);
                Err(DuplexError::SecondaryWrite(e))
            }
        }
    }

    fn row_upsert(&self, row: Row) -> RowMutation {
        RowMutation::Upsert {
            row,
            id_column: self.translator.id_column().to_string(),
        }
    }
}

fn primary_error(
    collection: &str,
    id: &str,
    expected: Option<Revision>,
    error: BackendError,
) -> DuplexError {
    match error.kind {
        BackendErrorKind::RevisionConflict => DuplexError::RevisionConflict {
            collection: collection.to_string(),
            id: id.to_string(),
            expected,
            actual: error.current_revision,
        },
        BackendErrorKind::NotFound => DuplexError::NotFound(format!("{}/{}", collection, id)),
        _ => DuplexError::PrimaryWrite(error),
    }
}

pub(crate) fn store_label(target: Target) -> &'static str {
    match target {
        Target::Primary => "primary",
        Target::Secondary => "secondary",
        Target::Both => "both",
    }
}
