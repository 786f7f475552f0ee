//! Consistency reconciler
//!
//! Walks both stores in canonical-id order with a merge join, diffs every
//! record, and repairs drift according to the configured
//! [`ConflictResolution`]:
//!
//! | found in        | `primary_wins`        | `secondary_wins`        | `manual`  |
//! |-----------------|-----------------------|-------------------------|-----------|
//! | both, differing | overwrite secondary   | overwrite primary       | report    |
//! | primary only    | replay to secondary   | replay to secondary     | replay    |
//! | secondary only  | delete from secondary | backfill into primary   | report    |
//!
//! Before any repair that writes to the secondary store, the primary record
//! is read again, so a live write that landed during the scan is replayed
//! rather than mistaken for drift.
//!
//! A checkpoint is saved every `batch_size` ids. A pass that stops early
//! (batch error or `max_batches_per_pass`) resumes from it next time; a pass
//! that reaches the end clears it. Only one pass runs at a time.

use crate::retry::{with_retries, BackoffPolicy};
use crate::shutdown::ShutdownHandle;
use crate::translator::SchemaTranslator;
use duplex_core::{
    observe, BackendError, BackendErrorKind, CheckpointStore, ConflictResolution, DriftReport,
    DuplexConfig, DuplexError, ObservabilityHooks, PrimaryStore, Record, ReconcileCheckpoint,
    Result, Revision, RowMutation, SecondaryStore,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Field name reported when a secondary row cannot be mapped back at all.
pub const UNMAPPABLE_ROW: &str = "*";

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub collections: Vec<String>,
    pub batch_size: usize,
    /// Stop a pass after this many batches; `None` scans to the end.
    pub max_batches_per_pass: Option<usize>,
    pub conflict_resolution: ConflictResolution,
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from_config(&DuplexConfig::default())
    }
}

impl ReconcilerConfig {
    pub fn from_config(config: &DuplexConfig) -> Self {
        Self {
            collections: config.collections.clone(),
            batch_size: config.reconcile_batch_size.max(1),
            max_batches_per_pass: config.reconcile_max_batches_per_pass,
            conflict_resolution: config.conflict_resolution,
            interval: Duration::from_secs(config.reconcile_interval_seconds),
        }
    }
}

/// Secondary side of one id: the mapped record, or why mapping failed.
type SecondaryEntry = (String, std::result::Result<Record, String>);

/// Paged cursor over one store.
struct Side<T> {
    buffer: VecDeque<T>,
    after: Option<String>,
    exhausted: bool,
}

impl<T> Side<T> {
    fn new(after: Option<String>) -> Self {
        Self {
            buffer: VecDeque::new(),
            after,
            exhausted: false,
        }
    }

    fn needs_page(&self) -> bool {
        self.buffer.is_empty() && !self.exhausted
    }

    fn fill(&mut self, page: Vec<T>, page_size: usize, last_id: Option<String>) {
        self.exhausted = page.len() < page_size;
        if let Some(id) = last_id {
            self.after = Some(id);
        }
        self.buffer.extend(page);
    }
}

pub struct ConsistencyReconciler<P, S>
where
    P: PrimaryStore,
    S: SecondaryStore,
{
    primary: Arc<P>,
    secondary: Arc<S>,
    translator: SchemaTranslator,
    checkpoints: Arc<dyn CheckpointStore>,
    hooks: Arc<dyn ObservabilityHooks>,
    policy: BackoffPolicy,
    config: ReconcilerConfig,
    run_lock: Mutex<()>,
    shutdown: ShutdownHandle,
}

impl<P, S> ConsistencyReconciler<P, S>
where
    P: PrimaryStore,
    S: SecondaryStore,
{
    pub fn new(
        primary: Arc<P>,
        secondary: Arc<S>,
        translator: SchemaTranslator,
        checkpoints: Arc<dyn CheckpointStore>,
        hooks: Arc<dyn ObservabilityHooks>,
        policy: BackoffPolicy,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            translator,
            checkpoints,
            hooks,
            policy,
            config,
            run_lock: Mutex::new(()),
            shutdown: ShutdownHandle::new(),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Signal graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// One pass over every configured collection.
    ///
    /// Fails only with [`DuplexError::ReconcileInProgress`] when another pass
    /// holds the run-lock. Store errors are reported per collection in
    /// [`DriftReport::error`].
    pub async fn run_once(&self) -> Result<Vec<DriftReport>> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| DuplexError::ReconcileInProgress)?;

        let mut reports = Vec::with_capacity(self.config.collections.len());
        for collection in &self.config.collections {
            reports.push(self.scan(collection).await);
        }
        Ok(reports)
    }

    /// One pass over a single collection.
    pub async fn run_collection(&self, collection: &str) -> Result<DriftReport> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| DuplexError::ReconcileInProgress)?;
        Ok(self.scan(collection).await)
    }

    /// Run passes every `interval` until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!(
            "Reconciler started (interval: {:?}, collections: {:?})",
            self.config.interval,
            self.config.collections
        );

        while !self.shutdown.is_shutdown() {
            match self.run_once().await {
                Ok(reports) => {
                    for report in reports.iter().filter(|r| r.has_drift()) {
                        tracing::debug!(
                            collection = %report.collection,
                            "Reconciled {} drifted ids",
                            report.drift_count()
                        );
                    }
                }
                Err(DuplexError::ReconcileInProgress) => {
                    tracing::debug!("Skipping reconcile tick, previous pass still running");
                }
                Err(e) => tracing::error!("Reconciler error: {}", e),
            }
            self.shutdown.sleep(self.config.interval).await;
        }

        tracing::info!("Reconciler shutdown");
        Ok(())
    }

    async fn scan(&self, collection: &str) -> DriftReport {
        let started = Instant::now();
        let mut report = DriftReport::new(collection);

        if let Err(e) = self.scan_into(collection, &mut report).await {
            tracing::warn!(
                collection,
                checkpoint = ?report.checkpoint_id,
                "Reconcile pass stopped early, batch will be retried next pass: {}",
                e
            );
            report.error = Some(e.to_string());
        }

        report.finished_at = chrono::Utc::now();
        observe::record_reconcile_pass(
            started.elapsed(),
            report.scanned_count,
            report.drift_count() as u64,
        );
        if report.has_drift() || report.error.is_some() {
            self.hooks.on_drift_detected(&report);
        }
        tracing::info!(
            collection,
            scanned = report.scanned_count,
            matching = report.matching_count,
            drift = report.drift_count(),
            repaired = report.repaired_count,
            complete = report.complete,
            "Reconcile pass finished in {:?}",
            started.elapsed()
        );
        report
    }

    async fn scan_into(&self, collection: &str, report: &mut DriftReport) -> Result<()> {
        let table = self.translator.table_for(collection);
        let id_column = self.translator.id_column().to_string();
        let page_size = self.config.batch_size;
        let seed = format!("reconcile/{}", collection);

        let resume = self.checkpoints.load(collection)?.map(|c| c.last_id);
        if let Some(id) = &resume {
            tracing::debug!(collection, "Resuming reconcile after '{}'", id);
        }

        let mut primary: Side<Record> = Side::new(resume.clone());
        let mut secondary: Side<SecondaryEntry> = Side::new(resume);
        let mut in_batch = 0usize;
        let mut batches = 0usize;

        loop {
            if primary.needs_page() {
                let after = primary.after.clone();
                let page = with_retries(&self.policy, "primary", &seed, || {
                    self.primary.list_page(collection, after.as_deref(), page_size)
                })
                .await
                .result
                .map_err(reconcile_error)?;
                let last = page.last().map(|r| r.id.clone());
                primary.fill(page, page_size, last);
            }

            if secondary.needs_page() {
                let after = secondary.after.clone();
                let rows = with_retries(&self.policy, "secondary", &seed, || {
                    self.secondary
                        .list_page(&table, &id_column, after.as_deref(), page_size)
                })
                .await
                .result
                .map_err(reconcile_error)?;
                let mut page = Vec::with_capacity(rows.len());
                for row in &rows {
                    let id = row
                        .get(&id_column)
                        .and_then(|v| v.as_text())
                        .ok_or_else(|| {
                            DuplexError::Reconciliation(format!(
                                "row in '{}' has no text '{}' column",
                                table, id_column
                            ))
                        })?
                        .to_string();
                    let mapped = self.translator.to_primary(row).map_err(|e| e.to_string());
                    page.push((id, mapped));
                }
                let last = page.last().map(|(id, _)| id.clone());
                secondary.fill(page, page_size, last);
            }

            let next_id = match (primary.buffer.front(), secondary.buffer.front()) {
                (None, None) => {
                    report.complete = true;
                    break;
                }
                (Some(p), None) => p.id.clone(),
                (None, Some((s, _))) => s.clone(),
                (Some(p), Some((s, _))) => std::cmp::min(&p.id, s).clone(),
            };

            let p = match primary.buffer.front() {
                Some(r) if r.id == next_id => primary.buffer.pop_front(),
                _ => None,
            };
            let s = match secondary.buffer.front() {
                Some((id, _)) if *id == next_id => secondary.buffer.pop_front().map(|(_, m)| m),
                _ => None,
            };

            self.reconcile_id(collection, &next_id, p, s, report).await?;
            report.scanned_count += 1;
            report.checkpoint_id = Some(next_id.clone());
            in_batch += 1;

            if in_batch >= page_size {
                self.checkpoints
                    .save(&ReconcileCheckpoint::new(collection, next_id.as_str()))?;
                batches += 1;
                in_batch = 0;
                tracing::debug!(
                    collection,
                    batch = batches,
                    scanned = report.scanned_count,
                    "Reconcile checkpoint at '{}'",
                    next_id
                );
                if self
                    .config
                    .max_batches_per_pass
                    .is_some_and(|max| batches >= max)
                {
                    return Ok(());
                }
            }
        }

        self.checkpoints.clear(collection)?;
        Ok(())
    }

    async fn reconcile_id(
        &self,
        collection: &str,
        id: &str,
        primary: Option<Record>,
        secondary: Option<std::result::Result<Record, String>>,
        report: &mut DriftReport,
    ) -> Result<()> {
        let policy = self.config.conflict_resolution;
        match (primary, secondary) {
            (None, None) => Ok(()),

            (Some(_), None) => {
                report.primary_only.push(id.to_string());
                if self.replay_fresh(collection, id).await? {
                    report.repaired_count += 1;
                }
                Ok(())
            }

            (None, Some(s)) => {
                report.secondary_only.push(id.to_string());
                let repaired = match (policy, s) {
                    (ConflictResolution::Manual, _) => false,
                    (ConflictResolution::PrimaryWins, _) => self.replay_fresh(collection, id).await?,
                    (ConflictResolution::SecondaryWins, Ok(record)) => {
                        self.promote(record, None).await?
                    }
                    (ConflictResolution::SecondaryWins, Err(reason)) => {
                        tracing::warn!(
                            collection,
                            id,
                            "Cannot backfill unmappable row: {}",
                            reason
                        );
                        false
                    }
                };
                if repaired {
                    report.repaired_count += 1;
                }
                Ok(())
            }

            (Some(p), Some(s)) => {
                let fields = match &s {
                    Ok(record) => self.translator.diff(&p, record),
                    Err(_) => vec![UNMAPPABLE_ROW.to_string()],
                };
                if fields.is_empty() {
                    report.matching_count += 1;
                    return Ok(());
                }
                tracing::debug!(collection, id, ?fields, "Mismatched record");
                report.mismatched.insert(id.to_string(), fields);

                let repaired = match (policy, s) {
                    (ConflictResolution::Manual, _) => false,
                    (ConflictResolution::PrimaryWins, _) => self.replay_fresh(collection, id).await?,
                    (ConflictResolution::SecondaryWins, Ok(record)) => {
                        self.promote(record, p.revision).await?
                    }
                    (ConflictResolution::SecondaryWins, Err(_)) => {
                        // Nothing readable to promote; fall back to the primary copy.
                        self.replay_fresh(collection, id).await?
                    }
                };
                if repaired {
                    report.repaired_count += 1;
                }
                Ok(())
            }
        }
    }

    /// Make the secondary match the primary's current state for `id`.
    ///
    /// Reads the primary again first: if the record exists it is upserted,
    /// otherwise the row is deleted.
    async fn replay_fresh(&self, collection: &str, id: &str) -> Result<bool> {
        let key = format!("{}/{}", collection, id);
        let fresh = with_retries(&self.policy, "primary", &key, || {
            self.primary.get(collection, id)
        })
        .await
        .result
        .map_err(reconcile_error)?;

        let mutation = match &fresh {
            Some(record) => self.translator.upsert_mutation(record)?,
            None => self.translator.delete_mutation(collection, id),
        };
        self.write_secondary(&mutation, &key).await?;
        tracing::info!(
            collection,
            id,
            action = if fresh.is_some() { "upsert" } else { "delete" },
            "Repaired secondary from primary"
        );
        Ok(true)
    }

    /// Write the secondary's version of a record into the primary, then
    /// stamp the secondary row with the new revision.
    ///
    /// Returns `false` if the primary moved past `expected` in the meantime;
    /// the next pass looks at it again.
    async fn promote(&self, record: Record, expected: Option<Revision>) -> Result<bool> {
        let key = record.key();
        let attempt = with_retries(&self.policy, "primary", &key, || {
            self.primary.put(&record, expected.as_ref())
        })
        .await;
        let revision = match attempt.result {
            Ok(revision) => revision,
            Err(e) if e.kind == BackendErrorKind::RevisionConflict => {
                tracing::info!(key = %key, "Primary changed during reconcile, skipping promotion");
                return Ok(false);
            }
            Err(e) => return Err(reconcile_error(e)),
        };

        let mut stamped = record;
        stamped.revision = Some(revision);
        let mutation = self.translator.upsert_mutation(&stamped)?;
        self.write_secondary(&mutation, &key).await?;
        tracing::info!(key = %key, "Repaired primary from secondary");
        Ok(true)
    }

    async fn write_secondary(&self, mutation: &RowMutation, key: &str) -> Result<()> {
        with_retries(&self.policy, "secondary", key, || {
            self.secondary.execute_row(mutation)
        })
        .await
        .result
        .map_err(reconcile_error)
    }
}

fn reconcile_error(error: BackendError) -> DuplexError {
    DuplexError::Reconciliation(error.to_string())
}
