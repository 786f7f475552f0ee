//! Compensation worker
//!
//! Drains the [`CompensationQueue`]: claims due tasks under a lease, replays
//! each one against the secondary store once, and either removes it,
//! reschedules it with exponential backoff, or dead-letters it once
//! `max_retries` attempts have failed.
//!
//! A replay re-reads the record from the primary and writes that state, not
//! the queued payload. A late enqueue from an older write can then never roll
//! the secondary back past a newer committed revision.
//!
//! # Example
//!
//! ```no_run
//! use duplex::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(coordinator: DualWriteCoordinator<MemoryPrimaryStore, MemorySecondaryStore>) {
//! let worker = Arc::new(CompensationWorker::from_coordinator(
//!     &coordinator,
//!     CompensationWorkerConfig::default(),
//! ));
//! let handle = worker.shutdown_handle();
//! let task = tokio::spawn(worker.clone().run());
//!
//! // later
//! handle.shutdown();
//! let _ = task.await;
//! # }
//! ```

use crate::compensation::{ClaimedTask, CompensationQueue};
use crate::coordinator::DualWriteCoordinator;
use crate::retry::BackoffPolicy;
use crate::shutdown::ShutdownHandle;
use crate::translator::SchemaTranslator;
use chrono::Utc;
use duplex_core::{
    observe, CompensationPayload, DuplexConfig, DuplexError, ObservabilityHooks, PrimaryStore,
    Result, RowMutation, SecondaryStore,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct CompensationWorkerConfig {
    /// Identifies this worker in lease records and logs.
    pub worker_id: String,

    /// How often to poll for due tasks when idle.
    pub poll_interval: Duration,

    /// Visibility timeout for a claimed task.
    pub lease: Duration,

    /// Max tasks claimed per cycle.
    pub batch_size: usize,
}

impl Default for CompensationWorkerConfig {
    fn default() -> Self {
        Self::from_config(&DuplexConfig::default())
    }
}

impl CompensationWorkerConfig {
    pub fn from_config(config: &DuplexConfig) -> Self {
        Self {
            worker_id: "compensation-worker".to_string(),
            poll_interval: Duration::from_millis(config.compensation_poll_interval_ms),
            lease: Duration::from_millis(config.compensation_lease_ms),
            batch_size: config.compensation_batch_size,
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }
}

/// Worker metrics
#[derive(Default)]
pub struct CompensationMetrics {
    /// Tasks replayed successfully
    pub successes: AtomicU64,

    /// Failed replay attempts
    pub failures: AtomicU64,

    /// Tasks moved to the dead-letter set
    pub dead_letters: AtomicU64,

    /// Unix seconds of the last cycle
    pub last_run: AtomicU64,
}

impl CompensationMetrics {
    fn update_last_run(&self) {
        self.last_run
            .store(Utc::now().timestamp().max(0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CompensationMetricsSnapshot {
        CompensationMetricsSnapshot {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            last_run: self.last_run.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationMetricsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub dead_letters: u64,
    pub last_run: u64,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationStats {
    pub claimed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Claims whose lease was lost or superseded before completion.
    pub stale: usize,
}

pub struct CompensationWorker<P: PrimaryStore, S: SecondaryStore> {
    queue: Arc<CompensationQueue>,
    primary: Arc<P>,
    secondary: Arc<S>,
    translator: SchemaTranslator,
    policy: BackoffPolicy,
    hooks: Arc<dyn ObservabilityHooks>,
    config: CompensationWorkerConfig,
    shutdown: ShutdownHandle,
    metrics: Arc<CompensationMetrics>,
}

impl<P: PrimaryStore, S: SecondaryStore> CompensationWorker<P, S> {
    pub fn new(
        queue: Arc<CompensationQueue>,
        primary: Arc<P>,
        secondary: Arc<S>,
        translator: SchemaTranslator,
        policy: BackoffPolicy,
        hooks: Arc<dyn ObservabilityHooks>,
        config: CompensationWorkerConfig,
    ) -> Self {
        Self {
            queue,
            primary,
            secondary,
            translator,
            policy,
            hooks,
            config,
            shutdown: ShutdownHandle::new(),
            metrics: Arc::new(CompensationMetrics::default()),
        }
    }

    /// Worker sharing the coordinator's queue, store, translator, policy and
    /// hooks.
    pub fn from_coordinator(
        coordinator: &DualWriteCoordinator<P, S>,
        config: CompensationWorkerConfig,
    ) -> Self {
        Self::new(
            coordinator.queue().clone(),
            coordinator.primary().clone(),
            coordinator.secondary().clone(),
            coordinator.translator().clone(),
            coordinator.policy().clone(),
            coordinator.hooks().clone(),
            config,
        )
    }

    pub fn metrics(&self) -> &Arc<CompensationMetrics> {
        &self.metrics
    }

    pub fn queue(&self) -> &Arc<CompensationQueue> {
        &self.queue
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Run until shutdown, sleeping `poll_interval` whenever a cycle finds
    /// nothing due.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!(
            worker = %self.config.worker_id,
            "Compensation worker started (poll interval: {:?})",
            self.config.poll_interval
        );

        while !self.shutdown.is_shutdown() {
            let stats = self.run_once().await;
            if stats.claimed == 0 {
                self.shutdown.sleep(self.config.poll_interval).await;
            } else {
                tracing::debug!(
                    worker = %self.config.worker_id,
                    "Compensation cycle: {:?}",
                    stats
                );
            }
        }

        tracing::info!(worker = %self.config.worker_id, "Compensation worker shutdown");
        Ok(())
    }

    /// Claim and replay one batch of due tasks.
    pub async fn run_once(&self) -> CompensationStats {
        let mut stats = CompensationStats::default();
        let claimed = self.queue.claim_due(
            Utc::now(),
            self.config.batch_size,
            self.config.lease,
            &self.config.worker_id,
        );
        stats.claimed = claimed.len();

        for claim in claimed {
            self.process(claim, &mut stats).await;
        }

        observe::set_compensation_depth(self.queue.len());
        self.metrics.update_last_run();
        stats
    }

    /// Repeat [`run_once`](Self::run_once) until nothing is due.
    pub async fn drain(&self) -> CompensationStats {
        let mut total = CompensationStats::default();
        loop {
            let stats = self.run_once().await;
            if stats.claimed == 0 {
                return total;
            }
            total.claimed += stats.claimed;
            total.succeeded += stats.succeeded;
            total.rescheduled += stats.rescheduled;
            total.dead_lettered += stats.dead_lettered;
            total.stale += stats.stale;
        }
    }

    /// Mutation bringing the secondary to the primary's current state.
    async fn mutation_for(&self, claim: &ClaimedTask) -> Result<RowMutation> {
        let task = &claim.task;
        let id = task.record_id();
        let fresh = self
            .primary
            .get(&task.collection, id)
            .await
            .map_err(DuplexError::Backend)?;

        match fresh {
            Some(record) => {
                if let CompensationPayload::Record(queued) = &task.payload {
                    if queued.revision != record.revision {
                        tracing::debug!(
                            task = %task.id,
                            queued = ?queued.revision,
                            current = ?record.revision,
                            "Replaying current primary revision instead of queued payload"
                        );
                    }
                }
                self.translator.upsert_mutation(&record)
            }
            None => Ok(self.translator.delete_mutation(&task.collection, id)),
        }
    }

    async fn process(&self, claim: ClaimedTask, stats: &mut CompensationStats) {
        let task = &claim.task;
        let attempt = task.attempts + 1;

        tracing::debug!(
            task = %task.id,
            collection = %task.collection,
            id = %task.record_id(),
            "Replaying compensation (attempt {}/{})",
            attempt,
            self.policy.max_retries
        );

        let result = match self.mutation_for(&claim).await {
            Ok(mutation) => self
                .secondary
                .execute_row(&mutation)
                .await
                .map_err(DuplexError::SecondaryWrite),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                if self.queue.complete(&claim.lease) {
                    stats.succeeded += 1;
                    self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                    observe::record_compensation("succeeded");
                    tracing::info!(
                        task = %task.id,
                        collection = %task.collection,
                        id = %task.record_id(),
                        "Compensation succeeded after {} failed attempts",
                        task.attempts
                    );
                } else {
                    stats.stale += 1;
                }
            }
            Err(e) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                observe::record_compensation("failed");

                // Mapping errors never improve with retries.
                let permanent = match &e {
                    DuplexError::Mapping(_) => true,
                    DuplexError::SecondaryWrite(b) | DuplexError::Backend(b) => !b.is_retryable(),
                    _ => false,
                };
                let exhausted = attempt >= self.policy.max_retries;

                if permanent || exhausted {
                    match self.queue.dead_letter(&claim.lease, e.to_string()) {
                        Some(dead) => {
                            stats.dead_lettered += 1;
                            self.metrics.dead_letters.fetch_add(1, Ordering::Relaxed);
                            observe::record_compensation("dead_lettered");
                            tracing::error!(
                                task = %dead.id,
                                "Compensation moved to dead letters after {} attempts: {}",
                                dead.attempts,
                                e
                            );
                            self.hooks.on_compensation_exhausted(&dead);
                        }
                        None => stats.stale += 1,
                    }
                } else {
                    let delay = self
                        .policy
                        .delay_with_jitter(attempt, &task.id.to_string());
                    let next = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    match self.queue.fail(&claim.lease, e.to_string(), next) {
                        Some(_) => {
                            stats.rescheduled += 1;
                            tracing::warn!(
                                task = %task.id,
                                retry_in_ms = delay.as_millis() as u64,
                                "Compensation attempt {}/{} failed: {}",
                                attempt,
                                self.policy.max_retries,
                                e
                            );
                        }
                        None => stats.stale += 1,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPrimaryStore, MemorySecondaryStore};
    use duplex_core::{BackendError, ColumnValue, CompensationTask, Record, Row};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Exhausted(Mutex<Vec<CompensationTask>>);

    impl ObservabilityHooks for Exhausted {
        fn on_compensation_exhausted(&self, task: &CompensationTask) {
            self.0.lock().push(task.clone());
        }
    }

    type TestWorker = CompensationWorker<MemoryPrimaryStore, MemorySecondaryStore>;

    fn worker(
        queue: Arc<CompensationQueue>,
        primary: Arc<MemoryPrimaryStore>,
        secondary: Arc<MemorySecondaryStore>,
        hooks: Arc<Exhausted>,
        max_retries: u32,
    ) -> TestWorker {
        CompensationWorker::new(
            queue,
            primary,
            secondary,
            SchemaTranslator::default(),
            BackoffPolicy::immediate(max_retries),
            hooks,
            CompensationWorkerConfig::default(),
        )
    }

    fn enqueue(queue: &CompensationQueue, record: Record) {
        queue.enqueue(
            "users",
            CompensationPayload::Record(record),
            Utc::now(),
            None,
        );
    }

    fn alice() -> Record {
        Record::new("users", "u1").with("name", "Alice")
    }

    #[tokio::test]
    async fn test_replays_and_removes_task() {
        let queue = Arc::new(CompensationQueue::new());
        let primary = Arc::new(MemoryPrimaryStore::new());
        let secondary = Arc::new(MemorySecondaryStore::new());
        primary.insert_raw(alice());
        enqueue(&queue, alice());

        let w = worker(queue.clone(), primary, secondary.clone(), Arc::default(), 3);
        let stats = w.run_once().await;
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.succeeded, 1);
        assert!(queue.is_empty());
        assert!(secondary.peek("users", "u1").is_some());
        assert_eq!(w.metrics().snapshot().successes, 1);

        // nothing left to do
        assert_eq!(w.run_once().await.claimed, 0);
    }

    #[tokio::test]
    async fn test_replay_uses_current_primary_state() {
        let queue = Arc::new(CompensationQueue::new());
        let primary = Arc::new(MemoryPrimaryStore::new());
        let secondary = Arc::new(MemorySecondaryStore::new());
        let stale = alice();
        primary.insert_raw(alice());
        let current = primary.insert_raw(Record::new("users", "u1").with("name", "Alicia"));
        enqueue(&queue, stale);

        let w = worker(queue.clone(), primary.clone(), secondary.clone(), Arc::default(), 3);
        assert_eq!(w.run_once().await.succeeded, 1);

        let row = secondary.peek("users", "u1").unwrap();
        assert_eq!(row.get("name"), Some(&ColumnValue::from("Alicia")));
        assert_eq!(row.get("_rev"), Some(&ColumnValue::from(current.as_str())));

        // Gone from the primary since it was queued: the row goes too.
        secondary.insert_raw(Row::new("users").with("id", "u2"), "id");
        enqueue(&queue, Record::new("users", "u2"));
        assert_eq!(w.run_once().await.succeeded, 1);
        assert!(secondary.peek("users", "u2").is_none());
    }

    #[tokio::test]
    async fn test_primary_read_failure_reschedules() {
        let queue = Arc::new(CompensationQueue::new());
        let primary = Arc::new(MemoryPrimaryStore::new());
        let secondary = Arc::new(MemorySecondaryStore::new());
        primary.insert_raw(alice());
        primary.fail_next(BackendError::transient("timeout"));
        enqueue(&queue, alice());

        let w = worker(queue.clone(), primary, secondary.clone(), Arc::default(), 3);
        let stats = w.run_once().await;
        assert_eq!(stats.rescheduled, 1);
        assert_eq!(secondary.calls(), 0);

        assert_eq!(w.drain().await.succeeded, 1);
        assert!(secondary.peek("users", "u1").is_some());
    }

    #[tokio::test]
    async fn test_failures_back_off_then_dead_letter() {
        let queue = Arc::new(CompensationQueue::new());
        let primary = Arc::new(MemoryPrimaryStore::new());
        let secondary = Arc::new(MemorySecondaryStore::new());
        let hooks = Arc::new(Exhausted::default());
        primary.insert_raw(alice());
        secondary.set_available(false);
        enqueue(&queue, alice());

        let w = worker(queue.clone(), primary, secondary.clone(), hooks.clone(), 3);
        let stats = w.drain().await;
        assert_eq!(stats.claimed, 3);
        assert_eq!(stats.rescheduled, 2);
        assert_eq!(stats.dead_lettered, 1);

        assert!(queue.is_empty());
        assert_eq!(queue.dead_letter_count(), 1);
        let exhausted = hooks.0.lock();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].attempts, 3);
        assert_eq!(w.metrics().snapshot().dead_letters, 1);
    }

    #[tokio::test]
    async fn test_rejected_rows_dead_letter_immediately() {
        let queue = Arc::new(CompensationQueue::new());
        let primary = Arc::new(MemoryPrimaryStore::new());
        let secondary = Arc::new(MemorySecondaryStore::new());
        primary.insert_raw(alice());
        secondary.fail_next(BackendError::rejected("constraint"));
        enqueue(&queue, alice());

        let w = worker(queue.clone(), primary, secondary, Arc::default(), 5);
        let stats = w.run_once().await;
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(queue.dead_letter_count(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_deletes_row() {
        let queue = Arc::new(CompensationQueue::new());
        let primary = Arc::new(MemoryPrimaryStore::new());
        let secondary = Arc::new(MemorySecondaryStore::new());
        let translator = SchemaTranslator::default();
        secondary
            .execute_row(&translator.upsert_mutation(&alice()).unwrap())
            .await
            .unwrap();

        queue.enqueue(
            "users",
            CompensationPayload::Tombstone {
                id: "u1".into(),
                revision: None,
            },
            Utc::now(),
            None,
        );
        let w = worker(queue.clone(), primary, secondary.clone(), Arc::default(), 3);
        assert_eq!(w.run_once().await.succeeded, 1);
        assert!(secondary.peek("users", "u1").is_none());
    }
}
