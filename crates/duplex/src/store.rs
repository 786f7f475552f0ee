//! The [`DuplexStore`] façade: one handle over both stores.

use crate::checkpoint::MemoryCheckpointStore;
use crate::coordinator::{DualWriteCoordinator, WriteOptions};
use crate::hooks::TracingHooks;
use crate::reconciler::{ConsistencyReconciler, ReconcilerConfig};
use crate::retry::{with_retries, BackoffPolicy};
use crate::routing::RoutingEngine;
use crate::translator::SchemaTranslator;
use crate::worker::{CompensationStats, CompensationWorker, CompensationWorkerConfig};
use duplex_core::{
    CheckpointStore, DriftReport, DuplexConfig, DuplexError, ObservabilityHooks, Predicate,
    PrimaryStore, Record, Result, Revision, RoutingDecision, SecondaryStore,
    StructuralFeatureSet, Target, WriteReceipt,
};
use duplex_sqlite::{SqliteCheckpointStore, SqliteConfig, SqliteSecondaryStore};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A routed read.
///
/// Carries the structural features of an already-compiled query plus the
/// compiled statement for each store. Only the statement for the chosen
/// store is needed.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub collection: String,
    pub features: StructuralFeatureSet,
    /// Primary-side selector (a JSON document matched by the primary store).
    pub selector: Option<Value>,
    /// Secondary-side predicate.
    pub predicate: Option<Predicate>,
}

impl ReadRequest {
    pub fn new(collection: impl Into<String>, features: StructuralFeatureSet) -> Self {
        Self {
            collection: collection.into(),
            features,
            selector: None,
            predicate: None,
        }
    }

    pub fn with_selector(mut self, selector: Value) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

/// Builder for [`DuplexStore`]
pub struct DuplexStoreBuilder<P, S> {
    primary: Arc<P>,
    secondary: Arc<S>,
    config: DuplexConfig,
    hooks: Option<Arc<dyn ObservabilityHooks>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    worker_id: Option<String>,
}

impl<P, S> DuplexStoreBuilder<P, S>
where
    P: PrimaryStore,
    S: SecondaryStore,
{
    pub fn with_hooks(mut self, hooks: Arc<dyn ObservabilityHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Where the reconciler keeps its resume points. Defaults to memory.
    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = Some(id.into());
        self
    }

    pub fn build(self) -> Result<DuplexStore<P, S>> {
        self.config.validate()?;

        let hooks = self
            .hooks
            .unwrap_or_else(|| Arc::new(TracingHooks) as Arc<dyn ObservabilityHooks>);
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()) as Arc<dyn CheckpointStore>);
        let policy = BackoffPolicy::from_config(&self.config);

        let coordinator = DualWriteCoordinator::new(
            self.primary.clone(),
            self.secondary.clone(),
            &self.config,
        )
        .with_hooks(hooks.clone())
        .with_policy(policy.clone());

        let mut worker_config = CompensationWorkerConfig::from_config(&self.config);
        if let Some(id) = self.worker_id {
            worker_config = worker_config.with_worker_id(id);
        }
        let worker = CompensationWorker::from_coordinator(&coordinator, worker_config);

        let reconciler = ConsistencyReconciler::new(
            self.primary,
            self.secondary,
            coordinator.translator().clone(),
            checkpoints,
            hooks,
            policy,
            ReconcilerConfig::from_config(&self.config),
        );

        tracing::info!(
            write_mode = ?self.config.write_mode,
            collections = ?self.config.collections,
            "Duplex store ready"
        );

        Ok(DuplexStore {
            router: RoutingEngine::from_config(&self.config),
            config: self.config,
            coordinator,
            worker: Arc::new(worker),
            reconciler: Arc::new(reconciler),
        })
    }
}

/// Hybrid data-access façade
///
/// Routes reads, dual-writes through the [`DualWriteCoordinator`] and owns
/// the compensation worker and reconciler that keep the secondary store
/// converging on the primary.
pub struct DuplexStore<P, S>
where
    P: PrimaryStore,
    S: SecondaryStore,
{
    config: DuplexConfig,
    router: RoutingEngine,
    coordinator: DualWriteCoordinator<P, S>,
    worker: Arc<CompensationWorker<P, S>>,
    reconciler: Arc<ConsistencyReconciler<P, S>>,
}

impl<P, S> DuplexStore<P, S>
where
    P: PrimaryStore,
    S: SecondaryStore,
{
    pub fn builder(primary: Arc<P>, secondary: Arc<S>, config: DuplexConfig) -> DuplexStoreBuilder<P, S> {
        DuplexStoreBuilder {
            primary,
            secondary,
            config,
            hooks: None,
            checkpoints: None,
            worker_id: None,
        }
    }

    /// Build with default hooks and in-memory checkpoints.
    pub fn new(primary: Arc<P>, secondary: Arc<S>, config: DuplexConfig) -> Result<Self> {
        Self::builder(primary, secondary, config).build()
    }

    pub fn config(&self) -> &DuplexConfig {
        &self.config
    }

    pub fn router(&self) -> &RoutingEngine {
        &self.router
    }

    pub fn coordinator(&self) -> &DualWriteCoordinator<P, S> {
        &self.coordinator
    }

    pub fn translator(&self) -> &SchemaTranslator {
        self.coordinator.translator()
    }

    pub fn worker(&self) -> &Arc<CompensationWorker<P, S>> {
        &self.worker
    }

    pub fn reconciler(&self) -> &Arc<ConsistencyReconciler<P, S>> {
        &self.reconciler
    }

    pub fn route(&self, features: &StructuralFeatureSet) -> RoutingDecision {
        self.router.route(features)
    }

    /// Route `request` and run it against the chosen store.
    ///
    /// Secondary rows come back translated to canonical records. `Both`
    /// reads are served by the primary.
    pub async fn read(&self, request: &ReadRequest) -> Result<Vec<Record>> {
        if request.features.is_write {
            return Err(DuplexError::Config(format!(
                "read on '{}' carries the write flag",
                request.collection
            )));
        }

        let decision = self.router.route(&request.features);
        tracing::debug!(
            collection = %request.collection,
            target = %decision.target,
            confidence = decision.confidence,
            "Routing read: {}",
            decision.rationale
        );

        match decision.target {
            Target::Primary | Target::Both => self.read_primary(request).await,
            Target::Secondary => self.read_secondary(request).await,
        }
    }

    async fn read_primary(&self, request: &ReadRequest) -> Result<Vec<Record>> {
        let selector = request.selector.as_ref().ok_or_else(|| {
            DuplexError::Config(format!(
                "read on '{}' routed to primary but has no selector",
                request.collection
            ))
        })?;
        let primary = self.coordinator.primary();
        with_retries(
            self.coordinator.policy(),
            "primary",
            &request.collection,
            || primary.find(&request.collection, selector),
        )
        .await
        .result
        .map_err(DuplexError::Backend)
    }

    async fn read_secondary(&self, request: &ReadRequest) -> Result<Vec<Record>> {
        let predicate = request.predicate.as_ref().ok_or_else(|| {
            DuplexError::Config(format!(
                "read on '{}' routed to secondary but has no predicate",
                request.collection
            ))
        })?;
        let translator = self.translator();
        let table = translator.table_for(&request.collection);
        let secondary = self.coordinator.secondary();
        let rows = with_retries(
            self.coordinator.policy(),
            "secondary",
            &request.collection,
            || secondary.query(&table, predicate),
        )
        .await
        .result
        .map_err(DuplexError::Backend)?;

        rows.iter().map(|row| translator.to_primary(row)).collect()
    }

    /// Point read, always from the primary.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let primary = self.coordinator.primary();
        with_retries(self.coordinator.policy(), "primary", id, || {
            primary.get(collection, id)
        })
        .await
        .result
        .map_err(DuplexError::Backend)
    }

    pub async fn upsert(&self, record: Record) -> Result<WriteReceipt> {
        self.coordinator.upsert(record).await
    }

    pub async fn upsert_with(&self, record: Record, options: WriteOptions) -> Result<WriteReceipt> {
        self.coordinator.upsert_with(record, options).await
    }

    pub async fn delete(
        &self,
        collection: &str,
        id: &str,
        expected: Option<Revision>,
    ) -> Result<WriteReceipt> {
        self.coordinator.delete(collection, id, expected).await
    }

    pub async fn delete_with(
        &self,
        collection: &str,
        id: &str,
        expected: Option<Revision>,
        options: WriteOptions,
    ) -> Result<WriteReceipt> {
        self.coordinator
            .delete_with(collection, id, expected, options)
            .await
    }

    pub async fn bulk_upsert(&self, records: Vec<Record>) -> Result<Vec<Result<WriteReceipt>>> {
        self.coordinator.bulk_upsert(records).await
    }

    /// One reconciler pass over every configured collection.
    pub async fn reconcile_once(&self) -> Result<Vec<DriftReport>> {
        self.reconciler.run_once().await
    }

    pub async fn reconcile_collection(&self, collection: &str) -> Result<DriftReport> {
        self.reconciler.run_collection(collection).await
    }

    /// One compensation cycle.
    pub async fn compensate_once(&self) -> CompensationStats {
        self.worker.run_once().await
    }

    /// Replay compensations until nothing is due.
    pub async fn drain_compensations(&self) -> CompensationStats {
        self.worker.drain().await
    }

    /// Start the compensation worker and reconciler timer on the runtime.
    ///
    /// Loops stopped through the returned handle do not restart; build a
    /// new store to run them again.
    pub fn spawn_background(&self) -> BackgroundHandle {
        let worker = self.worker.clone();
        let reconciler = self.reconciler.clone();
        tracing::info!("Starting duplex background tasks");

        BackgroundHandle {
            worker_shutdown: worker.shutdown_handle(),
            reconciler_shutdown: reconciler.shutdown_handle(),
            worker: tokio::spawn(worker.run()),
            reconciler: tokio::spawn(reconciler.run()),
        }
    }
}

impl<P: PrimaryStore> DuplexStore<P, SqliteSecondaryStore> {
    /// Use a SQLite file as the secondary store, with reconciler checkpoints
    /// in the same database.
    pub fn open_sqlite(primary: Arc<P>, sqlite: SqliteConfig, config: DuplexConfig) -> Result<Self> {
        let secondary = SqliteSecondaryStore::open(sqlite)?;
        let checkpoints = SqliteCheckpointStore::new(secondary.conn().clone())?;
        Self::builder(primary, Arc::new(secondary), config)
            .with_checkpoints(Arc::new(checkpoints))
            .build()
    }
}

/// Running background loops started by [`DuplexStore::spawn_background`]
pub struct BackgroundHandle {
    worker_shutdown: crate::shutdown::ShutdownHandle,
    reconciler_shutdown: crate::shutdown::ShutdownHandle,
    worker: JoinHandle<Result<()>>,
    reconciler: JoinHandle<Result<()>>,
}

impl BackgroundHandle {
    /// Signal both loops and wait for them to finish their current cycle.
    pub async fn shutdown(self) -> Result<()> {
        self.worker_shutdown.shutdown();
        self.reconciler_shutdown.shutdown();

        let worker = self.worker.await.map_err(|e| anyhow::anyhow!(e))?;
        let reconciler = self.reconciler.await.map_err(|e| anyhow::anyhow!(e))?;
        tracing::info!("Duplex background tasks stopped");
        worker.and(reconciler)
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished() && self.reconciler.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPrimaryStore, MemorySecondaryStore};
    use duplex_core::{ColumnValue, Feature, WriteMode, WriteState};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> DuplexConfig {
        DuplexConfig::default()
            .with_collection("users")
            .with_backoff(0, 1.0, 0)
            .with_backoff_jitter(0.0)
            .with_max_retries(2)
    }

    fn store() -> (
        Arc<MemoryPrimaryStore>,
        Arc<MemorySecondaryStore>,
        DuplexStore<MemoryPrimaryStore, MemorySecondaryStore>,
    ) {
        let primary = Arc::new(MemoryPrimaryStore::new());
        let secondary = Arc::new(MemorySecondaryStore::new());
        let store = DuplexStore::new(primary.clone(), secondary.clone(), config()).unwrap();
        (primary, secondary, store)
    }

    #[tokio::test]
    async fn test_read_dispatches_by_route() {
        let (_, secondary, store) = store();
        store
            .upsert(Record::new("users", "u1").with("name", "Alice"))
            .await
            .unwrap();
        store
            .upsert(Record::new("users", "u2").with("name", "Bob"))
            .await
            .unwrap();

        // Plain read goes to the primary selector.
        let plain = ReadRequest::new("users", StructuralFeatureSet::read())
            .with_selector(json!({"name": "Alice"}))
            .with_predicate(Predicate::All);
        let calls = secondary.calls();
        let found = store.read(&plain).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "u1");
        assert_eq!(secondary.calls(), calls);

        // A join goes to the secondary and comes back as records.
        let joined = ReadRequest::new(
            "users",
            StructuralFeatureSet::read().with(Feature::Join),
        )
        .with_predicate(Predicate::Eq {
            column: "name".into(),
            value: ColumnValue::Text("Bob".into()),
        });
        let found = store.read(&joined).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "u2");
        assert!(found[0].revision.is_some());
        assert_eq!(found[0].get("name"), Some(&json!("Bob")));
    }

    #[tokio::test]
    async fn test_read_without_statement_is_config_error() {
        let (_, _, store) = store();
        let request = ReadRequest::new("users", StructuralFeatureSet::read());
        assert!(matches!(
            store.read(&request).await,
            Err(DuplexError::Config(_))
        ));

        let write = ReadRequest::new("users", StructuralFeatureSet::write())
            .with_selector(json!({}));
        assert!(matches!(store.read(&write).await, Err(DuplexError::Config(_))));
    }

    #[tokio::test]
    async fn test_get_reads_primary() {
        let (_, _, store) = store();
        let receipt = store
            .upsert(Record::new("users", "u1").with("name", "Alice"))
            .await
            .unwrap();
        let fetched = store.get("users", "u1").await.unwrap().unwrap();
        assert_eq!(fetched.revision, receipt.revision);
        assert!(store.get("users", "missing").await.unwrap().is_none());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = DuplexStore::new(
            Arc::new(MemoryPrimaryStore::new()),
            Arc::new(MemorySecondaryStore::new()),
            DuplexConfig::default().with_reconcile_batch_size(0),
        );
        assert!(matches!(result, Err(DuplexError::Config(_))));
    }

    #[tokio::test]
    async fn test_background_loops_replay_and_stop() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        let secondary = Arc::new(MemorySecondaryStore::new());
        let store = DuplexStore::new(
            primary.clone(),
            secondary.clone(),
            config()
                .with_write_mode(WriteMode::DualWrite)
                .with_compensation_poll_interval_ms(5),
        )
        .unwrap();

        secondary.set_available(false);
        let receipt = store
            .upsert(Record::new("users", "u1").with("name", "Alice"))
            .await
            .unwrap();
        assert_eq!(receipt.state, WriteState::CompensationQueued);
        secondary.set_available(true);

        let handle = store.spawn_background();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while secondary.peek("users", "u1").is_none() {
            assert!(tokio::time::Instant::now() < deadline, "worker never replayed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.shutdown().await.unwrap();
        assert!(store.coordinator().queue().is_empty());
    }
}
