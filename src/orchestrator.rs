//! Orchestrator façade
//!
//! Entry point for the host UI. Every method is either a short in-memory
//! operation or an `async fn` whose disk work runs on the blocking pool, so a
//! UI thread can call it without stalling. The runtime handle captured at
//! construction is used for all spawned work, which lets non-runtime threads
//! call in.

use crate::artifact::{ArtifactStore, MediaDescriptor};
use crate::config::{describe_validation_errors, AtelierConfig};
use crate::error::{ApiError, StorageError};
use crate::events::{EventBus, Subscription, TaskEvent};
use crate::history::{HistoryEntry, HistoryFilter, HistoryLedger, PurgeReport};
use crate::provider::{ApiCredentials, ImageProvider};
use crate::queue::{
    run_blocking, CancelOutcome, ModelTimings, ProgressEstimator, QueueStats, Scheduler,
    SchedulerContext, Task, TaskProgress,
};
use crate::request::GenerationRequest;
use crate::types::{ArtifactRef, TaskId};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct Orchestrator {
    config: AtelierConfig,
    db: sled::Db,
    store: ArtifactStore,
    ledger: HistoryLedger,
    events: Arc<EventBus>,
    scheduler: Scheduler,
    runtime: Handle,
}

impl Orchestrator {
    /// Open on the current tokio runtime.
    pub fn open(
        config: AtelierConfig,
        provider: Arc<dyn ImageProvider>,
        credentials: ApiCredentials,
    ) -> Result<Self, ApiError> {
        let runtime = Handle::try_current()
            .map_err(|e| ApiError::Config(format!("No tokio runtime available: {}", e)))?;
        Self::open_on(runtime, config, provider, credentials)
    }

    /// Open on an explicit runtime, for hosts that call in from their own threads.
    pub fn open_on(
        runtime: Handle,
        config: AtelierConfig,
        provider: Arc<dyn ImageProvider>,
        credentials: ApiCredentials,
    ) -> Result<Self, ApiError> {
        config
            .validate()
            .map_err(|errors| ApiError::Config(describe_validation_errors(&errors)))?;

        let cache_root = config.cache_root();
        std::fs::create_dir_all(&cache_root).map_err(StorageError::from)?;
        let db = sled::open(config.db_path()).map_err(StorageError::from)?;
        let store = ArtifactStore::open(config.artifacts_path(), &db)?;
        let ledger = HistoryLedger::open(&db)?;
        let events = Arc::new(EventBus::default());
        let progress = Arc::new(ProgressEstimator::new());

        let scheduler = Scheduler::start(
            config.scheduler.clone(),
            SchedulerContext {
                provider,
                credentials,
                store: store.clone(),
                ledger: ledger.clone(),
                events: Arc::clone(&events),
                runtime: runtime.clone(),
                progress,
            },
        );

        info!(
            cache_root = %cache_root.display(),
            artifacts = store.len(),
            history = ledger.len(),
            "Orchestrator ready"
        );

        Ok(Self {
            config,
            db,
            store,
            ledger,
            events,
            scheduler,
            runtime,
        })
    }

    pub fn config(&self) -> &AtelierConfig {
        &self.config
    }

    /// Validate and enqueue. Returns as soon as the task is queued.
    pub fn submit(&self, request: GenerationRequest) -> Result<TaskId, ApiError> {
        self.scheduler.submit(request)
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome, ApiError> {
        self.scheduler.cancel(task_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Deliver events to `callback` on a runtime task until the subscription
    /// is dropped. A callback that falls behind is sent the current state of
    /// every resident task.
    pub fn subscribe_with<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(TaskEvent) + Send + 'static,
    {
        self.events
            .subscribe_with_resync(&self.runtime, self.scheduler.snapshot_source(), callback)
    }

    /// Newest-first history page, read on the blocking pool. Each call starts
    /// from the latest entry.
    pub async fn history(&self, filter: HistoryFilter) -> Result<Vec<HistoryEntry>, StorageError> {
        let ledger = self.ledger.clone();
        run_blocking(&self.runtime, move || ledger.query(filter).collect()).await
    }

    pub async fn history_entry(&self, task_id: &TaskId) -> Result<Option<HistoryEntry>, StorageError> {
        let ledger = self.ledger.clone();
        let task_id = *task_id;
        run_blocking(&self.runtime, move || ledger.get(&task_id)).await
    }

    pub async fn artifact_bytes(&self, artifact: ArtifactRef) -> Result<Vec<u8>, StorageError> {
        let store = self.store.clone();
        run_blocking(&self.runtime, move || store.get(&artifact)).await
    }

    /// Add an input image to the artifact store so requests can reference it.
    pub async fn import_image(
        &self,
        bytes: Vec<u8>,
        descriptor: MediaDescriptor,
    ) -> Result<ArtifactRef, StorageError> {
        let store = self.store.clone();
        run_blocking(&self.runtime, move || store.put(&bytes, descriptor, None)).await
    }

    pub async fn purge_history(
        &self,
        task_id: TaskId,
        remove_artifacts: bool,
    ) -> Result<PurgeReport, StorageError> {
        let ledger = self.ledger.clone();
        let store = self.store.clone();
        run_blocking(&self.runtime, move || {
            ledger.purge(&task_id, remove_artifacts, &store)
        })
        .await
    }

    /// Snapshot of a task known to this session. Finished tasks past the
    /// retention limit are only available through [`Self::history_entry`].
    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.scheduler.task(task_id)
    }

    /// Elapsed time and estimated completion of a resident task.
    pub fn progress(&self, task_id: &TaskId) -> Option<TaskProgress> {
        self.scheduler.progress(task_id)
    }

    pub fn timings(&self) -> Option<ModelTimings> {
        self.scheduler.timings()
    }

    pub fn stats(&self) -> QueueStats {
        self.scheduler.stats()
    }

    /// Forget finished tasks held in memory. Their history entries stay.
    pub fn clear_finished(&self) -> usize {
        self.scheduler.clear_finished()
    }

    /// Swap the API key used for subsequent provider calls.
    pub fn update_credentials(&self, credentials: ApiCredentials) {
        self.scheduler.update_credentials(credentials);
    }

    /// Wait until every submitted task is finished and recorded. Returns
    /// `false` on timeout.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_for_idle(timeout).await
    }

    /// Drain the scheduler and flush storage. Later submissions fail with
    /// `ShuttingDown`.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        if let Err(e) = self.db.flush_async().await {
            warn!(error = %e, "Failed to flush database on shutdown");
        }
    }
}
