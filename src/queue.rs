//! Task Queue & Scheduler
//!
//! FIFO queue of generation tasks served by a fixed pool of worker loops. The
//! pool size bounds concurrent provider calls. A task waiting out a retry
//! backoff does not hold a worker: a timer task moves it to the ready list when
//! the delay elapses, and workers serve the ready list before fresh tasks.

use crate::artifact::{ArtifactStore, MediaDescriptor};
use crate::error::{ApiError, FailureReason, ProviderError, StorageError};
use crate::events::{EventBus, TaskEvent};
use crate::history::HistoryLedger;
use crate::provider::{ApiCredentials, GenerationPayload, ImageProvider, InputImage, RawArtifact};
use crate::request::GenerationRequest;
use crate::types::{ArtifactRef, TaskId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub mod progress;
pub mod task;

pub use progress::{ModelTimings, ProgressEstimator};
pub use task::{Task, TaskState, TransitionError};

const IDLE_POLL: Duration = Duration::from_millis(50);
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(20);

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker count; the most tasks dispatched at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retries allowed after the first attempt.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Deadline for a single provider call.
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,

    /// How long shutdown waits for in-flight attempts.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Finished tasks kept in memory after they are recorded. Older ones are
    /// evicted and remain reachable through the history ledger.
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

fn default_max_concurrency() -> usize {
    2
}

fn default_retry_budget() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_provider_timeout_ms() -> u64 {
    300_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_retain_finished() -> usize {
    500
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry_budget: default_retry_budget(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            provider_timeout_ms: default_provider_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            retain_finished: default_retain_finished(),
        }
    }
}

impl SchedulerConfig {
    /// Delay before retry number `retry_index` (0-based): `base * 2^retry_index`,
    /// capped at `max_backoff`. A provider hint may raise the delay, never past
    /// the cap.
    pub fn backoff_for(&self, retry_index: u32, hint: Option<Duration>) -> Duration {
        let cap = Duration::from_millis(self.max_backoff_ms);
        let factor = 2u64.saturating_pow(retry_index);
        let base = Duration::from_millis(self.base_backoff_ms.saturating_mul(factor)).min(cap);
        match hint {
            Some(hint) => base.max(hint.min(cap)),
            None => base,
        }
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be at least 1".to_string());
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err("max_backoff_ms must not be below base_backoff_ms".to_string());
        }
        if self.provider_timeout_ms == 0 {
            return Err("provider_timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Snapshot of task counts by state. Terminal counts cover every task
/// settled since the scheduler started, evicted ones included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub dispatched: usize,
    pub retrying: usize,
    pub succeeded: usize,
    /// Failed tasks, cancellations excluded.
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub fn active(&self) -> usize {
        self.pending + self.dispatched + self.retrying
    }
}

/// Elapsed time and estimated completion of one task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Since first dispatch; `None` while pending.
    pub elapsed: Option<Duration>,
    /// 0.0 while pending, 1.0 once succeeded, otherwise an estimate below 1.0.
    pub fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was pending and has been dropped from the queue.
    Removed,
    /// The task is in flight or backing off; it will fail as cancelled.
    CancelRequested,
    AlreadyFinished,
}

/// Collaborators a scheduler runs against.
pub struct SchedulerContext {
    pub provider: Arc<dyn ImageProvider>,
    pub credentials: ApiCredentials,
    pub store: ArtifactStore,
    pub ledger: HistoryLedger,
    pub events: Arc<EventBus>,
    pub runtime: Handle,
    /// Completion times, shared by every scheduler started against it.
    pub progress: Arc<ProgressEstimator>,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, Task>,
    pending: VecDeque<TaskId>,
    ready: VecDeque<TaskId>,
    /// Tasks that turned terminal but are not yet recorded and announced.
    finalizing: usize,
    /// Recorded terminal tasks still resident, oldest first.
    finished: VecDeque<TaskId>,
    settled: QueueStats,
    shutting_down: bool,
}

impl QueueState {
    fn count_settled(&mut self, task: &Task) {
        match task.state {
            TaskState::Succeeded => self.settled.succeeded += 1,
            TaskState::Failed => match &task.failure {
                Some(reason) if reason.is_cancellation() => self.settled.cancelled += 1,
                _ => self.settled.failed += 1,
            },
            _ => {}
        }
    }

    /// Drop the oldest finished tasks until at most `keep` remain.
    fn evict_finished(&mut self, keep: usize) -> usize {
        let mut evicted = 0;
        while self.finished.len() > keep {
            if let Some(id) = self.finished.pop_front() {
                self.tasks.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }
}

struct Job {
    id: TaskId,
    request: GenerationRequest,
    attempt: u32,
}

enum NextJob {
    Run(Job),
    Settle(Task),
    Idle,
    Stop,
}

enum AttemptOutcome {
    Generated(Vec<RawArtifact>),
    ProviderFailed { error: ProviderError, timed_out: bool },
    StorageFailed(String),
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    config: SchedulerConfig,
    provider: Arc<dyn ImageProvider>,
    credentials: RwLock<ApiCredentials>,
    store: ArtifactStore,
    ledger: HistoryLedger,
    events: Arc<EventBus>,
    runtime: Handle,
    sleepers: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    progress: Arc<ProgressEstimator>,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create the scheduler and start its worker pool on `context.runtime`.
    pub fn start(config: SchedulerConfig, context: SchedulerContext) -> Self {
        let worker_count = config.max_concurrency.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            config,
            provider: context.provider,
            credentials: RwLock::new(context.credentials),
            store: context.store,
            ledger: context.ledger,
            events: context.events,
            runtime: context.runtime,
            sleepers: Mutex::new(HashMap::new()),
            progress: context.progress,
        });

        let workers = (0..worker_count)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                shared.runtime.clone().spawn(worker_loop(worker_id, shared))
            })
            .collect::<Vec<_>>();

        info!(
            worker_count,
            provider = shared.provider.provider_name(),
            model = shared.provider.model_name(),
            "Started scheduler workers"
        );

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Validate and enqueue. Returns immediately.
    pub fn submit(&self, request: GenerationRequest) -> Result<TaskId, ApiError> {
        request.validate()?;

        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return Err(ApiError::ShuttingDown);
        }
        let task = Task::new(request);
        let id = task.id;
        self.shared.events.publish(TaskEvent::from_task(&task));
        state.tasks.insert(id, task);
        state.pending.push_back(id);
        let queued = state.pending.len();
        drop(state);

        debug!(task_id = %id, queued, "Task submitted");
        self.shared.notify.notify_one();
        Ok(id)
    }

    /// Cancel a task. Tasks no longer resident are looked up in the ledger on
    /// the blocking pool.
    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, ApiError> {
        if let Some(outcome) = self.cancel_resident(id) {
            return Ok(outcome);
        }
        let ledger = self.shared.ledger.clone();
        if run_blocking(&self.shared.runtime, move || ledger.contains(&id)).await? {
            Ok(CancelOutcome::AlreadyFinished)
        } else {
            Err(ApiError::TaskNotFound(id))
        }
    }

    fn cancel_resident(&self, id: TaskId) -> Option<CancelOutcome> {
        let mut state = self.shared.state.lock();
        let task = state.tasks.get_mut(&id)?;

        let outcome = match task.state {
            TaskState::Pending => {
                state.pending.retain(|queued| *queued != id);
                if let Some(task) = state.tasks.remove(&id) {
                    self.shared
                        .events
                        .publish(TaskEvent::removed(&task, "cancelled"));
                }
                info!(task_id = %id, "Cancelled pending task");
                CancelOutcome::Removed
            }
            TaskState::Dispatched | TaskState::Retrying => {
                task.cancel_requested = true;
                info!(task_id = %id, state = %task.state, "Cancellation requested");
                CancelOutcome::CancelRequested
            }
            TaskState::Succeeded | TaskState::Failed => CancelOutcome::AlreadyFinished,
        };
        Some(outcome)
    }

    /// Resident task snapshot. Finished tasks past `retain_finished` are only
    /// in the history ledger.
    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.shared.state.lock().tasks.get(id).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        let mut stats = QueueStats {
            pending: 0,
            dispatched: 0,
            retrying: 0,
            ..state.settled
        };
        for task in state.tasks.values() {
            match task.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Dispatched => stats.dispatched += 1,
                TaskState::Retrying => stats.retrying += 1,
                TaskState::Succeeded | TaskState::Failed => {}
            }
        }
        stats
    }

    /// Drop every recorded finished task from memory. Returns how many were
    /// removed.
    pub fn clear_finished(&self) -> usize {
        let cleared = self.shared.state.lock().evict_finished(0);
        debug!(cleared, "Cleared finished tasks");
        cleared
    }

    /// Elapsed time and estimated completion of a resident task.
    pub fn progress(&self, id: &TaskId) -> Option<TaskProgress> {
        let task = self.task(id)?;
        let elapsed = task.elapsed();
        let fraction = match (task.state, elapsed) {
            (TaskState::Succeeded, _) => 1.0,
            (_, Some(elapsed)) => self
                .shared
                .progress
                .estimate(self.shared.provider.model_name(), elapsed),
            (_, None) => 0.0,
        };
        Some(TaskProgress {
            task_id: task.id,
            state: task.state,
            elapsed,
            fraction,
        })
    }

    /// Recorded completion times for the active model.
    pub fn timings(&self) -> Option<ModelTimings> {
        self.shared.progress.timings(self.shared.provider.model_name())
    }

    /// Current state of every resident task as events, oldest first. Used to
    /// resynchronize subscribers that fell behind.
    pub fn snapshot_events(&self) -> Vec<TaskEvent> {
        self.shared.snapshot_events()
    }

    /// [`Self::snapshot_events`] as a callable that outlives this borrow.
    pub fn snapshot_source(&self) -> impl Fn() -> Vec<TaskEvent> + Send + Sync + 'static {
        let shared = Arc::clone(&self.shared);
        move || shared.snapshot_events()
    }

    pub fn update_credentials(&self, credentials: ApiCredentials) {
        *self.shared.credentials.write() = credentials;
        info!("Provider credentials updated");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Wait until no task is active and every terminal task has been recorded.
    /// Returns `false` on timeout.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.shared.is_idle() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            sleep(IDLE_CHECK_INTERVAL).await;
        }
    }

    /// Graceful shutdown.
    ///
    /// Pending tasks are removed, backing-off tasks fail with `Shutdown`, and
    /// in-flight attempts get `shutdown_grace` to finish without retrying.
    /// Workers still running after that are aborted and their tasks fail with
    /// `Shutdown`.
    pub async fn shutdown(&self) {
        let failed = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;

            let pending: Vec<TaskId> = state.pending.drain(..).collect();
            for id in pending {
                if let Some(task) = state.tasks.remove(&id) {
                    self.shared
                        .events
                        .publish(TaskEvent::removed(&task, "shutdown"));
                }
            }
            state.ready.clear();

            let mut failed = Vec::new();
            for task in state.tasks.values_mut() {
                if task.state == TaskState::Retrying && task.fail(FailureReason::Shutdown).is_ok() {
                    failed.push(task.clone());
                }
            }
            state.finalizing += failed.len();
            failed
        };

        for (_, sleeper) in self.shared.sleepers.lock().drain() {
            sleeper.abort();
        }
        for task in failed {
            self.shared.settle(task).await;
        }
        self.shared.notify.notify_waiters();

        let workers = std::mem::take(&mut *self.workers.lock());
        let deadline = tokio::time::Instant::now() + self.shared.config.shutdown_grace();
        let mut aborted = 0usize;
        for mut handle in workers {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
                aborted += 1;
            }
        }

        let stranded = {
            let mut state = self.shared.state.lock();
            let mut stranded = Vec::new();
            for task in state.tasks.values_mut() {
                if task.state == TaskState::Dispatched && task.fail(FailureReason::Shutdown).is_ok() {
                    stranded.push(task.clone());
                }
            }
            state.finalizing += stranded.len();
            stranded
        };
        let stranded_count = stranded.len();
        for task in stranded {
            self.shared.settle(task).await;
        }

        info!(aborted, stranded = stranded_count, "Scheduler shut down");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
        for (_, sleeper) in self.shared.sleepers.lock().drain() {
            sleeper.abort();
        }
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<Shared>) {
    debug!(worker_id, "Worker started");
    loop {
        match shared.next_job() {
            NextJob::Run(job) => shared.run_job(worker_id, job).await,
            NextJob::Settle(task) => shared.settle_detached(task).await,
            NextJob::Idle => {
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = sleep(IDLE_POLL) => {}
                }
            }
            NextJob::Stop => break,
        }
    }
    debug!(worker_id, "Worker stopped");
}

impl Shared {
    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.finalizing == 0 && state.tasks.values().all(|t| t.is_terminal())
    }

    fn snapshot_events(&self) -> Vec<TaskEvent> {
        let state = self.state.lock();
        let mut events: Vec<TaskEvent> = state.tasks.values().map(TaskEvent::from_task).collect();
        events.sort_by_key(|event| event.at);
        events
    }

    /// Pop the next runnable task and mark it dispatched.
    fn next_job(&self) -> NextJob {
        let mut state = self.state.lock();
        loop {
            let Some(id) = state.ready.pop_front().or_else(|| state.pending.pop_front()) else {
                return if state.shutting_down {
                    NextJob::Stop
                } else {
                    NextJob::Idle
                };
            };
            let Some(task) = state.tasks.get_mut(&id) else {
                continue;
            };

            if task.cancel_requested {
                if task.fail(FailureReason::Cancelled).is_err() {
                    continue;
                }
                let snapshot = task.clone();
                state.finalizing += 1;
                return NextJob::Settle(snapshot);
            }

            if let Err(e) = task.dispatch() {
                error!(task_id = %id, error = %e, "Queued task in unexpected state");
                continue;
            }
            self.events.publish(TaskEvent::from_task(task));
            return NextJob::Run(Job {
                id,
                request: task.request.clone(),
                attempt: task.attempts,
            });
        }
    }

    async fn run_job(self: &Arc<Self>, worker_id: usize, job: Job) {
        let started = Instant::now();
        let outcome = self.attempt(&job).await;
        debug!(
            worker_id,
            task_id = %job.id,
            attempt = job.attempt,
            provider = self.provider.provider_name(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Attempt finished"
        );
        self.complete_attempt(job, outcome).await;
    }

    async fn attempt(&self, job: &Job) -> AttemptOutcome {
        let inputs = match self.load_inputs(&job.request).await {
            Ok(inputs) => inputs,
            Err(e) => return AttemptOutcome::StorageFailed(e.to_string()),
        };
        let payload = match GenerationPayload::compose(&job.request, inputs) {
            Ok(payload) => payload,
            Err(error) => {
                return AttemptOutcome::ProviderFailed {
                    error,
                    timed_out: false,
                }
            }
        };

        let credentials = self.credentials.read().clone();
        let timeout = self.config.provider_timeout();
        match tokio::time::timeout(timeout, self.provider.generate(&payload, &credentials)).await {
            Ok(Ok(raws)) if raws.is_empty() => AttemptOutcome::ProviderFailed {
                error: ProviderError::InvalidRequest("provider returned no images".to_string()),
                timed_out: false,
            },
            Ok(Ok(raws)) => AttemptOutcome::Generated(raws),
            Ok(Err(error)) => AttemptOutcome::ProviderFailed {
                error,
                timed_out: false,
            },
            Err(_) => AttemptOutcome::ProviderFailed {
                error: ProviderError::Transient(format!(
                    "provider call timed out after {}ms",
                    timeout.as_millis()
                )),
                timed_out: true,
            },
        }
    }

    async fn load_inputs(&self, request: &GenerationRequest) -> Result<Vec<InputImage>, StorageError> {
        let refs: Vec<ArtifactRef> = request.input_images().copied().collect();
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.clone();
        run_blocking(&self.runtime, move || {
            refs.into_iter()
                .map(|artifact| {
                    let bytes = store.get(&artifact)?;
                    let descriptor = store
                        .describe(&artifact)?
                        .map(|record| record.descriptor)
                        .unwrap_or_else(|| MediaDescriptor::sniffed(&bytes));
                    Ok(InputImage {
                        artifact,
                        bytes,
                        descriptor,
                    })
                })
                .collect()
        })
        .await
    }

    async fn complete_attempt(self: &Arc<Self>, job: Job, outcome: AttemptOutcome) {
        if self.cancel_requested(&job.id) {
            info!(task_id = %job.id, attempt = job.attempt, "Discarding result of cancelled task");
            self.finish_and_settle(job.id, |task| task.fail(FailureReason::Cancelled))
                .await;
            return;
        }

        match outcome {
            AttemptOutcome::Generated(raws) => {
                let resolution = job.request.resolution;
                let store = self.store.clone();
                let id = job.id;
                let stored = run_blocking(&self.runtime, move || {
                    raws.iter()
                        .map(|raw| store.put(&raw.bytes, raw.descriptor().with_resolution(resolution), Some(id)))
                        .collect::<Result<Vec<_>, _>>()
                })
                .await;

                match stored {
                    Ok(artifacts) => {
                        info!(
                            task_id = %job.id,
                            attempt = job.attempt,
                            artifacts = artifacts.len(),
                            "Task succeeded"
                        );
                        self.finish_and_settle(job.id, |task| task.succeed(artifacts))
                            .await;
                    }
                    Err(e) => {
                        error!(task_id = %job.id, error = %e, "Failed to store generated images");
                        self.finish_and_settle(job.id, |task| {
                            task.fail(FailureReason::Storage(e.to_string()))
                        })
                        .await;
                    }
                }
            }
            AttemptOutcome::StorageFailed(message) => {
                warn!(task_id = %job.id, error = %message, "Could not load input images");
                self.finish_and_settle(job.id, |task| task.fail(FailureReason::Storage(message)))
                    .await;
            }
            AttemptOutcome::ProviderFailed { error, timed_out } => {
                self.handle_provider_failure(job, error, timed_out).await;
            }
        }
    }

    async fn handle_provider_failure(self: &Arc<Self>, job: Job, error: ProviderError, timed_out: bool) {
        let decision = {
            let mut state = self.state.lock();
            let shutting_down = state.shutting_down;
            let Some(task) = state.tasks.get_mut(&job.id) else {
                return;
            };

            let may_retry = error.is_retryable() && task.retry_count < self.config.retry_budget;
            if may_retry && !shutting_down {
                match task.schedule_retry() {
                    Ok(()) => {
                        self.events.publish(TaskEvent::from_task(task));
                        let delay = self
                            .config
                            .backoff_for(task.retry_count - 1, error.retry_after());
                        Ok((task.retry_count, delay))
                    }
                    Err(e) => {
                        error!(task_id = %job.id, error = %e, "Could not schedule retry");
                        return;
                    }
                }
            } else {
                let reason = if may_retry {
                    FailureReason::Shutdown
                } else if timed_out {
                    FailureReason::Timeout
                } else {
                    FailureReason::Provider(error.clone())
                };
                Err(reason)
            }
        };

        match decision {
            Ok((retry, delay)) => {
                warn!(
                    task_id = %job.id,
                    attempt = job.attempt,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Provider attempt failed, retrying"
                );
                self.spawn_backoff(job.id, delay);
            }
            Err(reason) => {
                error!(
                    task_id = %job.id,
                    attempt = job.attempt,
                    kind = error.kind(),
                    error = %error,
                    "Task failed permanently"
                );
                self.finish_and_settle(job.id, |task| task.fail(reason)).await;
            }
        }
    }

    fn cancel_requested(&self, id: &TaskId) -> bool {
        self.state
            .lock()
            .tasks
            .get(id)
            .map(|t| t.cancel_requested)
            .unwrap_or(false)
    }

    fn spawn_backoff(self: &Arc<Self>, id: TaskId, delay: Duration) {
        let shared = Arc::clone(self);
        let mut sleepers = self.sleepers.lock();
        let handle = self.runtime.spawn(async move {
            sleep(delay).await;
            shared.backoff_elapsed(id).await;
        });
        sleepers.insert(id, handle);
    }

    async fn backoff_elapsed(self: &Arc<Self>, id: TaskId) {
        self.sleepers.lock().remove(&id);

        let finished = {
            let mut state = self.state.lock();
            let shutting_down = state.shutting_down;
            let Some(task) = state.tasks.get_mut(&id) else {
                return;
            };
            if task.state != TaskState::Retrying {
                return;
            }
            let reason = if task.cancel_requested {
                Some(FailureReason::Cancelled)
            } else if shutting_down {
                Some(FailureReason::Shutdown)
            } else {
                None
            };
            match reason {
                Some(reason) => match task.fail(reason) {
                    Ok(()) => {
                        let snapshot = task.clone();
                        state.finalizing += 1;
                        Some(snapshot)
                    }
                    Err(_) => None,
                },
                None => {
                    state.ready.push_back(id);
                    None
                }
            }
        };

        match finished {
            Some(task) => self.settle(task).await,
            None => self.notify.notify_one(),
        }
    }

    /// Apply a terminal transition, then record and announce it.
    async fn finish_and_settle<F>(self: &Arc<Self>, id: TaskId, finish: F)
    where
        F: FnOnce(&mut Task) -> Result<(), TransitionError>,
    {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get_mut(&id) else {
                return;
            };
            if let Err(e) = finish(task) {
                error!(task_id = %id, error = %e, "Invalid terminal transition");
                return;
            }
            let snapshot = task.clone();
            state.finalizing += 1;
            snapshot
        };
        self.settle_detached(snapshot).await;
    }

    /// Settle on its own runtime task so aborting a worker cannot interrupt it.
    async fn settle_detached(self: &Arc<Self>, task: Task) {
        let shared = Arc::clone(self);
        let handle = self.runtime.spawn(async move { shared.settle(task).await });
        let _ = handle.await;
    }

    /// Record a terminal task in the ledger, then announce it.
    ///
    /// Successful completion times feed the progress estimator. Once recorded,
    /// the task counts toward the settled totals and may be evicted.
    async fn settle(&self, task: Task) {
        let ledger = self.ledger.clone();
        let snapshot = task.clone();
        match run_blocking(&self.runtime, move || ledger.record(&snapshot)).await {
            Ok(_) => {}
            Err(StorageError::AlreadyRecorded(id)) => {
                warn!(task_id = %id, "Task was already recorded");
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to record task history");
            }
        }
        if task.state == TaskState::Succeeded {
            if let Some(elapsed) = task.elapsed() {
                self.progress.record(self.provider.model_name(), elapsed);
            }
        }
        self.events.publish(TaskEvent::from_task(&task));

        let mut state = self.state.lock();
        state.finalizing = state.finalizing.saturating_sub(1);
        state.count_settled(&task);
        if state.tasks.contains_key(&task.id) {
            state.finished.push_back(task.id);
        }
        let evicted = state.evict_finished(self.config.retain_finished);
        if evicted > 0 {
            debug!(evicted, "Evicted finished tasks");
        }
    }
}

/// Run blocking storage work on the runtime's blocking pool.
pub(crate) async fn run_blocking<T, F>(runtime: &Handle, work: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    runtime.spawn_blocking(work).await.map_err(|e| {
        StorageError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("storage task failed: {}", e),
        ))
    })?
}
