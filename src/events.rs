//! Task state-change notifications.
//!
//! [`EventBus`] fans out [`TaskEvent`]s over a `tokio::sync::broadcast`
//! channel. Slow receivers lose the oldest events and observe
//! `RecvError::Lagged`; the task map and the history ledger remain the source
//! of truth.

use crate::queue::task::{Task, TaskState};
use crate::types::{ArtifactRef, TaskId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    /// State entered. For removal events, the state the task was in.
    pub state: TaskState,
    /// The task left the queue without reaching a terminal state.
    pub removed: bool,
    pub attempt: u32,
    pub artifacts: Vec<ArtifactRef>,
    /// Human-readable reason for failures and removals.
    pub reason: Option<String>,
    /// Since first dispatch. Final once the task is terminal.
    pub elapsed_ms: Option<u64>,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    /// Event describing the task's current state.
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            state: task.state,
            removed: false,
            attempt: task.attempts,
            artifacts: task.artifacts.clone(),
            reason: task.reason(),
            elapsed_ms: task.elapsed_ms(),
            at: task.updated_at,
        }
    }

    pub fn removed(task: &Task, reason: impl Into<String>) -> Self {
        Self {
            removed: true,
            reason: Some(reason.into()),
            at: Utc::now(),
            ..Self::from_task(task)
        }
    }

    /// No further events follow for this task.
    pub fn is_final(&self) -> bool {
        self.removed || self.state.is_terminal()
    }
}

/// In-process fan-out bus for task events.
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped when nobody listens.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Deliver events to `callback` on a runtime task until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe_with<F>(&self, runtime: &Handle, callback: F) -> Subscription
    where
        F: FnMut(TaskEvent) + Send + 'static,
    {
        self.subscribe_with_resync(runtime, Vec::new, callback)
    }

    /// Like [`Self::subscribe_with`], but after falling behind the callback
    /// receives `snapshot()`, the current state of every known task. A state
    /// may then be delivered twice; terminal states are never skipped for
    /// tasks the snapshot still covers.
    pub fn subscribe_with_resync<S, F>(
        &self,
        runtime: &Handle,
        snapshot: S,
        mut callback: F,
    ) -> Subscription
    where
        S: Fn() -> Vec<TaskEvent> + Send + 'static,
        F: FnMut(TaskEvent) + Send + 'static,
    {
        let mut receiver = self.subscribe();
        let handle = runtime.spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let current = snapshot();
                        warn!(
                            skipped,
                            resent = current.len(),
                            "Event subscriber lagged; resending current task states"
                        );
                        for event in current {
                            callback(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Handle for a callback subscription. Delivery stops when dropped.
#[must_use = "dropping a Subscription stops event delivery"]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {}

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
