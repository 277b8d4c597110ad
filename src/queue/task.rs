//! Task entity and its state machine.
//!
//! ```text
//! Pending -> Dispatched -> Succeeded
//!                      -> Failed
//!                      -> Retrying -> Dispatched
//!                                  -> Failed      (cancelled or shutting down)
//! ```

use crate::error::FailureReason;
use crate::request::GenerationRequest;
use crate::types::{ArtifactRef, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Dispatched,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (Dispatched, Succeeded)
                | (Dispatched, Failed)
                | (Dispatched, Retrying)
                | (Retrying, Dispatched)
                | (Retrying, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Dispatched => "dispatched",
            TaskState::Retrying => "retrying",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskState::Pending),
            "dispatched" => Ok(TaskState::Dispatched),
            "retrying" => Ok(TaskState::Retrying),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            other => Err(format!("unknown task state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid task transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}

/// A queued generation task.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub request: GenerationRequest,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// First dispatch.
    pub started_at: Option<DateTime<Utc>>,
    /// Provider calls started so far.
    pub attempts: u32,
    /// Retries scheduled so far.
    pub retry_count: u32,
    pub artifacts: Vec<ArtifactRef>,
    pub failure: Option<FailureReason>,
    pub cancel_requested: bool,
    /// Every state the task has been in, in order.
    pub history: Vec<TaskState>,
}

impl Task {
    pub fn new(request: GenerationRequest) -> Self {
        Self::with_id(TaskId::new(), request)
    }

    pub fn with_id(id: TaskId, request: GenerationRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            request,
            state: TaskState::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            attempts: 0,
            retry_count: 0,
            artifacts: Vec::new(),
            failure: None,
            cancel_requested: false,
            history: vec![TaskState::Pending],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transition(&mut self, next: TaskState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        self.history.push(next);
        Ok(())
    }

    /// Start an attempt.
    pub fn dispatch(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskState::Dispatched)?;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(self.updated_at);
        }
        Ok(())
    }

    pub fn succeed(&mut self, artifacts: Vec<ArtifactRef>) -> Result<(), TransitionError> {
        self.transition(TaskState::Succeeded)?;
        self.artifacts = artifacts;
        Ok(())
    }

    pub fn fail(&mut self, reason: FailureReason) -> Result<(), TransitionError> {
        self.transition(TaskState::Failed)?;
        self.failure = Some(reason);
        Ok(())
    }

    pub fn schedule_retry(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskState::Retrying)?;
        self.retry_count += 1;
        Ok(())
    }

    /// Wall time since the first dispatch, frozen once the task is terminal.
    /// Retry backoff counts toward it.
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        let started = self.started_at?;
        let until = if self.is_terminal() {
            self.updated_at
        } else {
            Utc::now()
        };
        Some((until - started).to_std().unwrap_or_default())
    }

    pub fn elapsed_ms(&self) -> Option<u64> {
        self.elapsed().map(|d| d.as_millis() as u64)
    }

    /// Human-readable reason for a failed task.
    pub fn reason(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }
}

/// Whether a sequence of states is a walk through the state machine starting
/// at `Pending`.
pub fn is_valid_path(states: &[TaskState]) -> bool {
    match states.first() {
        Some(TaskState::Pending) => states.windows(2).all(|w| w[0].can_transition_to(w[1])),
        _ => false,
    }
}
