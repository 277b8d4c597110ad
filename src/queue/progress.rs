//! Progress estimation from recent completion times.
//!
//! Providers report no progress of their own, so an in-flight task's progress
//! is estimated from how long the last few successful tasks on the same model
//! took. The curve approaches but never reaches 1.0 until the task succeeds.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

/// Completion times kept per model.
pub const TIMING_WINDOW: usize = 10;

/// Expected duration for a model with no recorded completions.
pub const DEFAULT_ESTIMATE: Duration = Duration::from_secs(60);

/// Ceiling for an estimate while the task is still running.
pub const MAX_ESTIMATE: f64 = 0.99;

/// Summary of a model's recorded completion times.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelTimings {
    pub count: usize,
    pub average: Duration,
    pub min: Duration,
    pub max: Duration,
}

#[derive(Debug, Default)]
pub struct ProgressEstimator {
    samples: Mutex<HashMap<String, VecDeque<Duration>>>,
}

impl ProgressEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how long a successful task took. Zero durations are ignored.
    pub fn record(&self, model: &str, elapsed: Duration) {
        if model.is_empty() || elapsed.is_zero() {
            return;
        }
        let mut samples = self.samples.lock();
        let window = samples.entry(model.to_string()).or_default();
        if window.len() == TIMING_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed);
        debug!(
            model,
            elapsed_ms = elapsed.as_millis() as u64,
            samples = window.len(),
            "Recorded completion time"
        );
    }

    /// Expected total duration: the window average, or [`DEFAULT_ESTIMATE`].
    pub fn expected(&self, model: &str) -> Duration {
        let samples = self.samples.lock();
        match samples.get(model).filter(|w| !w.is_empty()) {
            Some(window) => window.iter().sum::<Duration>() / window.len() as u32,
            None => DEFAULT_ESTIMATE,
        }
    }

    /// Estimated fraction complete after `elapsed`, in `[0, MAX_ESTIMATE]`.
    ///
    /// `0.99 * (1 - e^(-2t/T))` for expected duration `T`: about 86% at `T`,
    /// rising slowly after that.
    pub fn estimate(&self, model: &str, elapsed: Duration) -> f64 {
        if elapsed.is_zero() {
            return 0.0;
        }
        let expected = self.expected(model).as_secs_f64().max(f64::EPSILON);
        let ratio = elapsed.as_secs_f64() / expected;
        (MAX_ESTIMATE * (1.0 - (-2.0 * ratio).exp())).min(MAX_ESTIMATE)
    }

    pub fn timings(&self, model: &str) -> Option<ModelTimings> {
        let samples = self.samples.lock();
        let window = samples.get(model).filter(|w| !w.is_empty())?;
        Some(ModelTimings {
            count: window.len(),
            average: window.iter().sum::<Duration>() / window.len() as u32,
            min: window.iter().copied().min().unwrap_or_default(),
            max: window.iter().copied().max().unwrap_or_default(),
        })
    }
}
