//! Scripted provider for tests and offline runs.
//!
//! Replays a queue of outcomes. Steps can be keyed to a prompt substring so
//! concurrent tasks get deterministic behavior regardless of dispatch order.
//! When no step applies, the call succeeds with bytes derived from the prompt.

use crate::error::ProviderError;
use crate::provider::payload::GenerationPayload;
use crate::provider::{ApiCredentials, ImageProvider, RawArtifact};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Succeed(Vec<u8>),
    Fail(ProviderError),
    /// Wait, then resolve the inner step.
    Stall(Duration, Box<ScriptStep>),
}

impl ScriptStep {
    pub fn succeed(bytes: impl Into<Vec<u8>>) -> Self {
        ScriptStep::Succeed(bytes.into())
    }

    pub fn fail(error: ProviderError) -> Self {
        ScriptStep::Fail(error)
    }

    pub fn transient() -> Self {
        ScriptStep::Fail(ProviderError::Transient("scripted transient failure".to_string()))
    }

    pub fn after(self, delay: Duration) -> Self {
        ScriptStep::Stall(delay, Box::new(self))
    }
}

/// One observed call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub image_count: usize,
    pub tagged: bool,
}

struct KeyedScript {
    needle: String,
    steps: VecDeque<ScriptStep>,
}

#[derive(Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptStep>>,
    keyed: Mutex<Vec<KeyedScript>>,
    repeat: Mutex<Option<ScriptStep>>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes consumed in call order.
    pub fn with_steps(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        let provider = Self::new();
        provider.push_steps(steps);
        provider
    }

    /// Every call resolves to `step`.
    pub fn always(step: ScriptStep) -> Self {
        let provider = Self::new();
        *provider.repeat.lock() = Some(step);
        provider
    }

    pub fn push_steps(&self, steps: impl IntoIterator<Item = ScriptStep>) {
        self.steps.lock().extend(steps);
    }

    /// Outcomes for calls whose prompt contains `needle`. Checked before the
    /// unkeyed queue.
    pub fn for_prompt(&self, needle: impl Into<String>, steps: impl IntoIterator<Item = ScriptStep>) {
        self.keyed.lock().push(KeyedScript {
            needle: needle.into(),
            steps: steps.into_iter().collect(),
        });
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Highest number of simultaneous `generate` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Bytes produced for a prompt when no step is scripted.
    pub fn default_bytes(prompt: &str) -> Vec<u8> {
        format!("scripted-image:{}", prompt).into_bytes()
    }

    fn next_step(&self, prompt: &str) -> ScriptStep {
        {
            let mut keyed = self.keyed.lock();
            if let Some(script) = keyed
                .iter_mut()
                .find(|s| prompt.contains(&s.needle) && !s.steps.is_empty())
            {
                if let Some(step) = script.steps.pop_front() {
                    return step;
                }
            }
        }
        if let Some(step) = self.steps.lock().pop_front() {
            return step;
        }
        if let Some(step) = self.repeat.lock().clone() {
            return step;
        }
        ScriptStep::Succeed(Self::default_bytes(prompt))
    }

    async fn resolve(mut step: ScriptStep) -> Result<Vec<RawArtifact>, ProviderError> {
        loop {
            match step {
                ScriptStep::Succeed(bytes) => return Ok(vec![RawArtifact::new(bytes, None)]),
                ScriptStep::Fail(error) => return Err(error),
                ScriptStep::Stall(delay, inner) => {
                    sleep(delay).await;
                    step = *inner;
                }
            }
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageProvider for ScriptedProvider {
    async fn generate(
        &self,
        payload: &GenerationPayload,
        _credentials: &ApiCredentials,
    ) -> Result<Vec<RawArtifact>, ProviderError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        self.calls.lock().push(RecordedCall {
            prompt: payload.prompt.clone(),
            image_count: payload.images.len(),
            tagged: payload.tagged,
        });
        let step = self.next_step(&payload.prompt);
        Self::resolve(step).await
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
