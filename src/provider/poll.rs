//! Bounded exponential-backoff polling for asynchronously completing providers.

use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay before the first status check.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for the doubling delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Give up after this long.
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_poll_timeout_secs() -> u64 {
    300
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl PollConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before check number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let millis = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay_ms == 0 {
            return Err("poll.initial_delay_ms must be greater than 0".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("poll.max_delay_ms must not be below poll.initial_delay_ms".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("poll.timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Outcome of one status check.
#[derive(Debug)]
pub enum PollStatus<T> {
    Pending,
    Ready(T),
}

/// Call `check` with growing delays until it reports `Ready`, an error, or the
/// timeout elapses.
pub async fn poll_until<T, F, Fut>(config: &PollConfig, mut check: F) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, ProviderError>>,
{
    let deadline = Instant::now() + config.timeout();
    let mut attempt = 0u32;

    loop {
        let delay = config.delay_for(attempt);
        if Instant::now() + delay > deadline {
            return Err(ProviderError::Transient(format!(
                "polling timed out after {}s",
                config.timeout_secs
            )));
        }
        sleep(delay).await;

        match check(attempt).await? {
            PollStatus::Ready(value) => {
                debug!(attempt, "Operation completed");
                return Ok(value);
            }
            PollStatus::Pending => {
                debug!(attempt, next_delay_ms = ?config.delay_for(attempt + 1), "Operation pending");
                attempt += 1;
            }
        }
    }
}
