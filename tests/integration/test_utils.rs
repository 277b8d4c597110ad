//! Shared test utilities for integration tests
//!
//! Orchestrator setup over a temp cache root, fast scheduler settings, event
//! collection, and serialized access to configuration environment variables.

use atelier::provider::ScriptedProvider;
use atelier::{
    ApiCredentials, AtelierConfig, Orchestrator, SchedulerConfig, TaskEvent, TaskId,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

/// Serializes HOME / XDG_CONFIG_HOME / ATELIER__* access across tests.
static CONFIG_ENV_MUTEX: Mutex<()> = Mutex::new(());

const ENV_KEYS: [&str; 2] = ["HOME", "XDG_CONFIG_HOME"];

struct EnvState {
    saved: Vec<(String, Option<String>)>,
}

impl EnvState {
    fn capture() -> Self {
        let mut saved: Vec<(String, Option<String>)> = ENV_KEYS
            .iter()
            .map(|key| (key.to_string(), std::env::var(key).ok()))
            .collect();
        for (key, value) in std::env::vars() {
            if key.starts_with("ATELIER__") {
                saved.push((key, Some(value)));
            }
        }
        Self { saved }
    }

    fn restore(self) {
        let overrides: Vec<String> = std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with("ATELIER__"))
            .collect();
        for key in overrides {
            std::env::remove_var(key);
        }
        for (key, value) in self.saved {
            match value {
                Some(v) => std::env::set_var(&key, v),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Run `f` with HOME and XDG_CONFIG_HOME pointing into `test_dir`, then restore
/// the environment, dropping any ATELIER__* variables the test set.
pub fn with_config_env<F, R>(test_dir: &TempDir, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = CONFIG_ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let env_state = EnvState::capture();

    let test_config_home = test_dir.path().join("config");
    let test_home = test_dir.path().join("home");
    std::fs::create_dir_all(&test_config_home).unwrap();
    std::fs::create_dir_all(&test_home).unwrap();
    std::env::set_var("HOME", test_home.to_str().unwrap());
    std::env::set_var("XDG_CONFIG_HOME", test_config_home.to_str().unwrap());

    let result = f();

    env_state.restore();
    result
}

/// Scheduler settings with millisecond backoffs.
pub fn fast_scheduler(max_concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency,
        retry_budget: 3,
        base_backoff_ms: 10,
        max_backoff_ms: 50,
        provider_timeout_ms: 5_000,
        shutdown_grace_ms: 2_000,
        retain_finished: 500,
    }
}

pub fn test_config(dir: &TempDir, scheduler: SchedulerConfig) -> AtelierConfig {
    AtelierConfig {
        scheduler,
        ..AtelierConfig::with_cache_root(dir.path().join("cache"))
    }
}

pub fn open_orchestrator(
    dir: &TempDir,
    provider: Arc<ScriptedProvider>,
    scheduler: SchedulerConfig,
) -> Orchestrator {
    Orchestrator::open(
        test_config(dir, scheduler),
        provider,
        ApiCredentials::new("test-key"),
    )
    .unwrap()
}

/// Events for `task_id` up to and including its final event.
pub async fn events_until_final(
    receiver: &mut Receiver<TaskEvent>,
    task_id: TaskId,
    timeout: Duration,
) -> Vec<TaskEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Ok(event)) if event.task_id == task_id => {
                let last = event.is_final();
                events.push(event);
                if last {
                    return events;
                }
            }
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) | Err(_) => {
                panic!("no final event for {} (saw {:?})", task_id, events)
            }
        }
    }
}

/// Wait for the first event for `task_id` in `state`.
pub async fn wait_for_state(
    receiver: &mut Receiver<TaskEvent>,
    task_id: TaskId,
    state: atelier::TaskState,
) -> TaskEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Ok(event)) if event.task_id == task_id && event.state == state && !event.removed => {
                return event
            }
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) | Err(_) => {
                panic!("task {} never reached {}", task_id, state)
            }
        }
    }
}

/// Minimal PNG header with the given dimensions. Enough for format sniffing.
pub fn png_header(width: u32, height: u32, tail: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes.extend_from_slice(tail);
    bytes
}
