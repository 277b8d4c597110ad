//! End-to-end scheduler behavior against a scripted provider

use super::test_utils::{events_until_final, fast_scheduler, open_orchestrator, wait_for_state};
use atelier::error::{ProviderError, StorageError, ValidationError};
use atelier::provider::{ScriptStep, ScriptedProvider};
use atelier::queue::task::is_valid_path;
use atelier::{
    ApiError, ArtifactRef, CancelOutcome, FailureReason, GenerationRequest, HistoryFilter,
    TaskState,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const IDLE: Duration = Duration::from_secs(10);

fn prompt(text: &str) -> GenerationRequest {
    GenerationRequest::builder().prompt(text).build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_more_than_ten_references_rejected_without_task() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(2));
    let mut events = orchestrator.subscribe();

    let references: Vec<ArtifactRef> = (0..11u8)
        .map(|i| ArtifactRef::for_bytes(&[i]))
        .collect();
    let request = GenerationRequest::builder()
        .prompt("too many")
        .references(references)
        .build();

    let err = orchestrator.submit(request).unwrap_err();
    assert!(matches!(
        err,
        ApiError::Validation(ValidationError::TooManyReferences { count: 11, max: 10 })
    ));
    assert_eq!(orchestrator.stats().active(), 0);
    assert!(events.try_recv().is_err());
    assert_eq!(provider.call_count(), 0);
    assert_eq!(orchestrator.history(HistoryFilter::all()).await.unwrap().len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_success_stores_artifact_and_records_history() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(2));
    let mut events = orchestrator.subscribe();

    let id = orchestrator.submit(prompt("a quiet harbor")).unwrap();
    let seen = events_until_final(&mut events, id, IDLE).await;
    let states: Vec<TaskState> = seen.iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![TaskState::Pending, TaskState::Dispatched, TaskState::Succeeded]
    );

    let artifact = seen.last().unwrap().artifacts[0];
    let bytes = orchestrator.artifact_bytes(artifact).await.unwrap();
    assert_eq!(bytes, ScriptedProvider::default_bytes("a quiet harbor"));

    let entry = orchestrator.history_entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.state, TaskState::Succeeded);
    assert_eq!(entry.artifacts, vec![artifact]);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_history_entry_per_terminal_task() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    provider.for_prompt(
        "rejected",
        [ScriptStep::fail(ProviderError::ContentPolicyRejected(
            "SAFETY".to_string(),
        ))],
    );
    provider.for_prompt("flaky", [ScriptStep::transient()]);
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(3));

    let mut ids = Vec::new();
    for text in ["plain one", "rejected two", "flaky three", "plain four", "plain five"] {
        ids.push(orchestrator.submit(prompt(text)).unwrap());
    }
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let entries: Vec<_> = orchestrator
        .history(HistoryFilter::all())
        .await
        .unwrap();
    assert_eq!(entries.len(), ids.len());
    for id in &ids {
        assert_eq!(entries.iter().filter(|e| e.task_id == *id).count(), 1);
        let task = orchestrator.task(id).unwrap();
        assert!(is_valid_path(&task.history), "{:?}", task.history);
    }

    let stats = orchestrator.stats();
    assert_eq!(stats.succeeded, 4);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.active(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_bound_is_budget_plus_one_attempts() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::always(ScriptStep::transient()));
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(1));

    let id = orchestrator.submit(prompt("never works")).unwrap();
    assert!(orchestrator.wait_for_idle(IDLE).await);

    assert_eq!(provider.call_count(), 4);
    let task = orchestrator.task(&id).unwrap();
    assert_eq!(task.attempts, 4);
    assert_eq!(task.retry_count, 3);
    assert_eq!(task.state, TaskState::Failed);
    assert!(matches!(
        task.failure,
        Some(FailureReason::Provider(ProviderError::Transient(_)))
    ));
    use TaskState::*;
    assert_eq!(
        task.history,
        vec![Pending, Dispatched, Retrying, Dispatched, Retrying, Dispatched, Retrying, Dispatched, Failed]
    );
    assert_eq!(orchestrator.history_entry(&id).await.unwrap().unwrap().attempts, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transient_then_success_recovers() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::with_steps([
        ScriptStep::fail(ProviderError::RateLimited {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_millis(20)),
        }),
        ScriptStep::succeed(b"second try".to_vec()),
    ]));
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(1));
    let mut events = orchestrator.subscribe();

    let id = orchestrator.submit(prompt("eventually")).unwrap();
    let states: Vec<TaskState> = events_until_final(&mut events, id, IDLE)
        .await
        .iter()
        .map(|e| e.state)
        .collect();
    assert_eq!(
        states,
        vec![
            TaskState::Pending,
            TaskState::Dispatched,
            TaskState::Retrying,
            TaskState::Dispatched,
            TaskState::Succeeded
        ]
    );
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifo_dispatch_with_single_worker() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    provider.for_prompt(
        "task-a",
        [ScriptStep::succeed(b"a".to_vec()).after(Duration::from_millis(300))],
    );
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(1));
    let mut events = orchestrator.subscribe();

    let a = orchestrator.submit(prompt("task-a")).unwrap();
    let b = orchestrator.submit(prompt("task-b")).unwrap();
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        order.push((event.task_id, event.state));
    }
    let position = |id, state| order.iter().position(|e| *e == (id, state)).unwrap();
    assert!(position(a, TaskState::Dispatched) < position(b, TaskState::Dispatched));
    assert!(position(a, TaskState::Succeeded) < position(b, TaskState::Dispatched));
    assert_eq!(provider.max_in_flight(), 1);
    assert_eq!(orchestrator.task(&b).unwrap().state, TaskState::Succeeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_respected() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::always(
        ScriptStep::succeed(b"slow".to_vec()).after(Duration::from_millis(100)),
    ));
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(2));

    for i in 0..6 {
        orchestrator.submit(prompt(&format!("batch {}", i))).unwrap();
    }
    assert!(orchestrator.wait_for_idle(IDLE).await);
    assert_eq!(provider.call_count(), 6);
    assert_eq!(provider.max_in_flight(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_content_policy_rejection_fails_without_retry() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::with_steps([ScriptStep::fail(
        ProviderError::ContentPolicyRejected("PROHIBITED_CONTENT".to_string()),
    )]));
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(1));

    let id = orchestrator.submit(prompt("something forbidden")).unwrap();
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let task = orchestrator.task(&id).unwrap();
    assert_eq!(
        task.history,
        vec![TaskState::Pending, TaskState::Dispatched, TaskState::Failed]
    );
    assert_eq!(task.retry_count, 0);
    assert_eq!(provider.call_count(), 1);
    let entry = orchestrator.history_entry(&id).await.unwrap().unwrap();
    assert!(entry.reason.unwrap().contains("PROHIBITED_CONTENT"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_while_dispatched_discards_result() {
    let dir = TempDir::new().unwrap();
    let late = b"bytes that arrive too late".to_vec();
    let provider = Arc::new(ScriptedProvider::with_steps([
        ScriptStep::succeed(late.clone()).after(Duration::from_millis(300)),
    ]));
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(1));
    let mut events = orchestrator.subscribe();

    let id = orchestrator.submit(prompt("cancel me")).unwrap();
    wait_for_state(&mut events, id, TaskState::Dispatched).await;
    assert_eq!(
        orchestrator.cancel(id).await.unwrap(),
        CancelOutcome::CancelRequested
    );
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let task = orchestrator.task(&id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.failure, Some(FailureReason::Cancelled));
    assert!(task.artifacts.is_empty());
    assert!(matches!(
        orchestrator
            .artifact_bytes(ArtifactRef::for_bytes(&late))
            .await,
        Err(StorageError::ArtifactNotFound(_))
    ));
    assert_eq!(orchestrator.stats().cancelled, 1);
    assert_eq!(
        orchestrator.cancel(id).await.unwrap(),
        CancelOutcome::AlreadyFinished
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_pending_removes_task() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    provider.for_prompt(
        "blocker",
        [ScriptStep::succeed(b"x".to_vec()).after(Duration::from_millis(300))],
    );
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(1));
    let mut events = orchestrator.subscribe();

    let blocker = orchestrator.submit(prompt("blocker")).unwrap();
    wait_for_state(&mut events, blocker, TaskState::Dispatched).await;
    let queued = orchestrator.submit(prompt("queued")).unwrap();

    assert_eq!(orchestrator.cancel(queued).await.unwrap(), CancelOutcome::Removed);
    let removal = events_until_final(&mut events, queued, IDLE).await;
    let last = removal.last().unwrap();
    assert!(last.removed);
    assert_eq!(last.reason.as_deref(), Some("cancelled"));

    assert!(orchestrator.task(&queued).is_none());
    assert!(orchestrator.wait_for_idle(IDLE).await);
    assert!(orchestrator.history_entry(&queued).await.unwrap().is_none());
    assert!(matches!(
        orchestrator.cancel(queued).await,
        Err(ApiError::TaskNotFound(_))
    ));
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_during_backoff_fails_task() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::always(ScriptStep::transient()));
    let mut scheduler = fast_scheduler(1);
    scheduler.base_backoff_ms = 300;
    scheduler.max_backoff_ms = 300;
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), scheduler);
    let mut events = orchestrator.subscribe();

    let id = orchestrator.submit(prompt("backing off")).unwrap();
    wait_for_state(&mut events, id, TaskState::Retrying).await;
    assert_eq!(orchestrator.cancel(id).await.unwrap(), CancelOutcome::CancelRequested);
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let task = orchestrator.task(&id).unwrap();
    assert_eq!(task.failure, Some(FailureReason::Cancelled));
    assert_eq!(
        task.history,
        vec![
            TaskState::Pending,
            TaskState::Dispatched,
            TaskState::Retrying,
            TaskState::Failed
        ]
    );
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_provider_deadline_fails_with_timeout() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::always(
        ScriptStep::succeed(b"too slow".to_vec()).after(Duration::from_secs(5)),
    ));
    let mut scheduler = fast_scheduler(1);
    scheduler.provider_timeout_ms = 100;
    scheduler.retry_budget = 1;
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), scheduler);

    let id = orchestrator.submit(prompt("hang")).unwrap();
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let task = orchestrator.task(&id).unwrap();
    assert_eq!(task.attempts, 2);
    assert_eq!(task.failure, Some(FailureReason::Timeout));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_input_artifact_fails_with_storage_reason() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(1));

    let request = GenerationRequest::builder()
        .primary(ArtifactRef::for_bytes(b"never imported"))
        .prompt("edit this")
        .build();
    let id = orchestrator.submit(request).unwrap();
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let task = orchestrator.task(&id).unwrap();
    assert!(matches!(task.failure, Some(FailureReason::Storage(_))));
    assert_eq!(task.attempts, 1);
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_drops_pending_and_lets_inflight_finish() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    provider.for_prompt(
        "in flight",
        [ScriptStep::succeed(b"done".to_vec()).after(Duration::from_millis(200))],
    );
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(1));
    let mut events = orchestrator.subscribe();

    let running = orchestrator.submit(prompt("in flight")).unwrap();
    wait_for_state(&mut events, running, TaskState::Dispatched).await;
    let queued = orchestrator.submit(prompt("still queued")).unwrap();

    orchestrator.shutdown().await;

    let removal = events_until_final(&mut events, queued, IDLE).await;
    assert_eq!(removal.last().unwrap().reason.as_deref(), Some("shutdown"));
    assert!(orchestrator.task(&queued).is_none());
    assert_eq!(
        orchestrator.task(&running).unwrap().state,
        TaskState::Succeeded
    );
    assert!(orchestrator.history_entry(&running).await.unwrap().is_some());
    assert!(matches!(
        orchestrator.submit(prompt("too late")),
        Err(ApiError::ShuttingDown)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_aborts_after_grace_period() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::always(
        ScriptStep::succeed(b"never".to_vec()).after(Duration::from_secs(30)),
    ));
    let mut scheduler = fast_scheduler(1);
    scheduler.shutdown_grace_ms = 50;
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), scheduler);
    let mut events = orchestrator.subscribe();

    let id = orchestrator.submit(prompt("stuck")).unwrap();
    wait_for_state(&mut events, id, TaskState::Dispatched).await;

    tokio::time::timeout(Duration::from_secs(5), orchestrator.shutdown())
        .await
        .expect("shutdown should not wait for the stuck call");

    let task = orchestrator.task(&id).unwrap();
    assert_eq!(task.failure, Some(FailureReason::Shutdown));
    let entry = orchestrator.history_entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.state, TaskState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_fails_tasks_waiting_to_retry() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::always(ScriptStep::transient()));
    let mut scheduler = fast_scheduler(1);
    scheduler.base_backoff_ms = 5_000;
    scheduler.max_backoff_ms = 5_000;
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), scheduler);
    let mut events = orchestrator.subscribe();

    let id = orchestrator.submit(prompt("waiting")).unwrap();
    wait_for_state(&mut events, id, TaskState::Retrying).await;
    orchestrator.shutdown().await;

    let task = orchestrator.task(&id).unwrap();
    assert_eq!(task.failure, Some(FailureReason::Shutdown));
    assert!(orchestrator.history_entry(&id).await.unwrap().is_some());
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finished_tasks_beyond_retention_are_evicted() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    let mut scheduler = fast_scheduler(1);
    scheduler.retain_finished = 2;
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), scheduler);

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(orchestrator.submit(prompt(&format!("task {}", i))).unwrap());
    }
    assert!(orchestrator.wait_for_idle(IDLE).await);

    for evicted in &ids[..3] {
        assert!(orchestrator.task(evicted).is_none());
        let entry = orchestrator.history_entry(evicted).await.unwrap().unwrap();
        assert_eq!(entry.state, TaskState::Succeeded);
    }
    for kept in &ids[3..] {
        assert_eq!(orchestrator.task(kept).unwrap().state, TaskState::Succeeded);
    }
    assert_eq!(
        orchestrator.cancel(ids[0]).await.unwrap(),
        CancelOutcome::AlreadyFinished
    );

    let stats = orchestrator.stats();
    assert_eq!(stats.succeeded, 5);
    assert_eq!(stats.active(), 0);

    assert_eq!(orchestrator.clear_finished(), 2);
    assert!(orchestrator.task(&ids[4]).is_none());
    assert_eq!(orchestrator.clear_finished(), 0);
    assert_eq!(orchestrator.stats().succeeded, 5);
    assert_eq!(orchestrator.history(HistoryFilter::all()).await.unwrap().len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_estimates_in_flight_task() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    provider.for_prompt(
        "slow",
        [
            ScriptStep::succeed(b"first".to_vec()).after(Duration::from_millis(200)),
            ScriptStep::succeed(b"second".to_vec()).after(Duration::from_millis(400)),
        ],
    );
    let orchestrator = open_orchestrator(&dir, Arc::clone(&provider), fast_scheduler(1));
    let mut events = orchestrator.subscribe();

    let first = orchestrator.submit(prompt("slow")).unwrap();
    let second = orchestrator.submit(prompt("slow")).unwrap();
    let pending = orchestrator.progress(&second).unwrap();
    assert_eq!(pending.state, TaskState::Pending);
    assert_eq!(pending.elapsed, None);
    assert_eq!(pending.fraction, 0.0);
    assert!(orchestrator.timings().is_none());

    let first_events = events_until_final(&mut events, first, IDLE).await;
    let done = first_events.last().unwrap();
    assert_eq!(done.state, TaskState::Succeeded);
    assert!(done.elapsed_ms.unwrap() >= 150);

    wait_for_state(&mut events, second, TaskState::Dispatched).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let running = orchestrator.progress(&second).unwrap();
    assert_eq!(running.state, TaskState::Dispatched);
    assert!(running.elapsed.is_some());
    assert!(running.fraction > 0.0 && running.fraction < 0.99);

    assert!(orchestrator.wait_for_idle(IDLE).await);
    assert_eq!(orchestrator.progress(&second).unwrap().fraction, 1.0);
    let timings = orchestrator.timings().unwrap();
    assert_eq!(timings.count, 2);
    assert!(timings.max >= Duration::from_millis(350));

    let entry = orchestrator.history_entry(&second).await.unwrap().unwrap();
    assert!(entry.elapsed_ms.unwrap() >= 350);
}
