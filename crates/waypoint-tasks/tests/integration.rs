use std::sync::Arc;

use chrono::Duration;
use serde_json::Map;
use tempfile::TempDir;
use waypoint_bus::{EventBus, Topic};
use waypoint_schema::{
    AgentKind, AttemptOutcome, BusMessage, RetryPolicy, TaskFailure, TaskPayload, TaskResult,
    TaskStatus, TaskType,
};
use waypoint_tasks::{FailOutcome, NewTask, TaskEngine, TaskEngineConfig, TaskError};

fn enrich_request(key: &str) -> NewTask {
    NewTask::new(
        TaskType::EnrichPlaces,
        AgentKind::Enricher,
        key,
        TaskPayload::Raw { data: Map::new() },
    )
    .with_retry_policy(RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1_000,
        max_delay_ms: 60_000,
        backoff_multiplier: 2.0,
    })
}

#[tokio::test]
async fn three_attempts_then_success() {
    let bus = Arc::new(EventBus::default());
    let mut failed_rx = bus.subscribe(Topic::TaskFailed).await;
    let engine = TaskEngine::in_memory(TaskEngineConfig::default(), bus).unwrap();
    let receipt = engine.submit(enrich_request("enrich-1")).await.unwrap();

    // Attempt 1 fails transiently.
    let first = engine.lease("w1").await.unwrap().unwrap();
    assert_eq!(first.lease.attempt, 1);
    let outcome = engine
        .fail(
            receipt.task_id,
            first.lease.lease_id,
            TaskFailure::transient("rate limited"),
        )
        .await
        .unwrap();
    let FailOutcome::RetryScheduled { next_attempt, at } = outcome else {
        panic!("expected a retry, got {outcome:?}");
    };
    assert_eq!(next_attempt, 2);

    let task = engine.get(receipt.task_id).await.unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Pending);
    let delay = (at - task.attempts[0].ended_at).num_milliseconds();
    assert!((1_500..=2_500).contains(&delay), "delay {delay}ms");

    // Not ready before the backoff elapses.
    assert!(engine
        .lease_at("w1", task.attempts[0].ended_at)
        .await
        .unwrap()
        .is_none());

    // Attempt 2 times out.
    let second = engine.lease_at("w2", at).await.unwrap().unwrap();
    assert_eq!(second.lease.attempt, 2);
    let swept = engine
        .sweep_timeouts_at(second.lease.expires_at)
        .await
        .unwrap();
    assert_eq!(swept.len(), 1);
    let FailOutcome::RetryScheduled { next_attempt, at } = swept[0].outcome.clone() else {
        panic!("expected a retry after timeout");
    };
    assert_eq!(next_attempt, 3);

    // Attempt 3 succeeds.
    let third = engine.lease_at("w3", at).await.unwrap().unwrap();
    assert_eq!(third.lease.attempt, 3);
    let done = engine
        .complete(
            receipt.task_id,
            third.lease.lease_id,
            TaskResult::summary("enriched"),
        )
        .await
        .unwrap();

    assert_eq!(done.status(), TaskStatus::Completed);
    assert_eq!(done.attempts.len(), 3);
    assert!(matches!(
        done.attempts[0].outcome,
        AttemptOutcome::Failed {
            retryable: true,
            ..
        }
    ));
    assert!(matches!(
        done.attempts[1].outcome,
        AttemptOutcome::TimedOut { .. }
    ));
    assert_eq!(done.attempts[2].outcome, AttemptOutcome::Succeeded);
    assert_eq!(
        engine.outcome(receipt.task_id).await.unwrap(),
        Some(TaskResult::summary("enriched"))
    );

    let msg = failed_rx.recv().await.unwrap();
    assert!(matches!(msg, BusMessage::TaskFailed { terminal: false, .. }));
}

#[tokio::test]
async fn exhausted_retries_surface_last_error() {
    let engine =
        TaskEngine::in_memory(TaskEngineConfig::default(), Arc::new(EventBus::default())).unwrap();
    let receipt = engine
        .submit(enrich_request("enrich-2").with_retry_policy(RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 100,
            backoff_multiplier: 2.0,
        }))
        .await
        .unwrap();

    let mut now = chrono::Utc::now();
    let mut last = None;
    for _ in 0..2 {
        let leased = engine.lease_at("w", now).await.unwrap().unwrap();
        last = Some(
            engine
                .fail(
                    receipt.task_id,
                    leased.lease.lease_id,
                    TaskFailure::transient("provider down"),
                )
                .await
                .unwrap(),
        );
        now += Duration::seconds(5);
    }

    assert_eq!(
        last,
        Some(FailOutcome::RetriesExhausted {
            attempts: 2,
            last_error: "provider down".into()
        })
    );
    assert!(engine.lease_at("w", now).await.unwrap().is_none());
    match engine.outcome(receipt.task_id).await {
        Err(TaskError::RetriesExhausted {
            attempts,
            last_error,
            ..
        }) => {
            assert_eq!(attempts, 2);
            assert_eq!(last_error, "provider down");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_running_task_discards_late_result() {
    let engine =
        TaskEngine::in_memory(TaskEngineConfig::default(), Arc::new(EventBus::default())).unwrap();
    let receipt = engine.submit(enrich_request("enrich-3")).await.unwrap();
    let leased = engine.lease("w1").await.unwrap().unwrap();

    engine.cancel(receipt.task_id, "user abandoned trip").await.unwrap();
    assert!(matches!(
        engine
            .ensure_active(receipt.task_id, leased.lease.lease_id)
            .await,
        Err(TaskError::Cancelled(_))
    ));

    let err = engine
        .complete(
            receipt.task_id,
            leased.lease.lease_id,
            TaskResult::summary("late"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Cancelled(_)));

    let task = engine.get(receipt.task_id).await.unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Cancelled);
    assert!(task.result.is_none());
    assert_eq!(task.attempts.len(), 1);
    assert_eq!(task.attempts[0].outcome, AttemptOutcome::Cancelled);
    assert!(task.lease.is_none());
}

#[tokio::test]
async fn tasks_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tasks.db");
    let task_id = {
        let engine = TaskEngine::open(
            &path,
            TaskEngineConfig::default(),
            Arc::new(EventBus::default()),
        )
        .unwrap();
        let receipt = engine.submit(enrich_request("enrich-4")).await.unwrap();
        let leased = engine.lease("w1").await.unwrap().unwrap();
        engine
            .fail(
                receipt.task_id,
                leased.lease.lease_id,
                TaskFailure::transient("flaky"),
            )
            .await
            .unwrap();
        receipt.task_id
    };

    let engine = TaskEngine::open(
        &path,
        TaskEngineConfig::default(),
        Arc::new(EventBus::default()),
    )
    .unwrap();
    let task = engine.get(task_id).await.unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Pending);
    assert_eq!(task.attempts.len(), 1);
    assert_eq!(task.last_error().as_deref(), Some("flaky"));

    let dup = engine.submit(enrich_request("enrich-4")).await.unwrap();
    assert!(dup.deduplicated);
    assert_eq!(dup.task_id, task_id);
}

#[tokio::test]
async fn concurrent_workers_never_share_a_task() {
    let engine = Arc::new(
        TaskEngine::in_memory(TaskEngineConfig::default(), Arc::new(EventBus::default())).unwrap(),
    );
    for i in 0..10 {
        engine
            .submit(enrich_request(&format!("bulk-{i}")))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..4 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(leased) = engine.lease(&format!("w{w}")).await.unwrap() {
                claimed.push(leased.task.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort();
    let before = all.len();
    all.dedup();
    assert_eq!(before, 10);
    assert_eq!(all.len(), 10);
}
