use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use waypoint_bus::{EventBus, KeyedLockGuard, KeyedLocks};
use waypoint_schema::{
    AgentKind, AttemptOutcome, AttemptRecord, BusMessage, Cancellation, Lease, RetryPolicy, Task,
    TaskFailure, TaskPayload, TaskResult, TaskStatus, TaskType, DEFAULT_PRIORITY, MAX_PRIORITY,
    MIN_PRIORITY,
};

use crate::backoff;
use crate::config::TaskEngineConfig;
use crate::error::{Result, TaskError};
use crate::sqlite_store::{TaskFilter, TaskStore};

/// Request to enqueue work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: TaskType,
    pub agent_kind: AgentKind,
    pub idempotency_key: String,
    pub payload: TaskPayload,
    #[serde(default)]
    pub itinerary_id: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Earliest time the task may be leased.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(
        task_type: TaskType,
        agent_kind: AgentKind,
        idempotency_key: impl Into<String>,
        payload: TaskPayload,
    ) -> Self {
        Self {
            task_type,
            agent_kind,
            idempotency_key: idempotency_key.into(),
            payload,
            itinerary_id: None,
            priority: None,
            retry_policy: None,
            timeout_ms: None,
            not_before: None,
        }
    }

    pub fn for_itinerary(mut self, itinerary_id: impl Into<String>) -> Self {
        self.itinerary_id = Some(itinerary_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: Uuid,
    pub status: TaskStatus,
    /// True when an existing task with the same idempotency key was returned.
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub lease: Lease,
    pub task: Task,
}

/// What happened to a task after an attempt ended without success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    RetryScheduled {
        next_attempt: u32,
        at: DateTime<Utc>,
    },
    RetriesExhausted {
        attempts: u32,
        last_error: String,
    },
    PermanentFailure {
        last_error: String,
    },
    /// The task had been cancelled; the attempt was closed and nothing rescheduled.
    Cancelled,
}

impl FailOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::RetryScheduled { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutOutcome {
    pub task_id: Uuid,
    pub attempt: u32,
    pub outcome: FailOutcome,
}

/// Durable, lease-based task queue with retry scheduling.
pub struct TaskEngine {
    store: TaskStore,
    config: TaskEngineConfig,
    bus: Arc<EventBus>,
    /// Held while a worker turns an attempt's output into effects.
    commit_locks: KeyedLocks,
}

impl TaskEngine {
    pub fn new(store: TaskStore, config: TaskEngineConfig, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            config,
            bus,
            commit_locks: KeyedLocks::new(),
        }
    }

    pub fn open(db_path: &Path, config: TaskEngineConfig, bus: Arc<EventBus>) -> Result<Self> {
        Ok(Self::new(TaskStore::open(db_path)?, config, bus))
    }

    pub fn in_memory(config: TaskEngineConfig, bus: Arc<EventBus>) -> Result<Self> {
        Ok(Self::new(TaskStore::open_in_memory()?, config, bus))
    }

    pub fn config(&self) -> &TaskEngineConfig {
        &self.config
    }

    pub async fn submit(&self, request: NewTask) -> Result<SubmitReceipt> {
        let task = self.build_task(request, Utc::now())?;

        if let Some(existing) = self
            .store
            .insert_unless_duplicate(&task, task.created_at - self.config.dedup_window())
            .await?
        {
            tracing::debug!(
                task_id = %existing.id,
                key = %existing.idempotency_key,
                "duplicate submission, returning existing task"
            );
            return Ok(SubmitReceipt {
                task_id: existing.id,
                status: existing.status(),
                deduplicated: true,
            });
        }

        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = task.priority,
            "task submitted"
        );
        self.publish(BusMessage::TaskSubmitted {
            task_id: task.id,
            task_type: task.task_type,
            itinerary_id: task.itinerary_id.clone(),
        })
        .await;

        Ok(SubmitReceipt {
            task_id: task.id,
            status: task.status(),
            deduplicated: false,
        })
    }

    fn build_task(&self, request: NewTask, now: DateTime<Utc>) -> Result<Task> {
        if request.idempotency_key.trim().is_empty() {
            return Err(TaskError::InvalidTask(
                "idempotency key must not be empty".into(),
            ));
        }
        let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(TaskError::InvalidTask(format!(
                "priority {priority} outside {MIN_PRIORITY}..={MAX_PRIORITY}"
            )));
        }
        if !request.payload.matches(request.task_type) {
            return Err(TaskError::InvalidTask(format!(
                "payload does not match task type {}",
                request.task_type
            )));
        }
        let retry_policy = request
            .retry_policy
            .unwrap_or_else(|| self.config.default_retry.clone());
        validate_retry_policy(&retry_policy)?;
        let timeout_ms = request.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        if timeout_ms == 0 {
            return Err(TaskError::InvalidTask("timeout must be positive".into()));
        }

        Ok(Task {
            id: Uuid::new_v4(),
            idempotency_key: request.idempotency_key,
            task_type: request.task_type,
            agent_kind: request.agent_kind,
            itinerary_id: request.itinerary_id,
            priority,
            payload: request.payload,
            result: None,
            retry_policy,
            attempts: Vec::new(),
            lease: None,
            cancellation: None,
            timeout_ms,
            created_at: now,
            scheduled_at: request.not_before.unwrap_or(now).max(now),
            updated_at: now,
        })
    }

    pub async fn lease(&self, worker_id: &str) -> Result<Option<LeasedTask>> {
        self.lease_at(worker_id, Utc::now()).await
    }

    /// Claim the next ready task as of `now`.
    pub async fn lease_at(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<LeasedTask>> {
        let leased = self
            .store
            .claim_next(now, |task| {
                let lease = Lease {
                    lease_id: Uuid::new_v4(),
                    worker_id: worker_id.to_string(),
                    attempt: task.attempts_taken() + 1,
                    leased_at: now,
                    expires_at: now + Duration::milliseconds(task.timeout_ms as i64),
                };
                task.lease = Some(lease.clone());
                task.updated_at = now;
                LeasedTask {
                    lease,
                    task: task.clone(),
                }
            })
            .await?;

        if let Some(leased) = &leased {
            tracing::debug!(
                task_id = %leased.task.id,
                worker_id,
                attempt = leased.lease.attempt,
                "task leased"
            );
        }
        Ok(leased)
    }

    /// Succeeds only while `lease_id` is still held and the task is not cancelled.
    pub async fn ensure_active(&self, task_id: Uuid, lease_id: Uuid) -> Result<()> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?;
        check_lease(&task, lease_id)?;
        if task.cancellation.is_some() {
            return Err(TaskError::Cancelled(task_id));
        }
        Ok(())
    }

    /// Lock the task against cancellation and timeout sweeps, then check it is
    /// still active. Effects applied while the guard lives cannot race a cancel:
    /// `cancel` waits for the guard and then finds the task terminal.
    pub async fn begin_commit(&self, task_id: Uuid, lease_id: Uuid) -> Result<KeyedLockGuard> {
        let guard = self.commit_locks.acquire(&task_id.to_string()).await;
        self.ensure_active(task_id, lease_id).await?;
        Ok(guard)
    }

    /// Record a successful attempt. A result arriving after cancellation is
    /// discarded and reported as [`TaskError::Cancelled`].
    pub async fn complete(&self, task_id: Uuid, lease_id: Uuid, result: TaskResult) -> Result<Task> {
        let now = Utc::now();
        let (task, accepted) = self
            .store
            .update(task_id, |task| {
                let lease = check_lease(task, lease_id)?;
                if task.cancellation.is_some() {
                    close_attempt(task, lease, now, AttemptOutcome::Cancelled);
                    return Ok((task.clone(), false));
                }
                close_attempt(task, lease, now, AttemptOutcome::Succeeded);
                task.result = Some(result);
                Ok((task.clone(), true))
            })
            .await?;

        if !accepted {
            tracing::info!(task_id = %task_id, "discarding result of cancelled task");
            return Err(TaskError::Cancelled(task_id));
        }

        tracing::info!(task_id = %task_id, attempts = task.attempts_taken(), "task completed");
        self.publish(BusMessage::TaskCompleted {
            task_id,
            task_type: task.task_type,
            itinerary_id: task.itinerary_id.clone(),
            at: now,
        })
        .await;
        Ok(task)
    }

    pub async fn fail(&self, task_id: Uuid, lease_id: Uuid, failure: TaskFailure) -> Result<FailOutcome> {
        let outcome = AttemptOutcome::Failed {
            error: failure.message,
            retryable: failure.retryable,
        };
        self.end_attempt(task_id, lease_id, outcome).await
    }

    /// Record that the worker gave up on the attempt after its deadline.
    pub async fn time_out(&self, task_id: Uuid, lease_id: Uuid) -> Result<FailOutcome> {
        let timeout_ms = self
            .store
            .get(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?
            .timeout_ms;
        self.end_attempt(task_id, lease_id, AttemptOutcome::TimedOut { timeout_ms })
            .await
    }

    async fn end_attempt(
        &self,
        task_id: Uuid,
        lease_id: Uuid,
        outcome: AttemptOutcome,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let result = self
            .store
            .update(task_id, |task| {
                let lease = check_lease(task, lease_id)?;
                if task.cancellation.is_some() {
                    close_attempt(task, lease, now, AttemptOutcome::Cancelled);
                    return Ok(FailOutcome::Cancelled);
                }
                close_attempt(task, lease, now, outcome);
                Ok(schedule_retry(task, now))
            })
            .await?;

        self.report_failure(task_id, &result).await;
        Ok(result)
    }

    /// Mark a task cancelled. A running attempt keeps its lease until the worker
    /// reports back or the lease expires; its result will be discarded.
    pub async fn cancel(&self, task_id: Uuid, reason: &str) -> Result<Task> {
        let _commit = self.commit_locks.acquire(&task_id.to_string()).await;
        let now = Utc::now();
        let task = self
            .store
            .update(task_id, |task| {
                let status = task.status();
                if status.is_terminal() {
                    return Err(TaskError::AlreadyTerminal { task_id, status });
                }
                task.cancellation = Some(Cancellation {
                    reason: reason.to_string(),
                    at: now,
                });
                task.updated_at = now;
                Ok(task.clone())
            })
            .await?;

        tracing::info!(task_id = %task_id, reason, "task cancelled");
        self.publish(BusMessage::TaskCancelled {
            task_id,
            reason: reason.to_string(),
        })
        .await;
        Ok(task)
    }

    pub async fn sweep_timeouts(&self) -> Result<Vec<TimeoutOutcome>> {
        self.sweep_timeouts_at(Utc::now()).await
    }

    /// Close every attempt whose lease expired by `now` as timed out.
    pub async fn sweep_timeouts_at(&self, now: DateTime<Utc>) -> Result<Vec<TimeoutOutcome>> {
        let mut outcomes = Vec::new();
        for task_id in self.store.expired_leases(now).await? {
            let Some(_commit) = self.commit_locks.try_acquire(&task_id.to_string()) else {
                tracing::debug!(task_id = %task_id, "lease expired mid-commit, sweeping later");
                continue;
            };
            let swept = self
                .store
                .update(task_id, |task| {
                    let Some(lease) = task.lease.clone() else {
                        return Ok(None);
                    };
                    if lease.expires_at > now {
                        return Ok(None);
                    }
                    if task.cancellation.is_some() {
                        close_attempt(task, lease.clone(), now, AttemptOutcome::Cancelled);
                        return Ok(Some((lease.attempt, FailOutcome::Cancelled)));
                    }
                    let timeout_ms = task.timeout_ms;
                    close_attempt(task, lease.clone(), now, AttemptOutcome::TimedOut { timeout_ms });
                    Ok(Some((lease.attempt, schedule_retry(task, now))))
                })
                .await;

            match swept {
                Ok(Some((attempt, outcome))) => {
                    tracing::warn!(task_id = %task_id, attempt, "task attempt timed out");
                    self.report_failure(task_id, &outcome).await;
                    outcomes.push(TimeoutOutcome {
                        task_id,
                        attempt,
                        outcome,
                    });
                }
                Ok(None) => {}
                Err(e) => tracing::error!(task_id = %task_id, "timeout sweep failed: {e}"),
            }
        }
        Ok(outcomes)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.store.get(task_id).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.list(filter).await
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>> {
        self.store.find_by_idempotency_key(key).await
    }

    /// Final result of a task: `Ok(None)` while it is still pending or running.
    pub async fn outcome(&self, task_id: Uuid) -> Result<Option<TaskResult>> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?;
        match task.status() {
            TaskStatus::Pending | TaskStatus::Running => Ok(None),
            TaskStatus::Completed => Ok(Some(task.result.unwrap_or_default())),
            TaskStatus::Cancelled => Err(TaskError::Cancelled(task_id)),
            TaskStatus::Failed => Err(TaskError::RetriesExhausted {
                task_id,
                attempts: task.attempts_taken(),
                last_error: task.last_error().unwrap_or_default(),
            }),
        }
    }

    /// Remove terminal tasks older than the configured retention.
    pub async fn purge_terminal(&self) -> Result<usize> {
        let removed = self
            .store
            .purge_terminal(Utc::now() - self.config.retention())
            .await?;
        if removed > 0 {
            tracing::info!(removed, "purged terminal tasks");
        }
        Ok(removed)
    }

    async fn report_failure(&self, task_id: Uuid, outcome: &FailOutcome) {
        let (error, next_attempt_at) = match outcome {
            FailOutcome::Cancelled => return,
            FailOutcome::RetryScheduled { next_attempt, at } => {
                tracing::info!(task_id = %task_id, next_attempt, %at, "retry scheduled");
                (format!("retrying as attempt {next_attempt}"), Some(*at))
            }
            FailOutcome::RetriesExhausted {
                attempts,
                last_error,
            } => {
                tracing::warn!(task_id = %task_id, attempts, "task retries exhausted: {last_error}");
                (last_error.clone(), None)
            }
            FailOutcome::PermanentFailure { last_error } => {
                tracing::warn!(task_id = %task_id, "task failed permanently: {last_error}");
                (last_error.clone(), None)
            }
        };
        self.publish(BusMessage::TaskFailed {
            task_id,
            error,
            terminal: outcome.is_terminal(),
            next_attempt_at,
        })
        .await;
    }

    async fn publish(&self, msg: BusMessage) {
        if let Err(e) = self.bus.publish(msg).await {
            tracing::warn!("failed to publish task event: {e}");
        }
    }
}

/// Decide the fate of a task whose latest attempt just failed or timed out.
///
/// With retry budget left and a retryable outcome, the task becomes pending
/// again with `scheduled_at` pushed out by the backoff delay for the next attempt.
pub fn schedule_retry(task: &mut Task, now: DateTime<Utc>) -> FailOutcome {
    let last_error = task.last_error().unwrap_or_default();
    let retryable = task
        .attempts
        .last()
        .map(|a| a.outcome.is_retryable())
        .unwrap_or(false);

    if !retryable {
        return FailOutcome::PermanentFailure { last_error };
    }
    if !task.has_retry_budget() {
        return FailOutcome::RetriesExhausted {
            attempts: task.attempts_taken(),
            last_error,
        };
    }

    let next_attempt = task.attempts_taken() + 1;
    let delay_ms = backoff::retry_delay_ms(&task.retry_policy, next_attempt);
    let at = now + Duration::milliseconds(delay_ms as i64);
    task.scheduled_at = at;
    task.updated_at = now;
    FailOutcome::RetryScheduled { next_attempt, at }
}

pub fn validate_retry_policy(policy: &RetryPolicy) -> Result<()> {
    if policy.max_attempts == 0 {
        return Err(TaskError::InvalidTask(
            "max_attempts must be at least 1".into(),
        ));
    }
    if policy.base_delay_ms > policy.max_delay_ms {
        return Err(TaskError::InvalidTask(format!(
            "base delay {}ms exceeds max delay {}ms",
            policy.base_delay_ms, policy.max_delay_ms
        )));
    }
    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
        return Err(TaskError::InvalidTask(
            "backoff multiplier must be >= 1.0".into(),
        ));
    }
    Ok(())
}

fn check_lease(task: &Task, lease_id: Uuid) -> Result<Lease> {
    match &task.lease {
        Some(lease) if lease.lease_id == lease_id => Ok(lease.clone()),
        _ => Err(TaskError::StaleLease {
            task_id: task.id,
            lease_id,
        }),
    }
}

fn close_attempt(task: &mut Task, lease: Lease, now: DateTime<Utc>, outcome: AttemptOutcome) {
    task.attempts.push(AttemptRecord {
        attempt: lease.attempt,
        lease_id: lease.lease_id,
        worker_id: lease.worker_id,
        started_at: lease.leased_at,
        ended_at: now,
        outcome,
    });
    task.lease = None;
    task.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn engine() -> TaskEngine {
        TaskEngine::in_memory(TaskEngineConfig::default(), Arc::new(EventBus::default())).unwrap()
    }

    fn raw(task_type: TaskType, key: &str) -> NewTask {
        NewTask::new(
            task_type,
            AgentKind::Planner,
            key,
            TaskPayload::Raw { data: Map::new() },
        )
    }

    #[tokio::test]
    async fn rejects_out_of_range_priority() {
        let engine = engine();
        let err = engine
            .submit(raw(TaskType::PlanTrip, "k").with_priority(11))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask(_)));

        let err = engine
            .submit(raw(TaskType::PlanTrip, "k").with_priority(0))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn rejects_mismatched_payload() {
        let engine = engine();
        let request = NewTask::new(
            TaskType::AttemptBooking,
            AgentKind::Booker,
            "k",
            TaskPayload::EnrichPlaces(waypoint_schema::EnrichPlacesPayload {
                observations: vec![],
            }),
        );
        assert!(matches!(
            engine.submit(request).await,
            Err(TaskError::InvalidTask(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_key_returns_same_task() {
        let engine = engine();
        let first = engine.submit(raw(TaskType::PlanTrip, "plan-1")).await.unwrap();
        let second = engine.submit(raw(TaskType::PlanTrip, "plan-1")).await.unwrap();
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.task_id, second.task_id);
        assert_eq!(engine.list(&TaskFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_lease_is_rejected() {
        let engine = engine();
        let receipt = engine.submit(raw(TaskType::PlanTrip, "k")).await.unwrap();
        let leased = engine.lease("w1").await.unwrap().unwrap();
        assert_eq!(leased.task.id, receipt.task_id);

        let err = engine
            .complete(receipt.task_id, Uuid::new_v4(), TaskResult::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::StaleLease { .. }));
        assert_eq!(
            engine.get(receipt.task_id).await.unwrap().unwrap().status(),
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn permanent_failure_skips_retry() {
        let engine = engine();
        let receipt = engine.submit(raw(TaskType::PlanTrip, "k")).await.unwrap();
        let leased = engine.lease("w1").await.unwrap().unwrap();
        let outcome = engine
            .fail(
                receipt.task_id,
                leased.lease.lease_id,
                TaskFailure::permanent("bad destination"),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::PermanentFailure {
                last_error: "bad destination".into()
            }
        );
        let task = engine.get(receipt.task_id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.attempts_taken(), 1);
    }

    #[tokio::test]
    async fn cancel_waits_for_in_flight_commit() {
        let engine = Arc::new(engine());
        let receipt = engine.submit(raw(TaskType::PlanTrip, "k")).await.unwrap();
        let leased = engine.lease("w1").await.unwrap().unwrap();
        let commit = engine
            .begin_commit(receipt.task_id, leased.lease.lease_id)
            .await
            .unwrap();

        let canceller = {
            let engine = engine.clone();
            let task_id = receipt.task_id;
            tokio::spawn(async move { engine.cancel(task_id, "changed my mind").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!canceller.is_finished());

        engine
            .complete(receipt.task_id, leased.lease.lease_id, TaskResult::summary("ok"))
            .await
            .unwrap();
        drop(commit);

        let err = canceller.await.unwrap().unwrap_err();
        assert!(matches!(err, TaskError::AlreadyTerminal { .. }));
        assert_eq!(
            engine.get(receipt.task_id).await.unwrap().unwrap().status(),
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn commit_refused_after_cancel() {
        let engine = engine();
        let receipt = engine.submit(raw(TaskType::PlanTrip, "k")).await.unwrap();
        let leased = engine.lease("w1").await.unwrap().unwrap();
        engine.cancel(receipt.task_id, "stop").await.unwrap();

        assert!(matches!(
            engine
                .begin_commit(receipt.task_id, leased.lease.lease_id)
                .await,
            Err(TaskError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn sweep_skips_task_mid_commit() {
        let engine = engine();
        let receipt = engine.submit(raw(TaskType::PlanTrip, "k")).await.unwrap();
        let leased = engine.lease("w1").await.unwrap().unwrap();
        let later = leased.lease.expires_at + Duration::seconds(1);

        let commit = engine
            .begin_commit(receipt.task_id, leased.lease.lease_id)
            .await
            .unwrap();
        assert!(engine.sweep_timeouts_at(later).await.unwrap().is_empty());

        drop(commit);
        assert_eq!(engine.sweep_timeouts_at(later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_terminal_task_fails() {
        let engine = engine();
        let receipt = engine.submit(raw(TaskType::PlanTrip, "k")).await.unwrap();
        let leased = engine.lease("w1").await.unwrap().unwrap();
        engine
            .complete(receipt.task_id, leased.lease.lease_id, TaskResult::summary("ok"))
            .await
            .unwrap();

        let err = engine.cancel(receipt.task_id, "too late").await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::AlreadyTerminal {
                status: TaskStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancelled_pending_task_is_never_leased() {
        let engine = engine();
        let receipt = engine.submit(raw(TaskType::PlanTrip, "k")).await.unwrap();
        engine.cancel(receipt.task_id, "user").await.unwrap();
        assert!(engine.lease("w1").await.unwrap().is_none());
        assert!(matches!(
            engine.outcome(receipt.task_id).await,
            Err(TaskError::Cancelled(_))
        ));
    }

    #[test]
    fn retry_policy_validation() {
        assert!(validate_retry_policy(&RetryPolicy::default()).is_ok());
        assert!(validate_retry_policy(&RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        })
        .is_err());
        assert!(validate_retry_policy(&RetryPolicy {
            base_delay_ms: 10_000,
            max_delay_ms: 100,
            ..RetryPolicy::default()
        })
        .is_err());
        assert!(validate_retry_policy(&RetryPolicy {
            backoff_multiplier: 0.5,
            ..RetryPolicy::default()
        })
        .is_err());
    }
}
