//! Worker pool: lease a task, run its handler under the task's deadline, apply
//! the handler's effects while the lease is still live, then close the attempt.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypoint_revision::{ApplyOutcome, RevisionError};
use waypoint_schema::{ChangeSet, Itinerary, PlaceCandidate, Task, TaskFailure};
use waypoint_tasks::{FailOutcome, LeasedTask, TaskError};

use crate::handler::{TaskContext, TaskOutput};
use crate::pipeline::Pipeline;

fn default_count() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_count")]
    pub count: usize,
    /// Idle workers wait this long before polling the queue again.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Period of the timeout sweep and the pending place-merge retry.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// What one pass of [`process_next`] did with the task it leased.
#[derive(Debug, Clone)]
pub enum RunReport {
    Completed {
        task_id: Uuid,
        applied: Vec<ApplyOutcome>,
    },
    Failed {
        task_id: Uuid,
        outcome: FailOutcome,
    },
    TimedOut {
        task_id: Uuid,
        outcome: FailOutcome,
    },
    /// The task was cancelled mid-attempt; its output was dropped.
    Discarded { task_id: Uuid },
    /// The lease expired (and was swept) before the worker reported back.
    LeaseLost { task_id: Uuid },
}

impl RunReport {
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::TimedOut { task_id, .. }
            | Self::Discarded { task_id }
            | Self::LeaseLost { task_id } => *task_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub places_merged: usize,
    pub places_dropped: usize,
    pub tasks_purged: usize,
}

/// Lease and run one ready task. `Ok(None)` means the queue had nothing ready.
pub async fn process_next(pipeline: &Pipeline, worker_id: &str) -> Result<Option<RunReport>> {
    let Some(LeasedTask { lease, task }) = pipeline.tasks().lease(worker_id).await? else {
        return Ok(None);
    };
    let task_id = task.id;
    let lease_id = lease.lease_id;

    let Some(handler) = pipeline.handlers().get(task.task_type) else {
        let failure = TaskFailure::permanent(format!(
            "no handler registered for task type {}",
            task.task_type
        ));
        return close_failed(pipeline, task_id, lease_id, failure).await.map(Some);
    };

    let itinerary = match load_target(pipeline, &task).await {
        Ok(itinerary) => itinerary,
        Err(failure) => return close_failed(pipeline, task_id, lease_id, failure).await.map(Some),
    };

    let ctx = TaskContext {
        task,
        lease,
        itinerary,
        places: pipeline.places().clone(),
    };
    let deadline = Duration::from_millis(ctx.task.timeout_ms);

    let output = match tokio::time::timeout(deadline, handler.handle(&ctx)).await {
        Err(_) => {
            tracing::warn!(task_id = %task_id, attempt = ctx.lease.attempt, "handler exceeded task timeout");
            return match pipeline.tasks().time_out(task_id, lease_id).await {
                Ok(outcome) => Ok(Some(RunReport::TimedOut { task_id, outcome })),
                Err(e) => lease_error(task_id, e).map(Some),
            };
        }
        Ok(Err(failure)) => {
            tracing::info!(task_id = %task_id, retryable = failure.retryable, "handler failed: {failure}");
            return close_failed(pipeline, task_id, lease_id, failure).await.map(Some);
        }
        Ok(Ok(output)) => output,
    };

    // Held until the attempt is closed so a cancel cannot land between the
    // liveness check and the writes below.
    let _commit = match pipeline.tasks().begin_commit(task_id, lease_id).await {
        Ok(guard) => guard,
        Err(e) => return match e {
            TaskError::Cancelled(_) => {
                pipeline
                    .tasks()
                    .fail(task_id, lease_id, TaskFailure::permanent("cancelled"))
                    .await?;
                tracing::info!(task_id = %task_id, "task cancelled while running, output dropped");
                Ok(Some(RunReport::Discarded { task_id }))
            }
            other => lease_error(task_id, other).map(Some),
        },
    };

    let TaskOutput {
        result,
        change_sets,
        place_candidates,
    } = output;
    let applied = match apply_effects(pipeline, &ctx, change_sets, place_candidates).await {
        Ok(applied) => applied,
        Err(failure) => return close_failed(pipeline, task_id, lease_id, failure).await.map(Some),
    };

    match pipeline.tasks().complete(task_id, lease_id, result).await {
        Ok(_) => Ok(Some(RunReport::Completed { task_id, applied })),
        Err(TaskError::Cancelled(_)) => Ok(Some(RunReport::Discarded { task_id })),
        Err(e) => lease_error(task_id, e).map(Some),
    }
}

async fn load_target(pipeline: &Pipeline, task: &Task) -> Result<Option<Itinerary>, TaskFailure> {
    let Some(itinerary_id) = &task.itinerary_id else {
        return Ok(None);
    };
    match pipeline.revisions().get(itinerary_id).await {
        Ok(doc) => Ok(Some(doc)),
        Err(RevisionError::NotFound(_)) => Err(TaskFailure::permanent(format!(
            "itinerary {itinerary_id} does not exist"
        ))),
        Err(e) => Err(TaskFailure::transient(format!(
            "failed to load itinerary {itinerary_id}: {e}"
        ))),
    }
}

/// Place candidates first, then change sets keyed `{task_id}:{index}` so a
/// retried attempt replays instead of re-applying.
async fn apply_effects(
    pipeline: &Pipeline,
    ctx: &TaskContext,
    change_sets: Vec<ChangeSet>,
    place_candidates: Vec<PlaceCandidate>,
) -> Result<Vec<ApplyOutcome>, TaskFailure> {
    let task_id = ctx.task.id;

    for candidate in place_candidates {
        // Failures are queued inside the registry and retried by the sweeper.
        if let Err(e) = pipeline.places().resolve(candidate).await {
            tracing::debug!(task_id = %task_id, "place candidate deferred: {e}");
        }
    }

    if change_sets.is_empty() {
        return Ok(Vec::new());
    }
    let Some(itinerary_id) = ctx.task.itinerary_id.as_deref() else {
        return Err(TaskFailure::permanent(
            "task produced change sets but targets no itinerary",
        ));
    };

    let mut applied = Vec::with_capacity(change_sets.len());
    for (index, mut change_set) in change_sets.into_iter().enumerate() {
        change_set
            .idempotency_key
            .get_or_insert_with(|| format!("{task_id}:{index}"));

        match pipeline
            .revisions()
            .apply_change_set(itinerary_id, change_set)
            .await
        {
            Ok(outcome) => applied.push(outcome),
            // Not retried. The message carries the current version.
            Err(e @ RevisionError::VersionConflict { .. }) => {
                return Err(TaskFailure::permanent(e.to_string()))
            }
            Err(e @ (RevisionError::Storage(_) | RevisionError::Io(_))) => {
                return Err(TaskFailure::transient(e.to_string()))
            }
            Err(e) => return Err(TaskFailure::permanent(e.to_string())),
        }
    }
    Ok(applied)
}

async fn close_failed(
    pipeline: &Pipeline,
    task_id: Uuid,
    lease_id: Uuid,
    failure: TaskFailure,
) -> Result<RunReport> {
    match pipeline.tasks().fail(task_id, lease_id, failure).await {
        Ok(FailOutcome::Cancelled) => Ok(RunReport::Discarded { task_id }),
        Ok(outcome) => Ok(RunReport::Failed { task_id, outcome }),
        Err(e) => lease_error(task_id, e),
    }
}

fn lease_error(task_id: Uuid, error: TaskError) -> Result<RunReport> {
    match error {
        TaskError::StaleLease { .. } => {
            tracing::warn!(task_id = %task_id, "lease lost before the attempt could be closed");
            Ok(RunReport::LeaseLost { task_id })
        }
        other => Err(other.into()),
    }
}

/// Requeue timed-out attempts, retry queued place merges and purge old tasks.
pub async fn sweep_once(pipeline: &Pipeline) -> Result<SweepReport> {
    let timed_out = pipeline.tasks().sweep_timeouts().await?.len();
    let places = pipeline.places().retry_pending().await?;
    let tasks_purged = pipeline.tasks().purge_terminal().await?;
    Ok(SweepReport {
        timed_out,
        places_merged: places.merged,
        places_dropped: places.dropped,
        tasks_purged,
    })
}

pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<Pipeline>, config: WorkerConfig) -> Self {
        Self {
            pipeline,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops every loop after its current task.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn `count` workers plus the sweeper.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.count + 1);
        for i in 0..self.config.count {
            let worker_id = format!("worker-{i}");
            handles.push(tokio::spawn(run_worker(
                self.pipeline.clone(),
                worker_id,
                Duration::from_millis(self.config.poll_interval_ms),
                self.shutdown.clone(),
            )));
        }
        handles.push(tokio::spawn(run_sweeper(
            self.pipeline.clone(),
            Duration::from_millis(self.config.sweep_interval_ms),
            self.shutdown.clone(),
        )));
        tracing::info!(workers = self.config.count, "worker pool started");
        handles
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_worker(
    pipeline: Arc<Pipeline>,
    worker_id: String,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let idle = match process_next(&pipeline, &worker_id).await {
            Ok(Some(report)) => {
                tracing::debug!(worker_id = %worker_id, task_id = %report.task_id(), ?report, "task attempt finished");
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::error!(worker_id = %worker_id, "worker pass failed: {e:#}");
                true
            }
        };
        if idle {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
    tracing::debug!(worker_id = %worker_id, "worker stopped");
}

async fn run_sweeper(pipeline: Arc<Pipeline>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match sweep_once(&pipeline).await {
            Ok(report) if report != SweepReport::default() => {
                tracing::info!(?report, "sweep finished");
            }
            Ok(_) => {}
            Err(e) => tracing::error!("sweep failed: {e:#}"),
        }
    }
}
