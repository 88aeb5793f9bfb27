use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use waypoint_bus::KeyedLocks;
use waypoint_revision::RevisionError;
use waypoint_schema::{
    AgentKind, Day, Itinerary, ItineraryDraft, ItinerarySettings, PlanTripPayload, Task,
    TaskPayload, TaskType,
};
use waypoint_tasks::{NewTask, SubmitReceipt, TaskError};

use crate::pipeline::Pipeline;

const MAX_TRIP_DAYS: u32 = 60;

#[derive(Debug, Error)]
pub enum TripError {
    #[error("invalid trip request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Revision(#[from] RevisionError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripRequest {
    #[serde(default)]
    pub title: Option<String>,
    pub plan: PlanTripPayload,
    #[serde(default)]
    pub settings: ItinerarySettings,
    /// Defaults to `plan:{itinerary_id}`.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TripCreated {
    pub itinerary: Itinerary,
    pub planning_task: SubmitReceipt,
}

pub struct TripService {
    pipeline: Arc<Pipeline>,
    /// Serializes requests sharing a caller-supplied idempotency key.
    request_locks: KeyedLocks,
}

impl TripService {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            request_locks: KeyedLocks::new(),
        }
    }

    /// Create the version-1 document with one empty day per requested day and
    /// enqueue the planning task that fills it in.
    ///
    /// A request repeating a caller-supplied idempotency key inside the dedup
    /// window returns the trip created by the first one.
    pub async fn create_trip(&self, request: TripRequest) -> Result<TripCreated, TripError> {
        let _request = match &request.idempotency_key {
            Some(key) => {
                let guard = self.request_locks.acquire(key).await;
                if let Some(existing) = self.existing_trip(key).await? {
                    return Ok(existing);
                }
                Some(guard)
            }
            None => None,
        };

        let plan = &request.plan;
        if plan.destination.trim().is_empty() {
            return Err(TripError::Invalid("destination is empty".into()));
        }
        if plan.day_count == 0 || plan.day_count > MAX_TRIP_DAYS {
            return Err(TripError::Invalid(format!(
                "day_count {} outside 1..={MAX_TRIP_DAYS}",
                plan.day_count
            )));
        }

        let days = (1..=plan.day_count)
            .map(|number| {
                let mut day = Day::new(number);
                day.date = plan
                    .start_date
                    .map(|start| start + Duration::days(i64::from(number - 1)));
                day
            })
            .collect();
        let title = request
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("Trip to {}", plan.destination.trim()));

        let itinerary = self
            .pipeline
            .revisions()
            .create_itinerary(ItineraryDraft {
                id: None,
                title,
                days,
                settings: request.settings.clone(),
            })
            .await?;

        let key = request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| format!("plan:{}", itinerary.id));
        let mut task = NewTask::new(
            TaskType::PlanTrip,
            AgentKind::Planner,
            key,
            TaskPayload::PlanTrip(request.plan.clone()),
        )
        .for_itinerary(itinerary.id.clone());
        task.priority = request.priority;

        let planning_task = match self.pipeline.tasks().submit(task).await {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::error!(itinerary_id = %itinerary.id, "trip created but planning task was not queued: {e}");
                return Err(e.into());
            }
        };

        tracing::info!(
            itinerary_id = %itinerary.id,
            task_id = %planning_task.task_id,
            days = itinerary.days.len(),
            "trip created"
        );
        Ok(TripCreated {
            itinerary,
            planning_task,
        })
    }

    async fn existing_trip(&self, key: &str) -> Result<Option<TripCreated>, TripError> {
        let tasks = self.pipeline.tasks();
        let Some(task) = tasks.find_by_idempotency_key(key).await? else {
            return Ok(None);
        };
        if task.created_at < Utc::now() - tasks.config().dedup_window() {
            return Ok(None);
        }
        let Task {
            id: task_id,
            task_type: TaskType::PlanTrip,
            itinerary_id: Some(itinerary_id),
            ..
        } = &task
        else {
            return Err(TripError::Invalid(format!(
                "idempotency key {key} is already used by a task without a trip"
            )));
        };

        let itinerary = self.pipeline.revisions().get(itinerary_id).await?;
        tracing::debug!(itinerary_id = %itinerary.id, task_id = %task_id, "repeated trip request");
        Ok(Some(TripCreated {
            planning_task: SubmitReceipt {
                task_id: *task_id,
                status: task.status(),
                deduplicated: true,
            },
            itinerary,
        }))
    }
}
