use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{ChangeOperation, ChangeScope, PlaceCandidate};

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PlanTrip,
    EnrichPlaces,
    AttemptBooking,
    ApplyEdit,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanTrip => "plan_trip",
            Self::EnrichPlaces => "enrich_places",
            Self::AttemptBooking => "attempt_booking",
            Self::ApplyEdit => "apply_edit",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan_trip" => Ok(Self::PlanTrip),
            "enrich_places" => Ok(Self::EnrichPlaces),
            "attempt_booking" => Ok(Self::AttemptBooking),
            "apply_edit" => Ok(Self::ApplyEdit),
            other => Err(anyhow!("unknown task type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Planner,
    Enricher,
    Booker,
    Editor,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Enricher => "enricher",
            Self::Booker => "booker",
            Self::Editor => "editor",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Derived `Failed` only occurs once the retry budget is spent, so it is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(anyhow!("unknown task status: {other}")),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// `max_attempts` counts every attempt, the first one included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTripPayload {
    pub destination: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    pub day_count: u32,
    #[serde(default = "default_travelers")]
    pub travelers: u32,
    #[serde(default)]
    pub interests: Vec<String>,
}

fn default_travelers() -> u32 {
    1
}

/// A place observed for a node by an enrichment collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceObservation {
    pub node_id: String,
    pub candidate: PlaceCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichPlacesPayload {
    pub observations: Vec<PlaceObservation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingPayload {
    pub node_id: String,
    pub provider: String,
    #[serde(default)]
    pub reference: Option<String>,
}

/// Structured edit produced by the (external) intent classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditIntent {
    pub scope: ChangeScope,
    pub operations: Vec<ChangeOperation>,
    #[serde(default)]
    pub base_version: Option<u64>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    PlanTrip(PlanTripPayload),
    EnrichPlaces(EnrichPlacesPayload),
    AttemptBooking(BookingPayload),
    ApplyEdit(EditIntent),
    /// Unstructured agent input; accepted for any task type.
    Raw {
        #[serde(default)]
        data: Map<String, Value>,
    },
}

impl TaskPayload {
    pub fn task_type(&self) -> Option<TaskType> {
        match self {
            Self::PlanTrip(_) => Some(TaskType::PlanTrip),
            Self::EnrichPlaces(_) => Some(TaskType::EnrichPlaces),
            Self::AttemptBooking(_) => Some(TaskType::AttemptBooking),
            Self::ApplyEdit(_) => Some(TaskType::ApplyEdit),
            Self::Raw { .. } => None,
        }
    }

    pub fn matches(&self, task_type: TaskType) -> bool {
        self.task_type().map_or(true, |t| t == task_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl TaskResult {
    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            summary: Some(text.into()),
            data: Value::Null,
        }
    }
}

/// Error raised by the work itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub message: String,
    pub retryable: bool,
}

impl TaskFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { error: String, retryable: bool },
    TimedOut { timeout_ms: u64 },
    /// The task was cancelled while this attempt was in flight; its result was dropped.
    Cancelled,
}

impl AttemptOutcome {
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Failed { error, .. } => Some(error.clone()),
            Self::TimedOut { timeout_ms } => Some(format!("task timed out after {timeout_ms}ms")),
            Self::Succeeded | Self::Cancelled => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed { retryable, .. } => *retryable,
            Self::TimedOut { .. } => true,
            Self::Succeeded | Self::Cancelled => false,
        }
    }
}

/// Closed attempt. Appended once when the attempt ends and never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub lease_id: Uuid,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Claim held by a worker on a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub worker_id: String,
    pub attempt: u32,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub idempotency_key: String,
    pub task_type: TaskType,
    pub agent_kind: AgentKind,
    #[serde(default)]
    pub itinerary_id: Option<String>,
    pub priority: u8,
    pub payload: TaskPayload,
    #[serde(default)]
    pub result: Option<TaskResult>,
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default)]
    pub lease: Option<Lease>,
    #[serde(default)]
    pub cancellation: Option<Cancellation>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Status is a function of the attempt log, the live lease and the cancellation marker.
    pub fn status(&self) -> TaskStatus {
        if self.cancellation.is_some() {
            return TaskStatus::Cancelled;
        }
        if self.lease.is_some() {
            return TaskStatus::Running;
        }
        let Some(last) = self.attempts.last() else {
            return TaskStatus::Pending;
        };
        match &last.outcome {
            AttemptOutcome::Succeeded => TaskStatus::Completed,
            AttemptOutcome::Cancelled => TaskStatus::Cancelled,
            outcome if outcome.is_retryable() && self.has_retry_budget() => TaskStatus::Pending,
            _ => TaskStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn attempts_taken(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn has_retry_budget(&self) -> bool {
        self.attempts_taken() < self.retry_policy.max_attempts
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lease
            .as_ref()
            .map(|lease| lease.leased_at)
            .or_else(|| self.attempts.first().map(|a| a.started_at))
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        if let Some(cancellation) = &self.cancellation {
            return Some(cancellation.at);
        }
        if self.is_terminal() {
            return self.attempts.last().map(|a| a.ended_at);
        }
        None
    }

    pub fn last_error(&self) -> Option<String> {
        self.attempts.iter().rev().find_map(|a| a.outcome.error())
    }
}
