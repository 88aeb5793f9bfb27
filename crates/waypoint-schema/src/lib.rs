pub mod change;
pub mod itinerary;
pub mod place;
pub mod task;

pub use change::*;
pub use itinerary::*;
pub use place::*;
pub use task::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusMessage {
    ItineraryPatched {
        event: PatchEvent,
    },
    TaskSubmitted {
        task_id: Uuid,
        task_type: TaskType,
        itinerary_id: Option<String>,
    },
    TaskCompleted {
        task_id: Uuid,
        task_type: TaskType,
        itinerary_id: Option<String>,
        at: DateTime<Utc>,
    },
    TaskFailed {
        task_id: Uuid,
        error: String,
        /// Retries exhausted or the failure was permanent.
        terminal: bool,
        next_attempt_at: Option<DateTime<Utc>>,
    },
    TaskCancelled {
        task_id: Uuid,
        reason: String,
    },
    PlaceResolved {
        place_id: String,
        source_key: String,
        created: bool,
    },
}

impl BusMessage {
    pub fn itinerary_id(&self) -> Option<&str> {
        match self {
            BusMessage::ItineraryPatched { event } => Some(event.itinerary_id.as_str()),
            BusMessage::TaskSubmitted { itinerary_id, .. }
            | BusMessage::TaskCompleted { itinerary_id, .. } => itinerary_id.as_deref(),
            _ => None,
        }
    }
}
