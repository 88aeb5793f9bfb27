//! Maps library errors onto HTTP responses.
//!
//! Revision failures always carry `currentVersion` so the client can rebase.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use waypoint_core::TripError;
use waypoint_places::RegistryError;
use waypoint_revision::RevisionError;
use waypoint_tasks::TaskError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn internal(message: String) -> Self {
        tracing::error!("request failed: {message}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<RevisionError> for ApiError {
    fn from(e: RevisionError) -> Self {
        let message = e.to_string();
        match e {
            RevisionError::VersionConflict { expected, current } => Self {
                status: StatusCode::CONFLICT,
                body: json!({
                    "error": message,
                    "expectedVersion": expected,
                    "currentVersion": current,
                }),
            },
            RevisionError::LockedElementRejected {
                rejected,
                current_version,
            } => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                body: json!({
                    "error": message,
                    "currentVersion": current_version,
                    "rejected": rejected,
                }),
            },
            RevisionError::InvalidOperation {
                index,
                current_version,
                ..
            } => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                body: json!({
                    "error": message,
                    "currentVersion": current_version,
                    "index": index,
                }),
            },
            RevisionError::NotFound(_) | RevisionError::RevisionNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, message)
            }
            RevisionError::AlreadyExists(_) => Self::new(StatusCode::CONFLICT, message),
            RevisionError::Storage(_) | RevisionError::Serialization(_) | RevisionError::Io(_) => {
                Self::internal(message)
            }
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        let message = e.to_string();
        match e {
            TaskError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, message),
            TaskError::InvalidTask(_) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, message),
            TaskError::AlreadyTerminal { .. }
            | TaskError::Cancelled(_)
            | TaskError::StaleLease { .. } => Self::new(StatusCode::CONFLICT, message),
            TaskError::RetriesExhausted { .. } => Self::new(StatusCode::CONFLICT, message),
            TaskError::Storage(_) | TaskError::Serialization(_) | TaskError::Io(_) => {
                Self::internal(message)
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let message = e.to_string();
        match e {
            RegistryError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, message),
            RegistryError::MergeFailure { source_key, reason } => Self {
                status: StatusCode::ACCEPTED,
                body: json!({
                    "error": message,
                    "sourceKey": source_key,
                    "reason": reason,
                    "queued": true,
                }),
            },
            RegistryError::InvalidConfidence(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
            }
            RegistryError::Storage(_) | RegistryError::Serialization(_) | RegistryError::Io(_) => {
                Self::internal(message)
            }
        }
    }
}

impl From<TripError> for ApiError {
    fn from(e: TripError) -> Self {
        match e {
            TripError::Invalid(reason) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, reason),
            TripError::Revision(e) => e.into(),
            TripError::Task(e) => e.into(),
        }
    }
}
