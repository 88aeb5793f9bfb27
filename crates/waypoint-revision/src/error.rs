use thiserror::Error;
use uuid::Uuid;
use waypoint_schema::RejectedOperation;

#[derive(Debug, Error)]
pub enum RevisionError {
    #[error("itinerary not found: {0}")]
    NotFound(String),

    #[error("itinerary already exists: {0}")]
    AlreadyExists(String),

    #[error("version conflict: change set based on {expected}, itinerary is at {current}")]
    VersionConflict { expected: u64, current: u64 },

    #[error("{} operation(s) rejected on locked elements", .rejected.len())]
    LockedElementRejected {
        rejected: Vec<RejectedOperation>,
        current_version: u64,
    },

    #[error("invalid operation: {reason}")]
    InvalidOperation {
        index: Option<usize>,
        reason: String,
        current_version: u64,
    },

    #[error("revision {revision_id} not found in itinerary {itinerary_id}")]
    RevisionNotFound {
        itinerary_id: String,
        revision_id: Uuid,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RevisionError {
    /// Last-known-good version carried by user-visible failures.
    pub fn current_version(&self) -> Option<u64> {
        match self {
            Self::VersionConflict { current, .. } => Some(*current),
            Self::LockedElementRejected {
                current_version, ..
            }
            | Self::InvalidOperation {
                current_version, ..
            } => Some(*current_version),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RevisionError>;
