use thiserror::Error;
use uuid::Uuid;
use waypoint_schema::TaskStatus;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(Uuid),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("lease {lease_id} is no longer held on task {task_id}")]
    StaleLease { task_id: Uuid, lease_id: Uuid },

    #[error("task {0} was cancelled")]
    Cancelled(Uuid),

    #[error("task {task_id} is already {status}")]
    AlreadyTerminal { task_id: Uuid, status: TaskStatus },

    #[error("task {task_id} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        task_id: Uuid,
        attempts: u32,
        last_error: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;
