//! Task orchestration: durable queue, leases, timeouts and retry scheduling.

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod sqlite_store;

pub use config::TaskEngineConfig;
pub use engine::{
    schedule_retry, FailOutcome, LeasedTask, NewTask, SubmitReceipt, TaskEngine, TimeoutOutcome,
};
pub use error::TaskError;
pub use sqlite_store::{TaskFilter, TaskStore};
