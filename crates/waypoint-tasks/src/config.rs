use serde::{Deserialize, Serialize};
use waypoint_schema::RetryPolicy;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TaskEngineConfig {
    /// Resubmitting an idempotency key inside this window returns the prior task.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub default_retry: RetryPolicy,
    /// Terminal tasks older than this are eligible for `purge_terminal`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
            default_timeout_ms: default_timeout_ms(),
            default_retry: RetryPolicy::default(),
            retention_days: default_retention_days(),
        }
    }
}

impl TaskEngineConfig {
    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_window_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }
}

fn default_dedup_window_secs() -> u64 {
    24 * 60 * 60
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_retention_days() -> u32 {
    30
}
