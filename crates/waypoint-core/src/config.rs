use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use waypoint_places::RegistryConfig;
use waypoint_revision::RevisionConfig;
use waypoint_tasks::{engine::validate_retry_policy, TaskEngineConfig};

use crate::worker::WorkerConfig;

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Contents of `waypoint.yaml`. Every section may be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointConfig {
    /// Holds `tasks.db`, `itineraries.db`, `places.db` and `logs/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub tasks: TaskEngineConfig,
    #[serde(default)]
    pub revision: RevisionConfig,
    #[serde(default)]
    pub places: RegistryConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for WaypointConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tasks: TaskEngineConfig::default(),
            revision: RevisionConfig::default(),
            places: RegistryConfig::default(),
            workers: WorkerConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl WaypointConfig {
    pub fn tasks_db(&self) -> PathBuf {
        self.data_dir.join("tasks.db")
    }

    pub fn itineraries_db(&self) -> PathBuf {
        self.data_dir.join("itineraries.db")
    }

    pub fn places_db(&self) -> PathBuf {
        self.data_dir.join("places.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("invalid server.bind address: {}", self.server.bind))
    }
}

/// Replace every `${NAME}` with the value of the environment variable (empty if unset).
pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

/// Read, interpolate and validate a config file. A relative `data_dir` is
/// taken relative to the file's directory.
pub fn load_config(path: &Path) -> Result<WaypointConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config = parse_config(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))?;

    if config.data_dir.is_relative() {
        if let Some(parent) = path.parent() {
            config.data_dir = parent.join(&config.data_dir);
        }
    }

    validate_config(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<WaypointConfig> {
    let resolved = resolve_env_var(content);
    if resolved.trim().is_empty() {
        return Ok(WaypointConfig::default());
    }
    Ok(serde_yaml::from_str(&resolved)?)
}

pub fn validate_config(config: &WaypointConfig) -> Result<()> {
    if config.workers.count == 0 {
        return Err(anyhow!("workers.count must be at least 1"));
    }
    if config.workers.poll_interval_ms == 0 || config.workers.sweep_interval_ms == 0 {
        return Err(anyhow!("worker intervals must be positive"));
    }
    if config.tasks.default_timeout_ms == 0 {
        return Err(anyhow!("tasks.default_timeout_ms must be positive"));
    }
    validate_retry_policy(&config.tasks.default_retry)
        .map_err(|e| anyhow!("tasks.default_retry: {e}"))?;
    if !config.places.match_radius_m.is_finite() || config.places.match_radius_m < 0.0 {
        return Err(anyhow!(
            "places.match_radius_m must be a non-negative distance, got {}",
            config.places.match_radius_m
        ));
    }
    if config.places.max_pending_attempts == 0 {
        return Err(anyhow!("places.max_pending_attempts must be at least 1"));
    }
    config.bind_addr()?;
    Ok(())
}
