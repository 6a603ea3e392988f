use crate::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration, usually read from `meshflow.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MeshConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> MeshResult<Self> {
        let config: MeshConfig =
            toml::from_str(raw).map_err(|e| MeshError::Config(format!("Invalid TOML: {e}")))?;
        config.coordinator.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MeshError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }
}

/// Settings for the distributed-task coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Agent id the coordinator uses when it owns the parent task.
    #[serde(default = "default_coordinator_id")]
    pub coordinator_id: String,
    /// How many times a conflicting write is reloaded and reapplied.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
    /// Sync-point timeout used when a plan leaves it at zero.
    #[serde(default = "default_sync_timeout_secs")]
    pub default_sync_timeout_secs: u64,
    /// Timeout given to subtasks the coordinator creates.
    #[serde(default = "default_subtask_timeout_secs")]
    pub default_subtask_timeout_secs: u64,
    /// Retry ceiling given to subtasks the coordinator creates.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Cancel subtasks still running once the completion policy is met.
    #[serde(default = "default_true")]
    pub cancel_outstanding_on_completion: bool,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> MeshResult<()> {
        if self.max_conflict_retries == 0 {
            return Err(MeshError::Config(
                "coordinator.max_conflict_retries must be at least 1".to_string(),
            ));
        }
        if self.coordinator_id.trim().is_empty() {
            return Err(MeshError::Config(
                "coordinator.coordinator_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordinator_id: default_coordinator_id(),
            max_conflict_retries: default_max_conflict_retries(),
            default_sync_timeout_secs: default_sync_timeout_secs(),
            default_subtask_timeout_secs: default_subtask_timeout_secs(),
            default_max_retries: default_max_retries(),
            cancel_outstanding_on_completion: true,
        }
    }
}

/// Defaults applied to workflow steps that leave fields unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            default_max_attempts: default_max_attempts(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

fn default_coordinator_id() -> String {
    "coordinator".to_string()
}

fn default_max_conflict_retries() -> u32 {
    5
}

fn default_sync_timeout_secs() -> u64 {
    300
}

fn default_subtask_timeout_secs() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_step_timeout_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    1
}

fn default_filter() -> String {
    "info".to_string()
}
