//! Core types and error definitions for the Meshflow control plane.
//!
//! This crate holds everything the orchestration layer builds on but that owns
//! no mutable domain state: the status enums and their transition tables, the
//! error taxonomy, and the capabilities injected into every state change
//! (metrics, clock) plus configuration and logging setup.
//!
//! # Main types
//!
//! - [`MeshError`]: Error taxonomy shared by every Meshflow operation.
//! - [`MeshResult`]: `Result<T, MeshError>`.
//! - [`StatusMachine`]: Table-driven validated transitions over a [`Status`] enum.
//! - [`AgentStatus`], [`TaskStatus`], [`StepStatus`], [`WorkflowStatus`]: Closed status enums.
//! - [`MetricsSink`]: Fire-and-forget metrics capability.
//! - [`Clock`]: Injectable time source.
//! - [`MeshConfig`]: TOML-backed configuration.

/// Injectable time sources.
pub mod clock;
/// TOML configuration model.
pub mod config;
/// Tracing subscriber setup.
pub mod logging;
/// Metrics sink capability.
pub mod metrics;
/// Status enums and the generic transition machine.
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoordinatorConfig, LoggingConfig, MeshConfig, WorkflowConfig};
pub use metrics::{MetricsSink, NoopMetrics, RecordingMetrics, Tags};
pub use status::{AgentStatus, Status, StatusMachine, StepStatus, TaskStatus, WorkflowStatus};

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for Meshflow.
///
/// The first four variants form the domain taxonomy every state-changing
/// operation reports through; the rest cover configuration and I/O.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// A status value that is not a member of its enum.
    #[error("invalid {kind} status: {value:?}")]
    InvalidStatus {
        /// Status dimension (agent, task, step, workflow).
        kind: &'static str,
        /// The rejected raw value.
        value: String,
    },

    /// Both states are valid but the edge between them is not.
    #[error("invalid {kind} transition: {from} -> {to}")]
    InvalidTransition {
        /// Status dimension (agent, task, step, workflow).
        kind: &'static str,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// A malformed distributed task, workflow, or execution plan.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A write presented a stale version.
    #[error("optimistic lock conflict on {entity} {id}: expected version {expected}, found {actual}")]
    OptimisticLockConflict {
        /// Entity kind (task, workflow, execution, distributed_task).
        entity: &'static str,
        /// Entity identifier.
        id: Uuid,
        /// Version the writer read.
        expected: i64,
        /// Version currently stored.
        actual: i64,
    },

    /// The repository holds no entity with this id.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Entity identifier.
        id: Uuid,
    },

    /// A delegation request that violates delegation rules.
    #[error("Delegation error: {0}")]
    Delegation(String),

    /// An error in configuration parsing or loading.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Whether the caller should reload and reapply the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MeshError::OptimisticLockConflict { .. })
    }
}

/// A convenience `Result` alias using [`MeshError`].
pub type MeshResult<T> = Result<T, MeshError>;
