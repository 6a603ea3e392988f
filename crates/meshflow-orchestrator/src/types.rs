use chrono::{DateTime, Utc};
use meshflow_core::{AgentStatus, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Scheduling priority of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Resource and queue snapshot reported by an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentWorkload {
    pub active_tasks: u32,
    pub queued_tasks: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// A worker registered with the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub tenant_id: Uuid,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub workload: AgentWorkload,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// A freshly registered agent starts `offline`.
    pub fn new(id: impl Into<String>, tenant_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tenant_id,
            name: name.into(),
            capabilities: BTreeSet::new(),
            status: AgentStatus::Offline,
            workload: AgentWorkload::default(),
            last_seen: now,
            created_at: now,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// A unit of work.
///
/// Once `status` is terminal the record is immutable apart from audit fields.
/// `version` is owned by the repository: every accepted write bumps it by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub task_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    pub created_by: String,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub max_retries: u32,
    pub retry_count: u32,
    pub timeout_seconds: u64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        tenant_id: Uuid,
        task_type: impl Into<String>,
        title: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            task_type: task_type.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            created_by: created_by.into(),
            assigned_to: None,
            parent_task_id: None,
            parameters: serde_json::Value::Null,
            result: None,
            error: None,
            max_retries: 3,
            retry_count: 0,
            timeout_seconds: 3600,
            version: 1,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_task_id = Some(parent);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Why a task moved between agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationType {
    Manual,
    Automatic,
    Failover,
    LoadBalance,
}

impl std::fmt::Display for DelegationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelegationType::Manual => write!(f, "manual"),
            DelegationType::Automatic => write!(f, "automatic"),
            DelegationType::Failover => write!(f, "failover"),
            DelegationType::LoadBalance => write!(f, "load_balance"),
        }
    }
}

/// One immutable link in a task's delegation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDelegation {
    pub id: Uuid,
    pub task_id: Uuid,
    pub from_agent: String,
    pub to_agent: String,
    pub delegation_type: DelegationType,
    pub reason: String,
    pub delegated_at: DateTime<Utc>,
}

/// What an agent reported about a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventType {
    Accepted,
    Rejected,
    Started,
    Progress,
    Completed,
    Failed,
    /// The external election picked the reporting agent as leader.
    LeaderElected,
}

/// Append-only fact about a task, the coordinator's only input about subtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: Uuid,
    pub task_id: Uuid,
    pub event_type: TaskEventType,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskEvent {
    pub fn new(
        task_id: Uuid,
        event_type: TaskEventType,
        agent_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            event_type,
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn completed(task_id: Uuid, agent_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self::new(task_id, TaskEventType::Completed, agent_id, result)
    }

    pub fn failed(task_id: Uuid, agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(
            task_id,
            TaskEventType::Failed,
            agent_id,
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
