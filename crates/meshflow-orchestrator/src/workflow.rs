use chrono::{DateTime, Utc};
use meshflow_core::{MeshError, MeshResult, StepStatus, WorkflowStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Sequential,
    Parallel,
    Conditional,
    Collaborative,
    Dag,
    Saga,
    StateMachine,
    EventDriven,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    Linear,
    #[default]
    Exponential,
}

/// How often and how patiently a failed step is re-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffType,
    pub initial_wait_ms: u64,
    /// Zero means uncapped.
    #[serde(default)]
    pub max_wait_ms: u64,
}

impl WorkflowRetryPolicy {
    /// Wait before the attempt that follows `failed_attempts` failures.
    pub fn backoff_delay(&self, failed_attempts: u32) -> Duration {
        let n = failed_attempts.max(1);
        let ms = match self.backoff {
            BackoffType::Linear => self.initial_wait_ms.saturating_mul(u64::from(n)),
            BackoffType::Exponential => {
                let factor = 2u64.checked_pow(n - 1).unwrap_or(u64::MAX);
                self.initial_wait_ms.saturating_mul(factor)
            }
        };
        let ms = if self.max_wait_ms > 0 {
            ms.min(self.max_wait_ms)
        } else {
            ms
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retry_policy: Option<WorkflowRetryPolicy>,
    /// Zero means the configured default.
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            action: action.into(),
            agent_id: None,
            dependencies: Vec::new(),
            retry_policy: None,
            timeout_seconds: 0,
            continue_on_error: false,
            input: serde_json::Value::Null,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, policy: WorkflowRetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn on_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// A versioned step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub workflow_type: WorkflowType,
    pub steps: Vec<WorkflowStep>,
    /// Whole-execution timeout; zero disables it.
    #[serde(default)]
    pub timeout_seconds: u64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(tenant_id: Uuid, name: impl Into<String>, workflow_type: WorkflowType) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            workflow_type,
            steps: Vec::new(),
            timeout_seconds: 0,
            version: 1,
            created_at: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Declared dependencies, plus the previous step for `sequential` workflows.
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        let Some(index) = self.steps.iter().position(|s| s.id == id) else {
            return Vec::new();
        };
        let mut deps = self.steps[index].dependencies.clone();
        if self.workflow_type == WorkflowType::Sequential && index > 0 {
            let previous = &self.steps[index - 1].id;
            if !deps.contains(previous) {
                deps.push(previous.clone());
            }
        }
        deps
    }

    /// At least one step, unique non-empty ids, known dependencies, no cycles.
    pub fn validate(&self) -> MeshResult<()> {
        if self.steps.is_empty() {
            return Err(MeshError::InvalidConfig(format!(
                "workflow {} has no steps",
                self.name
            )));
        }
        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(MeshError::InvalidConfig("step id is required".to_string()));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(MeshError::InvalidConfig(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }
        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(MeshError::InvalidConfig(format!(
                        "step {} depends on unknown step {dep}",
                        step.id
                    )));
                }
            }
        }
        if self.has_cycle() {
            return Err(MeshError::InvalidConfig(format!(
                "workflow {} has a dependency cycle",
                self.name
            )));
        }
        Ok(())
    }

    fn has_cycle(&self) -> bool {
        let mut visited: HashMap<String, u8> = HashMap::new();
        self.steps
            .iter()
            .any(|s| self.dfs_cycle(&s.id, &mut visited))
    }

    fn dfs_cycle(&self, id: &str, visited: &mut HashMap<String, u8>) -> bool {
        match visited.get(id) {
            Some(1) => return true,
            Some(2) => return false,
            _ => {}
        }
        visited.insert(id.to_string(), 1); // on the current path
        for dep in self.dependencies_of(id) {
            if self.dfs_cycle(&dep, visited) {
                return true;
            }
        }
        visited.insert(id.to_string(), 2); // fully explored
        false
    }
}

/// Per-step state inside one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionStatus {
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Default for StepExecutionStatus {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
            output: None,
            error: None,
        }
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: Uuid,
    pub status: WorkflowStatus,
    pub step_statuses: BTreeMap<String, StepExecutionStatus>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    pub version: i64,
}

impl WorkflowExecution {
    /// Every step starts `pending`.
    pub fn new(workflow: &Workflow) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            tenant_id: workflow.tenant_id,
            status: WorkflowStatus::Pending,
            step_statuses: workflow
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepExecutionStatus::default()))
                .collect(),
            started_at: None,
            completed_at: None,
            error: None,
            version: 1,
        }
    }

    pub fn step_status(&self, id: &str) -> Option<StepStatus> {
        self.step_statuses.get(id).map(|s| s.status)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn workflow(kind: WorkflowType) -> Workflow {
        Workflow::new(Uuid::new_v4(), "release", kind)
    }

    #[test]
    fn test_validate_accepts_dag() {
        let wf = workflow(WorkflowType::Dag)
            .with_step(WorkflowStep::new("build", "cargo build"))
            .with_step(WorkflowStep::new("test", "cargo test").depends_on(["build"]))
            .with_step(WorkflowStep::new("lint", "cargo clippy").depends_on(["build"]))
            .with_step(WorkflowStep::new("ship", "publish").depends_on(["test", "lint"]));
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_graphs() {
        assert!(workflow(WorkflowType::Dag).validate().is_err());

        let dup = workflow(WorkflowType::Dag)
            .with_step(WorkflowStep::new("a", "x"))
            .with_step(WorkflowStep::new("a", "y"));
        assert!(dup.validate().is_err());

        let unknown = workflow(WorkflowType::Dag)
            .with_step(WorkflowStep::new("a", "x").depends_on(["ghost"]));
        assert!(unknown.validate().is_err());

        let cycle = workflow(WorkflowType::Dag)
            .with_step(WorkflowStep::new("a", "x").depends_on(["c"]))
            .with_step(WorkflowStep::new("b", "y").depends_on(["a"]))
            .with_step(WorkflowStep::new("c", "z").depends_on(["b"]));
        let err = cycle.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));

        let backwards = workflow(WorkflowType::Sequential)
            .with_step(WorkflowStep::new("a", "x").depends_on(["b"]))
            .with_step(WorkflowStep::new("b", "y"));
        assert!(backwards.validate().is_err());
    }

    #[test]
    fn test_sequential_adds_implicit_dependency() {
        let wf = workflow(WorkflowType::Sequential)
            .with_step(WorkflowStep::new("a", "x"))
            .with_step(WorkflowStep::new("b", "y"));
        assert!(wf.dependencies_of("a").is_empty());
        assert_eq!(wf.dependencies_of("b"), vec!["a".to_string()]);

        let parallel = workflow(WorkflowType::Parallel)
            .with_step(WorkflowStep::new("a", "x"))
            .with_step(WorkflowStep::new("b", "y"));
        assert!(parallel.dependencies_of("b").is_empty());
    }

    #[test]
    fn test_backoff_delays() {
        let exp = WorkflowRetryPolicy {
            max_attempts: 5,
            backoff: BackoffType::Exponential,
            initial_wait_ms: 100,
            max_wait_ms: 500,
        };
        assert_eq!(exp.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(exp.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(exp.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(exp.backoff_delay(4), Duration::from_millis(500));

        let linear = WorkflowRetryPolicy {
            backoff: BackoffType::Linear,
            max_wait_ms: 0,
            ..exp
        };
        assert_eq!(linear.backoff_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn test_new_execution_has_all_steps_pending() {
        let wf = workflow(WorkflowType::Parallel)
            .with_step(WorkflowStep::new("a", "x"))
            .with_step(WorkflowStep::new("b", "y"));
        let exec = WorkflowExecution::new(&wf);
        assert_eq!(exec.status, WorkflowStatus::Pending);
        assert_eq!(exec.step_status("a"), Some(StepStatus::Pending));
        assert_eq!(exec.step_statuses.len(), 2);
    }
}
