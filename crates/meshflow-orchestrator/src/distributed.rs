//! Distributed-task model and plan walking.
//!
//! A [`DistributedTask`] fans one piece of work out to [`Subtask`]s and folds
//! their results back together. Its [`ExecutionPlan`] groups subtasks into
//! phases gated by [`SyncPoint`]s. [`DistributedTask::advance_plan`] and
//! [`DistributedTask::check_sync_timeout`] are pure: they read subtask states
//! and return the [`PlanActions`] the coordinator must apply.

use crate::aggregation::{AggregationConfig, IntermediateResult};
use crate::types::{Task, TaskPriority};
use chrono::{DateTime, Utc};
use meshflow_core::{MeshError, MeshResult, Status, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Execution topology of a distributed task's subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationMode {
    /// Every subtask is issued at once.
    Parallel,
    /// One subtask at a time, in declaration order.
    Sequential,
    /// Sequential, with each stage receiving the previous output as `input`.
    Pipeline,
    /// Map subtasks, a barrier, then reduce subtasks.
    MapReduce,
    /// Parallel, with the first agent to claim leadership recorded.
    LeaderElect,
}

impl std::fmt::Display for CoordinationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CoordinationMode::Parallel => "parallel",
            CoordinationMode::Sequential => "sequential",
            CoordinationMode::Pipeline => "pipeline",
            CoordinationMode::MapReduce => "map_reduce",
            CoordinationMode::LeaderElect => "leader_elect",
        };
        f.write_str(s)
    }
}

/// When the aggregate counts as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Every subtask reported a result.
    All,
    /// At least one result.
    Any,
    /// More than half of the subtasks, by integer division.
    Majority,
    /// `completion_threshold` results, or all when the threshold is zero.
    Threshold,
    /// `completion_threshold` results; the threshold must be positive.
    BestOf,
}

/// Which half of a `map_reduce` job a subtask belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStage {
    /// Runs in the first phase.
    #[default]
    Map,
    /// Runs once the map barrier is released.
    Reduce,
}

/// A slice of the work bound to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// Nil until defaults are applied.
    #[serde(default)]
    pub id: Uuid,
    /// Agent the subtask is issued to. Unassigned subtasks stay pending.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Human-readable summary.
    #[serde(default)]
    pub description: String,
    /// Free-form input handed to the agent.
    #[serde(default)]
    pub parameters: Value,
    /// Relative weight used by weighted aggregation.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Only meaningful for `map_reduce`.
    #[serde(default)]
    pub stage: SubtaskStage,
    /// Overrides the coordinator's default subtask timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Subtask {
    /// A map-stage subtask with weight 1 bound to `agent_id`.
    pub fn new(agent_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: Some(agent_id.into()),
            description: description.into(),
            parameters: Value::Null,
            weight: 1.0,
            stage: SubtaskStage::Map,
            timeout_seconds: None,
        }
    }

    /// Set the agent input.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the aggregation weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set the map-reduce stage.
    pub fn with_stage(mut self, stage: SubtaskStage) -> Self {
        self.stage = stage;
        self
    }

    /// Override the subtask timeout.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

/// Raw input data to be spread over agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPartition {
    /// Caller-chosen partition key.
    pub id: String,
    /// Payload copied into the generated subtask's parameters.
    #[serde(default)]
    pub data: Value,
    /// Carried over to the generated subtask.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

/// What happens when a sync point's wait runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeout {
    /// Release the barrier and move to the next phase.
    Continue,
    /// Fail the distributed task.
    Fail,
    /// Re-issue unmet subtasks, up to the phase's `max_retry`.
    Retry,
}

/// A group of subtasks run together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPhase {
    /// Reported as the progress `current_step`.
    pub name: String,
    /// Subtasks in issue order.
    pub task_ids: Vec<Uuid>,
    /// Issue all at once, or one after another.
    #[serde(default = "default_true")]
    pub parallel: bool,
    /// Retry ceiling for the phase's subtasks and its sync-point retries.
    #[serde(default)]
    pub max_retry: u32,
}

/// Barrier between phase `after_phase` and the next one.
///
/// The wait starts once the phase is fully issued and ends when every
/// required subtask has completed or the timeout fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPoint {
    /// Unique within the plan.
    pub name: String,
    /// Index of the gated phase.
    pub after_phase: usize,
    /// Subtasks that must complete successfully.
    pub required_tasks: Vec<Uuid>,
    /// Zero means the coordinator default.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Policy applied when the wait runs out.
    pub on_timeout: OnTimeout,
}

/// Ordered phases plus the sync points between them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Run in order.
    pub phases: Vec<ExecutionPhase>,
    /// Barriers keyed by phase index.
    #[serde(default)]
    pub sync_points: Vec<SyncPoint>,
}

impl ExecutionPlan {
    /// The plan a coordination mode implies when the caller supplies none.
    pub fn for_mode(mode: CoordinationMode, subtasks: &[Subtask], max_retry: u32) -> Self {
        let ids: Vec<Uuid> = subtasks.iter().map(|s| s.id).collect();
        let single = |name: &str, parallel: bool| ExecutionPlan {
            phases: vec![ExecutionPhase {
                name: name.to_string(),
                task_ids: ids.clone(),
                parallel,
                max_retry,
            }],
            sync_points: Vec::new(),
        };
        match mode {
            CoordinationMode::Parallel => single("parallel", true),
            CoordinationMode::LeaderElect => single("elect", true),
            CoordinationMode::Sequential => single("sequential", false),
            CoordinationMode::Pipeline => single("pipeline", false),
            CoordinationMode::MapReduce => {
                let stage_ids = |stage: SubtaskStage| -> Vec<Uuid> {
                    subtasks
                        .iter()
                        .filter(|s| s.stage == stage)
                        .map(|s| s.id)
                        .collect()
                };
                let map_ids = stage_ids(SubtaskStage::Map);
                ExecutionPlan {
                    phases: vec![
                        ExecutionPhase {
                            name: "map".to_string(),
                            task_ids: map_ids.clone(),
                            parallel: true,
                            max_retry,
                        },
                        ExecutionPhase {
                            name: "reduce".to_string(),
                            task_ids: stage_ids(SubtaskStage::Reduce),
                            parallel: true,
                            max_retry,
                        },
                    ],
                    sync_points: vec![SyncPoint {
                        name: "map_complete".to_string(),
                        after_phase: 0,
                        required_tasks: map_ids,
                        timeout_seconds: 0,
                        on_timeout: OnTimeout::Fail,
                    }],
                }
            }
        }
    }

    /// Every subtask must sit in exactly one phase and every id must be known.
    pub fn validate(&self, known: &[Uuid]) -> MeshResult<()> {
        if self.phases.is_empty() {
            return Err(MeshError::InvalidConfig(
                "execution plan needs at least one phase".to_string(),
            ));
        }
        let known: HashSet<Uuid> = known.iter().copied().collect();
        let mut seen = HashSet::new();
        for phase in &self.phases {
            for id in &phase.task_ids {
                if !known.contains(id) {
                    return Err(MeshError::InvalidConfig(format!(
                        "phase {} references unknown subtask {id}",
                        phase.name
                    )));
                }
                if !seen.insert(*id) {
                    return Err(MeshError::InvalidConfig(format!(
                        "subtask {id} appears in more than one phase"
                    )));
                }
            }
        }
        if seen.len() != known.len() {
            return Err(MeshError::InvalidConfig(
                "every subtask must belong to a phase".to_string(),
            ));
        }
        for sp in &self.sync_points {
            if sp.after_phase >= self.phases.len() {
                return Err(MeshError::InvalidConfig(format!(
                    "sync point {} follows missing phase {}",
                    sp.name, sp.after_phase
                )));
            }
            if let Some(id) = sp.required_tasks.iter().find(|id| !known.contains(id)) {
                return Err(MeshError::InvalidConfig(format!(
                    "sync point {} requires unknown subtask {id}",
                    sp.name
                )));
            }
        }
        Ok(())
    }

    /// Phase index holding `task_id`.
    pub fn phase_of(&self, task_id: Uuid) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.task_ids.contains(&task_id))
    }
}

/// Running progress of a distributed task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Number of subtasks.
    pub total_steps: u32,
    /// Results collected so far.
    pub completed_steps: u32,
    /// Explicit override reported verbatim by `calculate_progress`.
    #[serde(default)]
    pub percent_complete: Option<f64>,
    /// Name of the phase being run.
    #[serde(default)]
    pub current_step: Option<String>,
    /// `started_at + estimated_duration`, when both are known.
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
}

/// Resources reported by subtask progress events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Sum over all reports.
    pub cpu_seconds: f64,
    /// Peak over all reports.
    pub memory_mb: f64,
    /// Distinct agents the subtasks were bound to.
    pub agents_used: u32,
}

/// Where plan execution stands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanState {
    /// Index into the plan's phases.
    pub current_phase: usize,
    /// Set once the current phase is fully issued while a sync point still blocks it.
    #[serde(default)]
    pub sync_waiting_since: Option<DateTime<Utc>>,
    /// Retries spent on the current sync wait.
    #[serde(default)]
    pub sync_retries: u32,
    /// Sync points released by an `on_timeout = continue`.
    #[serde(default)]
    pub released_sync_points: BTreeSet<String>,
    /// Subtasks already handed out, cancelled, or replaced.
    #[serde(default)]
    pub issued: BTreeSet<Uuid>,
}

/// A subtask the coordinator should hand out.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueOrder {
    /// Subtask to assign.
    pub task_id: Uuid,
    /// Target agent; `None` leaves the subtask pending.
    pub agent_id: Option<String>,
    /// Upstream output fed in by `pipeline`.
    pub input: Option<Value>,
}

/// Subtask writes decided by one plan evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanActions {
    /// Pending subtasks to assign.
    pub issue: Vec<IssueOrder>,
    /// Subtasks that can no longer run.
    pub cancel: Vec<Uuid>,
    /// Running subtasks to hand out again.
    pub reissue: Vec<Uuid>,
    /// Terminal subtasks replaced by fresh ones: `(old, new)`.
    pub replace: Vec<(Uuid, Uuid)>,
}

impl PlanActions {
    /// True when the evaluation asks for no writes.
    pub fn is_empty(&self) -> bool {
        self.issue.is_empty()
            && self.cancel.is_empty()
            && self.reissue.is_empty()
            && self.replace.is_empty()
    }
}

/// Outcome of checking the current sync wait against the clock.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncTimeout {
    /// No wait is running, or it has time left.
    NotDue,
    /// The named sync point was released.
    Continued(String),
    /// Unmet subtasks must be re-issued or replaced.
    Retried(PlanActions),
    /// The distributed task must fail with this reason.
    Failed(String),
}

/// A task split across agents, plus everything needed to drive and fold it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedTask {
    /// Also the id of the backing main task.
    #[serde(default)]
    pub id: Uuid,
    /// Owning tenant.
    #[serde(default)]
    pub tenant_id: Uuid,
    /// Required; copied onto the main task and every subtask.
    #[serde(default, rename = "type")]
    pub task_type: String,
    /// Short title.
    #[serde(default)]
    pub title: String,
    /// Longer description.
    #[serde(default)]
    pub description: String,
    /// Submitter.
    #[serde(default)]
    pub created_by: String,
    /// Defaults to `normal`.
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    /// Defaults to `parallel`.
    #[serde(default)]
    pub coordination_mode: Option<CoordinationMode>,
    /// Defaults to `all`.
    #[serde(default)]
    pub completion_mode: Option<CompletionMode>,
    /// Result count for `threshold` and `best_of`.
    #[serde(default)]
    pub completion_threshold: i32,
    /// Work items as submitted.
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    /// Raw data turned into subtasks by [`partition_across`](Self::partition_across).
    #[serde(default)]
    pub partitions: Vec<TaskPartition>,
    /// Ids of the live subtask records. Replaced subtasks are swapped out.
    #[serde(default)]
    pub subtask_ids: Vec<Uuid>,
    /// Explicit plan. Derived from the coordination mode when absent.
    #[serde(default)]
    pub execution_plan: Option<ExecutionPlan>,
    /// How results are folded into `final_result`.
    #[serde(default)]
    pub aggregation: AggregationConfig,
    /// Running progress.
    #[serde(default)]
    pub progress: Progress,
    /// Resource totals.
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    /// Distinct subtasks that reported a result.
    #[serde(default)]
    pub results_collected: usize,
    /// One entry per counted result.
    #[serde(default)]
    pub intermediate_results: Vec<IntermediateResult>,
    /// Aggregated result, set on completion.
    #[serde(default)]
    pub final_result: Option<Value>,
    /// First agent elected under `leader_elect`.
    #[serde(default)]
    pub leader_agent: Option<String>,
    /// Follows the task status table.
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    /// Failure or cancellation reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Optimistic-concurrency version.
    #[serde(default = "default_version")]
    pub version: i64,
    /// Set on submission.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the task reaches a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Expected run time, used for the ETA.
    #[serde(default)]
    pub estimated_duration: Option<Duration>,
    /// Where plan execution stands.
    #[serde(default)]
    pub plan_state: PlanState,
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

fn default_version() -> i64 {
    1
}

fn is_terminal(status: TaskStatus) -> bool {
    status.allowed_targets().is_empty()
}

impl DistributedTask {
    /// A pending distributed task with no subtasks and unset modes.
    pub fn new(tenant_id: Uuid, task_type: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            task_type: task_type.into(),
            title: title.into(),
            description: String::new(),
            created_by: String::new(),
            priority: None,
            coordination_mode: None,
            completion_mode: None,
            completion_threshold: 0,
            subtasks: Vec::new(),
            partitions: Vec::new(),
            subtask_ids: Vec::new(),
            execution_plan: None,
            aggregation: AggregationConfig::default(),
            progress: Progress::default(),
            resource_usage: ResourceUsage::default(),
            results_collected: 0,
            intermediate_results: Vec::new(),
            final_result: None,
            leader_agent: None,
            status: TaskStatus::Pending,
            error: None,
            version: 1,
            started_at: None,
            completed_at: None,
            estimated_duration: None,
            plan_state: PlanState::default(),
        }
    }

    /// Set both modes.
    pub fn with_modes(mut self, coordination: CoordinationMode, completion: CompletionMode) -> Self {
        self.coordination_mode = Some(coordination);
        self.completion_mode = Some(completion);
        self
    }

    /// Set the completion threshold.
    pub fn with_threshold(mut self, threshold: i32) -> Self {
        self.completion_threshold = threshold;
        self
    }

    /// Replace the subtask list.
    pub fn with_subtasks(mut self, subtasks: Vec<Subtask>) -> Self {
        self.subtasks = subtasks;
        self
    }

    /// Set the aggregation method.
    pub fn with_aggregation(mut self, aggregation: AggregationConfig) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Supply an explicit execution plan.
    pub fn with_plan(mut self, plan: ExecutionPlan) -> Self {
        self.execution_plan = Some(plan);
        self
    }

    /// Set the submitter.
    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    /// Parse a submission document. Unknown mode names are configuration errors.
    pub fn from_json(raw: &str) -> MeshResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| MeshError::InvalidConfig(format!("malformed distributed task: {e}")))
    }

    /// Reject a missing id or type, and a non-positive threshold for
    /// `threshold` and `best_of`.
    pub fn validate(&self) -> MeshResult<()> {
        if self.id.is_nil() {
            return Err(MeshError::InvalidConfig(
                "distributed task id is required".to_string(),
            ));
        }
        if self.task_type.trim().is_empty() {
            return Err(MeshError::InvalidConfig(
                "distributed task type is required".to_string(),
            ));
        }
        if matches!(
            self.completion_mode,
            Some(CompletionMode::Threshold | CompletionMode::BestOf)
        ) && self.completion_threshold <= 0
        {
            return Err(MeshError::InvalidConfig(format!(
                "completion threshold must be positive, got {}",
                self.completion_threshold
            )));
        }
        Ok(())
    }

    /// Fill unset fields. Explicit values are never overwritten.
    pub fn set_defaults(&mut self) {
        self.coordination_mode.get_or_insert(CoordinationMode::Parallel);
        self.completion_mode.get_or_insert(CompletionMode::All);
        self.priority.get_or_insert(TaskPriority::Normal);
        for subtask in &mut self.subtasks {
            if subtask.id.is_nil() {
                subtask.id = Uuid::new_v4();
            }
        }
    }

    /// Turn partitions into subtasks, round-robin over `agents`.
    ///
    /// Does nothing when subtasks were given explicitly or there is nothing
    /// to partition.
    pub fn partition_across(&mut self, agents: &[String]) -> MeshResult<()> {
        if !self.subtasks.is_empty() || self.partitions.is_empty() {
            return Ok(());
        }
        if agents.is_empty() {
            return Err(MeshError::InvalidConfig(
                "cannot partition without agents".to_string(),
            ));
        }
        self.subtasks = self
            .partitions
            .iter()
            .zip(agents.iter().cycle())
            .map(|(partition, agent)| Subtask {
                id: Uuid::new_v4(),
                agent_id: Some(agent.clone()),
                description: format!("{} [partition {}]", self.title, partition.id),
                parameters: serde_json::json!({
                    "partition_id": partition.id,
                    "data": partition.data,
                }),
                weight: partition.weight,
                stage: SubtaskStage::Map,
                timeout_seconds: None,
            })
            .collect();
        Ok(())
    }

    /// Percent of subtasks with a result. An explicit
    /// `progress.percent_complete` is returned as is, and an empty subtask
    /// set reports zero.
    pub fn calculate_progress(&self) -> f64 {
        if let Some(percent) = self.progress.percent_complete {
            return percent;
        }
        if self.subtask_ids.is_empty() {
            return 0.0;
        }
        self.results_collected as f64 / self.subtask_ids.len() as f64 * 100.0
    }

    /// Whether the completion policy is satisfied.
    ///
    /// An empty subtask set is vacuously complete.
    pub fn is_complete(&self) -> bool {
        let total = self.subtask_ids.len();
        if total == 0 {
            return true;
        }
        let collected = self.results_collected;
        let threshold_met = || collected as i64 >= i64::from(self.completion_threshold);
        match self.completion_mode.unwrap_or(CompletionMode::All) {
            CompletionMode::All => collected >= total,
            CompletionMode::Any => collected > 0,
            CompletionMode::Majority => collected > total / 2,
            CompletionMode::Threshold if self.completion_threshold > 0 => threshold_met(),
            CompletionMode::Threshold => collected >= total,
            CompletionMode::BestOf => threshold_met(),
        }
    }

    /// `started_at + estimated_duration`, or `None` when either is missing or
    /// the duration is zero.
    pub fn estimated_completion(&self) -> Option<DateTime<Utc>> {
        let started = self.started_at?;
        let duration = self.estimated_duration.filter(|d| !d.is_zero())?;
        let duration = chrono::Duration::from_std(duration).ok()?;
        Some(started + duration)
    }

    /// Record one subtask result. A subtask already counted is ignored and
    /// `false` is returned.
    pub fn record_result(
        &mut self,
        subtask_id: Uuid,
        agent_id: &str,
        result: Value,
        received_at: DateTime<Utc>,
    ) -> bool {
        if self
            .intermediate_results
            .iter()
            .any(|r| r.subtask_id == subtask_id)
        {
            return false;
        }
        let weight = self
            .subtasks
            .iter()
            .find(|s| s.id == subtask_id)
            .map_or(1.0, |s| s.weight);
        self.intermediate_results.push(IntermediateResult {
            subtask_id,
            agent_id: agent_id.to_string(),
            result,
            weight,
            received_at,
        });
        self.results_collected = self.intermediate_results.len();
        self.progress.completed_steps = u32::try_from(self.results_collected).unwrap_or(u32::MAX);
        self.progress.eta = self.estimated_completion();
        true
    }

    /// No further status change is possible.
    pub fn is_terminal(&self) -> bool {
        is_terminal(self.status)
    }

    fn plan(&self) -> Option<&ExecutionPlan> {
        self.execution_plan.as_ref()
    }

    fn subtask_agent(&self, id: Uuid) -> Option<String> {
        self.subtasks
            .iter()
            .find(|s| s.id == id)
            .and_then(|s| s.agent_id.clone())
    }

    /// Sync points after the current phase that still block it.
    fn blocking_sync_points(&self, tasks: &HashMap<Uuid, Task>) -> Vec<SyncPoint> {
        let Some(plan) = self.plan() else {
            return Vec::new();
        };
        let phase = self.plan_state.current_phase;
        plan.sync_points
            .iter()
            .filter(|sp| sp.after_phase == phase)
            .filter(|sp| !self.plan_state.released_sync_points.contains(&sp.name))
            .filter(|sp| {
                !sp.required_tasks.iter().all(|id| {
                    tasks
                        .get(id)
                        .is_some_and(|t| t.status == TaskStatus::Completed)
                })
            })
            .cloned()
            .collect()
    }

    /// Walk the plan as far as the subtask states allow.
    ///
    /// Issues what the current phase may run next and moves past finished
    /// phases whose sync points are met. The wait on a sync point starts as
    /// soon as its phase is fully issued, so its timeout runs while required
    /// subtasks are still in flight. A sync point released by a `continue`
    /// timeout lets the plan move on without waiting for stragglers.
    pub fn advance_plan(&mut self, tasks: &HashMap<Uuid, Task>, now: DateTime<Utc>) -> PlanActions {
        let mut actions = PlanActions::default();
        let pipeline = self.coordination_mode == Some(CoordinationMode::Pipeline);
        let Some(plan) = self.execution_plan.clone() else {
            return actions;
        };
        let status_of = |id: &Uuid| tasks.get(id).map(|t| t.status);

        while let Some(phase) = plan.phases.get(self.plan_state.current_phase) {
            self.progress.current_step = Some(phase.name.clone());
            if phase.parallel {
                for id in &phase.task_ids {
                    if self.plan_state.issued.insert(*id) {
                        actions.issue.push(IssueOrder {
                            task_id: *id,
                            agent_id: self.subtask_agent(*id),
                            input: None,
                        });
                    }
                }
            } else {
                let mut previous: Option<Uuid> = None;
                for id in &phase.task_ids {
                    if !self.plan_state.issued.contains(id) {
                        let prev_status = previous.and_then(|p| status_of(&p));
                        let prev_done = previous.is_none() || prev_status.is_some_and(is_terminal);
                        if !prev_done {
                            break;
                        }
                        if pipeline && previous.is_some() && prev_status != Some(TaskStatus::Completed) {
                            // A broken pipeline cannot feed anything downstream.
                            for rest in phase.task_ids.iter().skip_while(|t| *t != id) {
                                if self.plan_state.issued.insert(*rest) {
                                    actions.cancel.push(*rest);
                                }
                            }
                            break;
                        }
                        let input = if pipeline {
                            previous
                                .and_then(|p| tasks.get(&p))
                                .and_then(|t| t.result.clone())
                        } else {
                            None
                        };
                        self.plan_state.issued.insert(*id);
                        actions.issue.push(IssueOrder {
                            task_id: *id,
                            agent_id: self.subtask_agent(*id),
                            input,
                        });
                        break;
                    }
                    if !status_of(id).is_some_and(is_terminal) {
                        break;
                    }
                    previous = Some(*id);
                }
            }

            let phase_index = self.plan_state.current_phase;
            let fully_issued = phase.task_ids.iter().all(|id| self.plan_state.issued.contains(id));
            let blocked = !self.blocking_sync_points(tasks).is_empty();
            if fully_issued && blocked {
                self.plan_state.sync_waiting_since.get_or_insert(now);
            }
            if !actions.is_empty() || !fully_issued || blocked {
                break;
            }
            let phase_done = phase
                .task_ids
                .iter()
                .all(|id| status_of(id).is_some_and(is_terminal));
            let released = plan.sync_points.iter().any(|sp| {
                sp.after_phase == phase_index
                    && self.plan_state.released_sync_points.contains(&sp.name)
            });
            if !phase_done && !released {
                break;
            }
            self.plan_state.current_phase += 1;
            self.plan_state.sync_waiting_since = None;
            self.plan_state.sync_retries = 0;
        }
        if self.plan_state.current_phase >= plan.phases.len() {
            self.progress.current_step = None;
        }
        actions
    }

    /// Apply the `on_timeout` policy of the first blocking sync point once
    /// its wait has run out.
    pub fn check_sync_timeout(
        &mut self,
        tasks: &HashMap<Uuid, Task>,
        now: DateTime<Utc>,
        default_timeout_secs: u64,
    ) -> SyncTimeout {
        let Some(since) = self.plan_state.sync_waiting_since else {
            return SyncTimeout::NotDue;
        };
        let Some(sp) = self.blocking_sync_points(tasks).into_iter().next() else {
            return SyncTimeout::NotDue;
        };
        let secs = if sp.timeout_seconds == 0 {
            default_timeout_secs
        } else {
            sp.timeout_seconds
        };
        let timeout = chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000));
        if now <= since + timeout {
            return SyncTimeout::NotDue;
        }

        match sp.on_timeout {
            OnTimeout::Continue => {
                self.plan_state.released_sync_points.insert(sp.name.clone());
                self.plan_state.sync_waiting_since = None;
                SyncTimeout::Continued(sp.name)
            }
            OnTimeout::Fail => SyncTimeout::Failed(format!("sync point {} timed out", sp.name)),
            OnTimeout::Retry => {
                let max_retry = self
                    .plan()
                    .and_then(|p| p.phases.get(sp.after_phase))
                    .map_or(0, |p| p.max_retry);
                if self.plan_state.sync_retries >= max_retry {
                    return SyncTimeout::Failed(format!(
                        "sync point {} timed out after {} retries",
                        sp.name, self.plan_state.sync_retries
                    ));
                }
                self.plan_state.sync_retries += 1;
                self.plan_state.sync_waiting_since = Some(now);
                let mut actions = PlanActions::default();
                for id in &sp.required_tasks {
                    match tasks.get(id) {
                        Some(t) if t.status == TaskStatus::Completed => {}
                        Some(t) if !is_terminal(t.status) => actions.reissue.push(*id),
                        _ => {
                            let fresh = Uuid::new_v4();
                            self.replace_subtask(*id, fresh);
                            self.plan_state.issued.insert(fresh);
                            actions.replace.push((*id, fresh));
                        }
                    }
                }
                SyncTimeout::Retried(actions)
            }
        }
    }

    /// Swap every reference to `old` for `new`.
    fn replace_subtask(&mut self, old: Uuid, new: Uuid) {
        for id in &mut self.subtask_ids {
            if *id == old {
                *id = new;
            }
        }
        if let Some(original) = self.subtasks.iter().find(|s| s.id == old).cloned() {
            self.subtasks.push(Subtask { id: new, ..original });
        }
        if let Some(plan) = self.execution_plan.as_mut() {
            for phase in &mut plan.phases {
                for id in &mut phase.task_ids {
                    if *id == old {
                        *id = new;
                    }
                }
            }
            for sp in &mut plan.sync_points {
                for id in &mut sp.required_tasks {
                    if *id == old {
                        *id = new;
                    }
                }
            }
        }
    }
}
