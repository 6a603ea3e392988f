//! Closed status enums and the table-driven [`StatusMachine`].
//!
//! Each status dimension lists its legal targets as a static slice, so the
//! adjacency table is immutable and built into the binary. A [`StatusMachine`]
//! indexes that table into a map once and validates every transition against
//! it, reporting accepted and rejected edges to a [`MetricsSink`].

use crate::metrics::MetricsSink;
use crate::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::str::FromStr;

/// A status dimension with a fixed set of members and a fixed adjacency table.
pub trait Status: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Name of the dimension, used in errors and metric tags.
    const KIND: &'static str;

    /// Every member of the enum.
    fn all() -> &'static [Self];

    /// Canonical lowercase name.
    fn as_str(&self) -> &'static str;

    /// Legal next states from `self`.
    fn allowed_targets(&self) -> &'static [Self];

    /// Parse a raw status string, rejecting anything outside the enum.
    fn parse(raw: &str) -> MeshResult<Self> {
        let needle = raw.trim().to_ascii_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|s| s.as_str() == needle)
            .ok_or_else(|| MeshError::InvalidStatus {
                kind: Self::KIND,
                value: raw.to_string(),
            })
    }
}

// --- Agent ---

/// Lifecycle status of an agent. Agents are long-lived, so the table has no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered but not running.
    Offline,
    /// Booting.
    Starting,
    /// Accepting work.
    Active,
    /// Finishing current work, accepting nothing new.
    Draining,
    /// Idle and not accepting work.
    Inactive,
    /// Taken out of rotation by an operator.
    Maintenance,
    /// Unhealthy.
    Error,
    /// Shutting down.
    Stopping,
}

impl Status for AgentStatus {
    const KIND: &'static str = "agent";

    fn all() -> &'static [Self] {
        use AgentStatus::*;
        &[
            Offline,
            Starting,
            Active,
            Draining,
            Inactive,
            Maintenance,
            Error,
            Stopping,
        ]
    }

    fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Offline => "offline",
            AgentStatus::Starting => "starting",
            AgentStatus::Active => "active",
            AgentStatus::Draining => "draining",
            AgentStatus::Inactive => "inactive",
            AgentStatus::Maintenance => "maintenance",
            AgentStatus::Error => "error",
            AgentStatus::Stopping => "stopping",
        }
    }

    fn allowed_targets(&self) -> &'static [Self] {
        use AgentStatus::*;
        match self {
            Offline => &[Starting],
            Starting => &[Active, Error],
            Active => &[Draining, Maintenance, Error, Stopping],
            Draining => &[Inactive, Error],
            Inactive => &[Active, Maintenance, Stopping],
            Maintenance => &[Active, Inactive, Stopping],
            Error => &[Stopping, Maintenance],
            Stopping => &[Offline],
        }
    }
}

// --- Task ---

/// Status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet assigned.
    Pending,
    /// Assigned to an agent that has not answered yet.
    Assigned,
    /// The assignee accepted the task.
    Accepted,
    /// The assignee declined the task.
    Rejected,
    /// Being worked on.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully with no retries left.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
    /// Ran past its timeout.
    Timeout,
}

impl Status for TaskStatus {
    const KIND: &'static str = "task";

    fn all() -> &'static [Self] {
        use TaskStatus::*;
        &[
            Pending, Assigned, Accepted, Rejected, InProgress, Completed, Failed, Cancelled, Timeout,
        ]
    }

    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Accepted => "accepted",
            TaskStatus::Rejected => "rejected",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    fn allowed_targets(&self) -> &'static [Self] {
        use TaskStatus::*;
        match self {
            Pending => &[Assigned, Cancelled],
            Assigned => &[Accepted, Rejected, Cancelled, Timeout],
            Accepted => &[InProgress, Assigned, Cancelled, Timeout],
            Rejected => &[Pending, Assigned, Cancelled],
            // `Pending` is the retry edge, `Assigned` the reassignment edge.
            InProgress => &[Completed, Failed, Pending, Assigned, Cancelled, Timeout],
            Completed | Failed | Cancelled | Timeout => &[],
        }
    }
}

// --- Workflow step ---

/// Status of one step inside a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting on dependencies.
    Pending,
    /// Eligible and waiting for a worker.
    Queued,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Never executed because an upstream step failed.
    Skipped,
    /// Waiting for the next retry attempt.
    Retrying,
    /// Cancellation requested.
    Cancelling,
    /// Cancelled.
    Cancelled,
    /// Ran past its timeout.
    Timeout,
}

impl Status for StepStatus {
    const KIND: &'static str = "step";

    fn all() -> &'static [Self] {
        use StepStatus::*;
        &[
            Pending, Queued, Running, Completed, Failed, Skipped, Retrying, Cancelling, Cancelled,
            Timeout,
        ]
    }

    fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Queued => "queued",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Retrying => "retrying",
            StepStatus::Cancelling => "cancelling",
            StepStatus::Cancelled => "cancelled",
            StepStatus::Timeout => "timeout",
        }
    }

    fn allowed_targets(&self) -> &'static [Self] {
        use StepStatus::*;
        match self {
            Pending => &[Queued, Skipped, Cancelling],
            Queued => &[Running, Cancelling],
            Running => &[Completed, Failed, Retrying, Cancelling, Timeout],
            Retrying => &[Running, Failed, Cancelling],
            Cancelling => &[Cancelled],
            Completed | Failed | Skipped | Cancelled | Timeout => &[],
        }
    }
}

// --- Workflow ---

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not started.
    Pending,
    /// Steps are executing.
    Running,
    /// Suspended by an operator.
    Paused,
    /// Every step finished and none failed fatally.
    Completed,
    /// A step failed without `continue_on_error`.
    Failed,
    /// Cancelled.
    Cancelled,
    /// The execution ran past its timeout.
    Timeout,
}

impl Status for WorkflowStatus {
    const KIND: &'static str = "workflow";

    fn all() -> &'static [Self] {
        use WorkflowStatus::*;
        &[Pending, Running, Paused, Completed, Failed, Cancelled, Timeout]
    }

    fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Timeout => "timeout",
        }
    }

    fn allowed_targets(&self) -> &'static [Self] {
        use WorkflowStatus::*;
        match self {
            Pending => &[Running, Cancelled],
            Running => &[Paused, Completed, Failed, Cancelled, Timeout],
            Paused => &[Running, Cancelled, Timeout],
            Completed | Failed | Cancelled | Timeout => &[],
        }
    }
}

macro_rules! impl_display_from_str {
    ($($ty:ty),+) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }

            impl FromStr for $ty {
                type Err = MeshError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    <$ty as Status>::parse(s)
                }
            }
        )+
    };
}

impl_display_from_str!(AgentStatus, TaskStatus, StepStatus, WorkflowStatus);

// --- Machine ---

/// Validated transitions over one status dimension.
///
/// `can_transition` is a pure lookup. `transition_to` re-checks it and emits a
/// counter tagged `{kind, from, to}` for every accepted or rejected edge; a
/// rejected edge leaves the caller's state untouched and returns
/// [`MeshError::InvalidTransition`].
#[derive(Debug, Clone)]
pub struct StatusMachine<S: Status> {
    table: HashMap<S, HashSet<S>>,
    _marker: PhantomData<S>,
}

impl<S: Status> StatusMachine<S> {
    /// Index the static table of `S`.
    pub fn new() -> Self {
        let table = S::all()
            .iter()
            .map(|s| (*s, s.allowed_targets().iter().copied().collect()))
            .collect();
        Self {
            table,
            _marker: PhantomData,
        }
    }

    /// Whether `from -> to` is a legal edge.
    pub fn can_transition(&self, from: S, to: S) -> bool {
        self.table
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    /// Validate and perform `from -> to`, reporting the outcome to `metrics`.
    pub fn transition_to(&self, from: S, to: S, metrics: &dyn MetricsSink) -> MeshResult<S> {
        let tags = [("kind", S::KIND), ("from", from.as_str()), ("to", to.as_str())];
        if self.can_transition(from, to) {
            metrics.increment_counter("status_machine.transition.success", 1.0, &tags);
            tracing::debug!(kind = S::KIND, %from, %to, "status transition");
            Ok(to)
        } else {
            metrics.increment_counter("status_machine.transition.invalid", 1.0, &tags);
            tracing::warn!(kind = S::KIND, %from, %to, "rejected status transition");
            Err(MeshError::InvalidTransition {
                kind: S::KIND,
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Reject any raw value that is not a member of `S`.
    pub fn validate(&self, raw: &str) -> MeshResult<S> {
        S::parse(raw)
    }

    /// A state is terminal when it has no outgoing edges.
    pub fn is_terminal(&self, state: S) -> bool {
        self.table.get(&state).map_or(true, HashSet::is_empty)
    }

    /// Shortest legal path from `from` to `to`, excluding `from`.
    ///
    /// Returns `Some(vec![])` when the states are equal and `None` when `to`
    /// is unreachable.
    pub fn path(&self, from: S, to: S) -> Option<Vec<S>> {
        if from == to {
            return Some(Vec::new());
        }
        let mut previous: HashMap<S, S> = HashMap::new();
        let mut frontier = VecDeque::from([from]);
        while let Some(state) = frontier.pop_front() {
            // Walk the static slice so the search order is deterministic.
            for next in state.allowed_targets() {
                if *next == from || previous.contains_key(next) {
                    continue;
                }
                previous.insert(*next, state);
                if *next == to {
                    let mut path = vec![to];
                    let mut cursor = to;
                    while let Some(prev) = previous.get(&cursor) {
                        if *prev == from {
                            break;
                        }
                        path.push(*prev);
                        cursor = *prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                frontier.push_back(*next);
            }
        }
        None
    }
}

impl<S: Status> Default for StatusMachine<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::metrics::RecordingMetrics;

    fn expected_agent_table() -> Vec<(AgentStatus, Vec<AgentStatus>)> {
        use AgentStatus::*;
        vec![
            (Offline, vec![Starting]),
            (Starting, vec![Active, Error]),
            (Active, vec![Draining, Maintenance, Error, Stopping]),
            (Draining, vec![Inactive, Error]),
            (Inactive, vec![Active, Maintenance, Stopping]),
            (Maintenance, vec![Active, Inactive, Stopping]),
            (Error, vec![Stopping, Maintenance]),
            (Stopping, vec![Offline]),
        ]
    }

    fn expected_step_table() -> Vec<(StepStatus, Vec<StepStatus>)> {
        use StepStatus::*;
        vec![
            (Pending, vec![Queued, Skipped, Cancelling]),
            (Queued, vec![Running, Cancelling]),
            (Running, vec![Completed, Failed, Retrying, Cancelling, Timeout]),
            (Retrying, vec![Running, Failed, Cancelling]),
            (Cancelling, vec![Cancelled]),
            (Completed, vec![]),
            (Failed, vec![]),
            (Skipped, vec![]),
            (Cancelled, vec![]),
            (Timeout, vec![]),
        ]
    }

    fn expected_workflow_table() -> Vec<(WorkflowStatus, Vec<WorkflowStatus>)> {
        use WorkflowStatus::*;
        vec![
            (Pending, vec![Running, Cancelled]),
            (Running, vec![Paused, Completed, Failed, Cancelled, Timeout]),
            (Paused, vec![Running, Cancelled, Timeout]),
            (Completed, vec![]),
            (Failed, vec![]),
            (Cancelled, vec![]),
            (Timeout, vec![]),
        ]
    }

    fn assert_exhaustive<S: Status>(expected: Vec<(S, Vec<S>)>) {
        let machine = StatusMachine::<S>::new();
        assert_eq!(expected.len(), S::all().len());
        for (from, targets) in &expected {
            for to in S::all() {
                assert_eq!(
                    machine.can_transition(*from, *to),
                    targets.contains(to),
                    "{} {from} -> {to}",
                    S::KIND
                );
            }
        }
    }

    #[test]
    fn test_agent_table_exhaustive() {
        assert_exhaustive(expected_agent_table());
    }

    #[test]
    fn test_step_table_exhaustive() {
        assert_exhaustive(expected_step_table());
    }

    #[test]
    fn test_workflow_table_exhaustive() {
        assert_exhaustive(expected_workflow_table());
    }

    fn assert_terminal_iff_no_edges<S: Status>() {
        let machine = StatusMachine::<S>::new();
        for state in S::all() {
            let has_edges = S::all().iter().any(|to| machine.can_transition(*state, *to));
            assert_eq!(machine.is_terminal(*state), !has_edges, "{state}");
        }
    }

    #[test]
    fn test_terminal_iff_no_outgoing_edges() {
        assert_terminal_iff_no_edges::<AgentStatus>();
        assert_terminal_iff_no_edges::<TaskStatus>();
        assert_terminal_iff_no_edges::<StepStatus>();
        assert_terminal_iff_no_edges::<WorkflowStatus>();
    }

    #[test]
    fn test_agent_has_no_terminal_state() {
        let machine = StatusMachine::<AgentStatus>::new();
        assert!(AgentStatus::all().iter().all(|s| !machine.is_terminal(*s)));
    }

    #[test]
    fn test_terminal_sets() {
        let steps = StatusMachine::<StepStatus>::new();
        let terminal: Vec<_> = StepStatus::all()
            .iter()
            .copied()
            .filter(|s| steps.is_terminal(*s))
            .collect();
        assert_eq!(
            terminal,
            vec![
                StepStatus::Completed,
                StepStatus::Failed,
                StepStatus::Skipped,
                StepStatus::Cancelled,
                StepStatus::Timeout
            ]
        );

        let tasks = StatusMachine::<TaskStatus>::new();
        assert!(tasks.is_terminal(TaskStatus::Completed));
        assert!(tasks.is_terminal(TaskStatus::Failed));
        assert!(tasks.is_terminal(TaskStatus::Cancelled));
        assert!(tasks.is_terminal(TaskStatus::Timeout));
        assert!(!tasks.is_terminal(TaskStatus::InProgress));
    }

    #[test]
    fn test_transition_success_emits_counter() {
        let metrics = RecordingMetrics::new();
        let machine = StatusMachine::<WorkflowStatus>::new();
        let next = machine
            .transition_to(WorkflowStatus::Pending, WorkflowStatus::Running, &metrics)
            .unwrap();
        assert_eq!(next, WorkflowStatus::Running);
        assert_eq!(
            metrics.counter_total("status_machine.transition.success"),
            1.0
        );
        let calls = metrics.counters();
        assert_eq!(calls[0].tags.get("from").map(String::as_str), Some("pending"));
        assert_eq!(calls[0].tags.get("to").map(String::as_str), Some("running"));
    }

    #[test]
    fn test_invalid_transition_is_error_with_counter() {
        let metrics = RecordingMetrics::new();
        let machine = StatusMachine::<WorkflowStatus>::new();
        let err = machine
            .transition_to(WorkflowStatus::Completed, WorkflowStatus::Running, &metrics)
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidTransition { kind: "workflow", .. }));
        assert_eq!(
            metrics.counter_total("status_machine.transition.invalid"),
            1.0
        );
        assert_eq!(
            metrics.counter_total("status_machine.transition.success"),
            0.0
        );
    }

    #[test]
    fn test_validate_rejects_unknown_values() {
        let machine = StatusMachine::<AgentStatus>::new();
        assert_eq!(machine.validate("active").unwrap(), AgentStatus::Active);
        assert_eq!(machine.validate(" Draining ").unwrap(), AgentStatus::Draining);
        let err = machine.validate("available").unwrap_err();
        assert!(matches!(err, MeshError::InvalidStatus { kind: "agent", .. }));
        assert!("in_progress".parse::<TaskStatus>().is_ok());
        assert!("in-progress".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        for status in StepStatus::all() {
            assert_eq!(status.to_string().parse::<StepStatus>().unwrap(), *status);
        }
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn test_path_finds_shortest_route() {
        let tasks = StatusMachine::<TaskStatus>::new();
        assert_eq!(
            tasks.path(TaskStatus::Pending, TaskStatus::Completed),
            Some(vec![
                TaskStatus::Assigned,
                TaskStatus::Accepted,
                TaskStatus::InProgress,
                TaskStatus::Completed
            ])
        );
        assert_eq!(tasks.path(TaskStatus::Completed, TaskStatus::Pending), None);
        assert_eq!(
            tasks.path(TaskStatus::Assigned, TaskStatus::Assigned),
            Some(vec![])
        );

        let agents = StatusMachine::<AgentStatus>::new();
        assert_eq!(
            agents.path(AgentStatus::Draining, AgentStatus::Offline),
            Some(vec![
                AgentStatus::Inactive,
                AgentStatus::Stopping,
                AgentStatus::Offline
            ])
        );
    }

    #[test]
    fn test_path_edges_are_all_legal() {
        let agents = StatusMachine::<AgentStatus>::new();
        for from in AgentStatus::all() {
            for to in AgentStatus::all() {
                let path = agents.path(*from, *to).unwrap();
                let mut cursor = *from;
                for step in path {
                    assert!(agents.can_transition(cursor, step));
                    cursor = step;
                }
                assert_eq!(cursor, *to);
            }
        }
    }
}
