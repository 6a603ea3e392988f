use crate::repository::Repository;
use crate::workflow::{Workflow, WorkflowExecution};
use meshflow_core::{
    Clock, MeshError, MeshResult, MetricsSink, Status, StatusMachine, StepStatus, WorkflowConfig,
    WorkflowStatus,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What an agent reported for a step attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Succeeded(Value),
    Failed(String),
}

enum DependencyState {
    Satisfied,
    Waiting,
    Blocked,
}

/// Drives workflow executions through their step graph.
///
/// The synchronous methods work on an execution the caller holds; the async
/// ones load it from the repository, apply the change, and write it back
/// under version CAS.
pub struct WorkflowExecutionEngine {
    repo: Arc<dyn Repository>,
    steps: StatusMachine<StepStatus>,
    workflows: StatusMachine<WorkflowStatus>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    config: WorkflowConfig,
    max_conflict_retries: u32,
}

impl WorkflowExecutionEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        config: WorkflowConfig,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            repo,
            steps: StatusMachine::new(),
            workflows: StatusMachine::new(),
            metrics,
            clock,
            config,
            max_conflict_retries: max_conflict_retries.max(1),
        }
    }

    fn set_status(&self, exec: &mut WorkflowExecution, to: WorkflowStatus) -> MeshResult<()> {
        exec.status = self
            .workflows
            .transition_to(exec.status, to, self.metrics.as_ref())?;
        let now = self.clock.now();
        if to == WorkflowStatus::Running && exec.started_at.is_none() {
            exec.started_at = Some(now);
        }
        if self.workflows.is_terminal(to) {
            exec.completed_at = Some(now);
            if let Some(started) = exec.started_at {
                self.metrics.record_timing(
                    "workflow.duration",
                    (now - started).to_std().unwrap_or_default(),
                    &[("status", to.as_str())],
                );
            }
            info!(execution_id = %exec.id, status = %to, "workflow execution finished");
        }
        Ok(())
    }

    fn step_to(&self, exec: &mut WorkflowExecution, step_id: &str, to: StepStatus) -> MeshResult<()> {
        let now = self.clock.now();
        let entry = exec
            .step_statuses
            .get_mut(step_id)
            .ok_or_else(|| MeshError::InvalidConfig(format!("unknown step: {step_id}")))?;
        entry.status = self
            .steps
            .transition_to(entry.status, to, self.metrics.as_ref())?;
        if to == StepStatus::Running {
            entry.started_at = Some(now);
        }
        if self.steps.is_terminal(to) {
            entry.completed_at = Some(now);
        }
        Ok(())
    }

    fn dependency_state(&self, wf: &Workflow, exec: &WorkflowExecution, dep: &str) -> DependencyState {
        let continue_on_error = wf.step(dep).is_some_and(|s| s.continue_on_error);
        match exec.step_status(dep) {
            Some(StepStatus::Completed) => DependencyState::Satisfied,
            Some(StepStatus::Failed | StepStatus::Timeout) if continue_on_error => {
                DependencyState::Satisfied
            }
            Some(StepStatus::Failed | StepStatus::Timeout | StepStatus::Skipped | StepStatus::Cancelled) => {
                DependencyState::Blocked
            }
            _ => DependencyState::Waiting,
        }
    }

    fn ensure_running(&self, exec: &WorkflowExecution) -> MeshResult<()> {
        if exec.status != WorkflowStatus::Running {
            return Err(MeshError::InvalidConfig(format!(
                "workflow execution {} is {}",
                exec.id, exec.status
            )));
        }
        Ok(())
    }

    /// Validate the graph, mark the execution running, and queue the roots.
    pub fn start(&self, wf: &Workflow, exec: &mut WorkflowExecution) -> MeshResult<Vec<String>> {
        wf.validate()?;
        if exec.workflow_id != wf.id {
            return Err(MeshError::InvalidConfig(format!(
                "execution {} does not belong to workflow {}",
                exec.id, wf.id
            )));
        }
        self.set_status(exec, WorkflowStatus::Running)?;
        info!(execution_id = %exec.id, workflow = %wf.name, "workflow execution started");
        self.queue_ready(wf, exec)
    }

    /// Queue pending steps whose dependencies are met and skip those whose
    /// dependencies can no longer be met. Returns the newly queued step ids.
    pub fn queue_ready(&self, wf: &Workflow, exec: &mut WorkflowExecution) -> MeshResult<Vec<String>> {
        let mut queued = Vec::new();
        if exec.status != WorkflowStatus::Running {
            return Ok(queued);
        }
        loop {
            let mut changed = false;
            for step in &wf.steps {
                if exec.step_status(&step.id) != Some(StepStatus::Pending) {
                    continue;
                }
                let states: Vec<DependencyState> = wf
                    .dependencies_of(&step.id)
                    .iter()
                    .map(|d| self.dependency_state(wf, exec, d))
                    .collect();
                if states.iter().any(|s| matches!(s, DependencyState::Blocked)) {
                    self.step_to(exec, &step.id, StepStatus::Skipped)?;
                    debug!(execution_id = %exec.id, step = %step.id, "step skipped");
                    changed = true;
                } else if states.iter().all(|s| matches!(s, DependencyState::Satisfied)) {
                    self.step_to(exec, &step.id, StepStatus::Queued)?;
                    queued.push(step.id.clone());
                }
            }
            if !changed {
                break;
            }
        }
        Ok(queued)
    }

    /// A queued or retrying step begins an attempt.
    pub fn start_step(&self, wf: &Workflow, exec: &mut WorkflowExecution, step_id: &str) -> MeshResult<()> {
        self.ensure_running(exec)?;
        if wf.step(step_id).is_none() {
            return Err(MeshError::InvalidConfig(format!("unknown step: {step_id}")));
        }
        self.step_to(exec, step_id, StepStatus::Running)?;
        if let Some(entry) = exec.step_statuses.get_mut(step_id) {
            entry.attempts += 1;
            entry.next_attempt_at = None;
        }
        Ok(())
    }

    pub fn complete_step(
        &self,
        wf: &Workflow,
        exec: &mut WorkflowExecution,
        step_id: &str,
        output: Value,
    ) -> MeshResult<Vec<String>> {
        self.step_to(exec, step_id, StepStatus::Completed)?;
        if let Some(entry) = exec.step_statuses.get_mut(step_id) {
            entry.output = Some(output);
            entry.error = None;
        }
        self.metrics
            .increment_counter("workflow.step.completed", 1.0, &[]);
        self.after_step_change(wf, exec)
    }

    /// Record a failed attempt. The step retries while its policy allows,
    /// otherwise it fails and its dependents are re-evaluated.
    pub fn fail_step(
        &self,
        wf: &Workflow,
        exec: &mut WorkflowExecution,
        step_id: &str,
        error: &str,
    ) -> MeshResult<Vec<String>> {
        let step = wf
            .step(step_id)
            .ok_or_else(|| MeshError::InvalidConfig(format!("unknown step: {step_id}")))?;
        let attempts = exec
            .step_statuses
            .get(step_id)
            .map_or(0, |s| s.attempts);
        let max_attempts = step
            .retry_policy
            .as_ref()
            .map_or(self.config.default_max_attempts, |p| p.max_attempts);

        if attempts < max_attempts {
            self.step_to(exec, step_id, StepStatus::Retrying)?;
            let delay = step
                .retry_policy
                .as_ref()
                .map(|p| p.backoff_delay(attempts))
                .unwrap_or_default();
            let next = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_default();
            if let Some(entry) = exec.step_statuses.get_mut(step_id) {
                entry.next_attempt_at = Some(next);
                entry.error = Some(error.to_string());
            }
            debug!(execution_id = %exec.id, step = step_id, attempts, "step scheduled for retry");
            return Ok(Vec::new());
        }

        self.step_to(exec, step_id, StepStatus::Failed)?;
        if let Some(entry) = exec.step_statuses.get_mut(step_id) {
            entry.error = Some(error.to_string());
        }
        self.metrics.increment_counter("workflow.step.failed", 1.0, &[]);
        warn!(execution_id = %exec.id, step = step_id, error, "step failed");
        self.after_step_change(wf, exec)
    }

    /// Start every retrying step whose backoff has elapsed.
    pub fn resume_due_retries(&self, wf: &Workflow, exec: &mut WorkflowExecution) -> MeshResult<Vec<String>> {
        if exec.status != WorkflowStatus::Running {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let due: Vec<String> = exec
            .step_statuses
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Retrying)
            .filter(|(_, s)| s.next_attempt_at.map_or(true, |at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            self.start_step(wf, exec, id)?;
        }
        Ok(due)
    }

    /// Time out overdue steps and, past the workflow timeout, the execution
    /// itself. Returns the ids of the steps that timed out.
    pub fn check_timeouts(&self, wf: &Workflow, exec: &mut WorkflowExecution) -> MeshResult<Vec<String>> {
        if self.workflows.is_terminal(exec.status) || exec.status == WorkflowStatus::Pending {
            return Ok(Vec::new());
        }
        let now = self.clock.now();

        if wf.timeout_seconds > 0 {
            if let Some(started) = exec.started_at {
                if now > started + seconds(wf.timeout_seconds) {
                    let running = self.cascade_cancel(exec)?;
                    self.set_status(exec, WorkflowStatus::Timeout)?;
                    exec.error = Some(format!("workflow timed out after {}s", wf.timeout_seconds));
                    return Ok(running);
                }
            }
        }

        let mut timed_out = Vec::new();
        for step in &wf.steps {
            let Some(entry) = exec.step_statuses.get(&step.id) else {
                continue;
            };
            if entry.status != StepStatus::Running {
                continue;
            }
            let limit = if step.timeout_seconds == 0 {
                self.config.default_step_timeout_secs
            } else {
                step.timeout_seconds
            };
            if entry.started_at.is_some_and(|s| now > s + seconds(limit)) {
                self.step_to(exec, &step.id, StepStatus::Timeout)?;
                if let Some(entry) = exec.step_statuses.get_mut(&step.id) {
                    entry.error = Some(format!("step timed out after {limit}s"));
                }
                warn!(execution_id = %exec.id, step = %step.id, "step timed out");
                timed_out.push(step.id.clone());
            }
        }
        if !timed_out.is_empty() {
            self.after_step_change(wf, exec)?;
        }
        Ok(timed_out)
    }

    pub fn pause(&self, exec: &mut WorkflowExecution) -> MeshResult<()> {
        self.set_status(exec, WorkflowStatus::Paused)
    }

    /// Resume a paused execution and catch up on anything that became ready.
    pub fn resume(&self, wf: &Workflow, exec: &mut WorkflowExecution) -> MeshResult<Vec<String>> {
        self.set_status(exec, WorkflowStatus::Running)?;
        self.after_step_change(wf, exec)
    }

    /// Cancel every unfinished step, then the execution.
    pub fn cancel(&self, exec: &mut WorkflowExecution, reason: &str) -> MeshResult<()> {
        if self.workflows.is_terminal(exec.status) {
            return Err(MeshError::InvalidTransition {
                kind: "workflow",
                from: exec.status.to_string(),
                to: WorkflowStatus::Cancelled.to_string(),
            });
        }
        self.cascade_cancel(exec)?;
        self.set_status(exec, WorkflowStatus::Cancelled)?;
        exec.error = Some(reason.to_string());
        Ok(())
    }

    fn cascade_cancel(&self, exec: &mut WorkflowExecution) -> MeshResult<Vec<String>> {
        let open: Vec<(String, StepStatus)> = exec
            .step_statuses
            .iter()
            .filter(|(_, s)| !self.steps.is_terminal(s.status))
            .map(|(id, s)| (id.clone(), s.status))
            .collect();
        for (id, status) in &open {
            let path = self
                .steps
                .path(*status, StepStatus::Cancelled)
                .unwrap_or_default();
            for next in path {
                self.step_to(exec, id, next)?;
            }
        }
        Ok(open.into_iter().map(|(id, _)| id).collect())
    }

    fn after_step_change(&self, wf: &Workflow, exec: &mut WorkflowExecution) -> MeshResult<Vec<String>> {
        let queued = self.queue_ready(wf, exec)?;
        self.finalize_if_done(wf, exec)?;
        Ok(queued)
    }

    /// Once every step is terminal, complete or fail the execution.
    pub fn finalize_if_done(&self, wf: &Workflow, exec: &mut WorkflowExecution) -> MeshResult<Option<WorkflowStatus>> {
        if exec.status != WorkflowStatus::Running {
            return Ok(None);
        }
        if !exec
            .step_statuses
            .values()
            .all(|s| self.steps.is_terminal(s.status))
        {
            return Ok(None);
        }
        let failed = wf.steps.iter().any(|step| {
            !step.continue_on_error
                && matches!(
                    exec.step_status(&step.id),
                    Some(StepStatus::Failed | StepStatus::Timeout)
                )
        });
        let outcome = if failed {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        self.set_status(exec, outcome)?;
        Ok(Some(outcome))
    }

    /// Create and start an execution of a stored workflow.
    pub async fn start_execution(&self, workflow_id: Uuid) -> MeshResult<(WorkflowExecution, Vec<String>)> {
        let wf = self.repo.load_workflow(workflow_id).await?;
        let mut exec = WorkflowExecution::new(&wf);
        let queued = self.start(&wf, &mut exec)?;
        self.repo.create_execution(&exec).await?;
        Ok((exec, queued))
    }

    /// Mark a queued step of a stored execution as running.
    pub async fn begin_step(&self, execution_id: Uuid, step_id: &str) -> MeshResult<WorkflowExecution> {
        let wf = {
            let exec = self.repo.load_execution(execution_id).await?;
            self.repo.load_workflow(exec.workflow_id).await?
        };
        self.update_execution(execution_id, |exec| {
            if exec.step_status(step_id) == Some(StepStatus::Running) {
                return Ok(false);
            }
            self.start_step(&wf, exec, step_id)?;
            Ok(true)
        })
        .await
    }

    /// Apply a step outcome to a stored execution.
    ///
    /// A queued step is started first, for workers that report only the end.
    /// A result for a step that already finished is ignored, so redelivery is
    /// harmless.
    pub async fn record_step_result(
        &self,
        execution_id: Uuid,
        step_id: &str,
        result: StepResult,
    ) -> MeshResult<WorkflowExecution> {
        let wf = {
            let exec = self.repo.load_execution(execution_id).await?;
            self.repo.load_workflow(exec.workflow_id).await?
        };
        self.update_execution(execution_id, |exec| {
            match exec.step_status(step_id) {
                Some(status) if self.steps.is_terminal(status) => return Ok(false),
                Some(StepStatus::Queued | StepStatus::Retrying) => {
                    self.start_step(&wf, exec, step_id)?;
                }
                None => return Err(MeshError::InvalidConfig(format!("unknown step: {step_id}"))),
                _ => {}
            }
            match &result {
                StepResult::Succeeded(output) => {
                    self.complete_step(&wf, exec, step_id, output.clone())?;
                }
                StepResult::Failed(error) => {
                    self.fail_step(&wf, exec, step_id, error)?;
                }
            }
            Ok(true)
        })
        .await
    }

    /// Run the clock-driven checks on a stored execution.
    pub async fn poll(&self, execution_id: Uuid) -> MeshResult<WorkflowExecution> {
        let wf = {
            let exec = self.repo.load_execution(execution_id).await?;
            self.repo.load_workflow(exec.workflow_id).await?
        };
        self.update_execution(execution_id, |exec| {
            let before = exec.clone();
            self.check_timeouts(&wf, exec)?;
            self.resume_due_retries(&wf, exec)?;
            Ok(*exec != before)
        })
        .await
    }

    async fn update_execution<F>(&self, execution_id: Uuid, mut mutate: F) -> MeshResult<WorkflowExecution>
    where
        F: FnMut(&mut WorkflowExecution) -> MeshResult<bool> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut exec = self.repo.load_execution(execution_id).await?;
            let expected = exec.version;
            if !mutate(&mut exec)? {
                return Ok(exec);
            }
            match self.repo.save_execution(&exec, expected).await {
                Ok(version) => {
                    exec.version = version;
                    return Ok(exec);
                }
                Err(e) if e.is_retryable() && attempt < self.max_conflict_retries => {
                    debug!(execution_id = %execution_id, attempt, "execution version conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::workflow::{BackoffType, WorkflowRetryPolicy, WorkflowStep, WorkflowType};
    use chrono::Duration;
    use meshflow_core::{ManualClock, NoopMetrics, RecordingMetrics};
    use serde_json::json;

    fn engine() -> (WorkflowExecutionEngine, Arc<ManualClock>, Arc<InMemoryRepository>) {
        let clock = Arc::new(ManualClock::default());
        let repo = Arc::new(InMemoryRepository::new());
        let engine = WorkflowExecutionEngine::new(
            repo.clone(),
            Arc::new(NoopMetrics),
            clock.clone(),
            WorkflowConfig::default(),
            3,
        );
        (engine, clock, repo)
    }

    fn diamond() -> Workflow {
        Workflow::new(Uuid::new_v4(), "release", WorkflowType::Dag)
            .with_step(WorkflowStep::new("build", "cargo build"))
            .with_step(WorkflowStep::new("test", "cargo test").depends_on(["build"]))
            .with_step(WorkflowStep::new("docs", "cargo doc").depends_on(["build"]))
            .with_step(WorkflowStep::new("ship", "publish").depends_on(["test", "docs"]))
    }

    fn run(engine: &WorkflowExecutionEngine, wf: &Workflow, exec: &mut WorkflowExecution, id: &str) -> Vec<String> {
        engine.start_step(wf, exec, id).unwrap();
        engine.complete_step(wf, exec, id, json!({"step": id})).unwrap()
    }

    #[test]
    fn test_diamond_runs_to_completion() {
        let (engine, _, _) = engine();
        let wf = diamond();
        let mut exec = WorkflowExecution::new(&wf);
        assert_eq!(engine.start(&wf, &mut exec).unwrap(), vec!["build"]);
        let mut next = run(&engine, &wf, &mut exec, "build");
        next.sort();
        assert_eq!(next, vec!["docs", "test"]);
        assert!(run(&engine, &wf, &mut exec, "test").is_empty());
        assert_eq!(run(&engine, &wf, &mut exec, "docs"), vec!["ship"]);
        run(&engine, &wf, &mut exec, "ship");
        assert_eq!(exec.status, WorkflowStatus::Completed);
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn test_finished_execution_reports_duration_tagged_by_status() {
        let metrics = Arc::new(RecordingMetrics::new());
        let engine = WorkflowExecutionEngine::new(
            Arc::new(InMemoryRepository::new()),
            metrics.clone(),
            Arc::new(ManualClock::default()),
            WorkflowConfig::default(),
            3,
        );
        let wf = Workflow::new(Uuid::new_v4(), "lint", WorkflowType::Sequential)
            .with_step(WorkflowStep::new("clippy", "cargo clippy"));
        let mut exec = WorkflowExecution::new(&wf);
        engine.start(&wf, &mut exec).unwrap();
        run(&engine, &wf, &mut exec, "clippy");
        assert_eq!(exec.status, WorkflowStatus::Completed);

        let timing = metrics
            .records()
            .into_iter()
            .find(|r| r.name == "workflow.duration")
            .unwrap();
        assert_eq!(timing.tags["status"], "completed");
    }

    #[test]
    fn test_failure_skips_dependents_and_fails_execution() {
        let (engine, _, _) = engine();
        let wf = diamond();
        let mut exec = WorkflowExecution::new(&wf);
        engine.start(&wf, &mut exec).unwrap();
        engine.start_step(&wf, &mut exec, "build").unwrap();
        engine.fail_step(&wf, &mut exec, "build", "linker error").unwrap();
        assert_eq!(exec.step_status("build"), Some(StepStatus::Failed));
        for id in ["test", "docs", "ship"] {
            assert_eq!(exec.step_status(id), Some(StepStatus::Skipped), "{id}");
        }
        assert_eq!(exec.status, WorkflowStatus::Failed);
    }

    #[test]
    fn test_continue_on_error_unblocks_dependents() {
        let (engine, _, _) = engine();
        let wf = Workflow::new(Uuid::new_v4(), "lenient", WorkflowType::Sequential)
            .with_step(WorkflowStep::new("lint", "clippy").continue_on_error())
            .with_step(WorkflowStep::new("build", "cargo build"));
        let mut exec = WorkflowExecution::new(&wf);
        engine.start(&wf, &mut exec).unwrap();
        engine.start_step(&wf, &mut exec, "lint").unwrap();
        let next = engine.fail_step(&wf, &mut exec, "lint", "warnings").unwrap();
        assert_eq!(next, vec!["build"]);
        run(&engine, &wf, &mut exec, "build");
        assert_eq!(exec.status, WorkflowStatus::Completed);
    }

    #[test]
    fn test_retry_with_backoff() {
        let (engine, clock, _) = engine();
        let wf = Workflow::new(Uuid::new_v4(), "flaky", WorkflowType::Parallel).with_step(
            WorkflowStep::new("fetch", "curl").with_retry(WorkflowRetryPolicy {
                max_attempts: 2,
                backoff: BackoffType::Linear,
                initial_wait_ms: 5_000,
                max_wait_ms: 0,
            }),
        );
        let mut exec = WorkflowExecution::new(&wf);
        engine.start(&wf, &mut exec).unwrap();
        engine.start_step(&wf, &mut exec, "fetch").unwrap();
        engine.fail_step(&wf, &mut exec, "fetch", "503").unwrap();
        assert_eq!(exec.step_status("fetch"), Some(StepStatus::Retrying));

        assert!(engine.resume_due_retries(&wf, &mut exec).unwrap().is_empty());
        clock.advance(Duration::seconds(5));
        assert_eq!(engine.resume_due_retries(&wf, &mut exec).unwrap(), vec!["fetch"]);
        assert_eq!(exec.step_statuses["fetch"].attempts, 2);

        engine.fail_step(&wf, &mut exec, "fetch", "503 again").unwrap();
        assert_eq!(exec.step_status("fetch"), Some(StepStatus::Failed));
        assert_eq!(exec.status, WorkflowStatus::Failed);
    }

    #[test]
    fn test_step_timeout_uses_step_limit() {
        let (engine, clock, _) = engine();
        let wf = Workflow::new(Uuid::new_v4(), "slow", WorkflowType::Parallel)
            .with_step(WorkflowStep::new("crunch", "numbers").with_timeout(30));
        let mut exec = WorkflowExecution::new(&wf);
        engine.start(&wf, &mut exec).unwrap();
        engine.start_step(&wf, &mut exec, "crunch").unwrap();
        clock.advance(Duration::seconds(30));
        assert!(engine.check_timeouts(&wf, &mut exec).unwrap().is_empty());
        clock.advance(Duration::seconds(1));
        assert_eq!(engine.check_timeouts(&wf, &mut exec).unwrap(), vec!["crunch"]);
        assert_eq!(exec.step_status("crunch"), Some(StepStatus::Timeout));
        assert_eq!(exec.status, WorkflowStatus::Failed);
    }

    #[test]
    fn test_execution_timeout_cancels_open_steps() {
        let (engine, clock, _) = engine();
        let wf = diamond().with_timeout(60);
        let mut exec = WorkflowExecution::new(&wf);
        engine.start(&wf, &mut exec).unwrap();
        engine.start_step(&wf, &mut exec, "build").unwrap();
        clock.advance(Duration::seconds(61));
        engine.check_timeouts(&wf, &mut exec).unwrap();
        assert_eq!(exec.status, WorkflowStatus::Timeout);
        assert!(exec
            .step_statuses
            .values()
            .all(|s| s.status == StepStatus::Cancelled));
    }

    #[test]
    fn test_pause_holds_back_new_steps() {
        let (engine, _, _) = engine();
        let wf = diamond();
        let mut exec = WorkflowExecution::new(&wf);
        engine.start(&wf, &mut exec).unwrap();
        engine.start_step(&wf, &mut exec, "build").unwrap();
        engine.pause(&mut exec).unwrap();
        let queued = engine
            .complete_step(&wf, &mut exec, "build", json!(null))
            .unwrap();
        assert!(queued.is_empty());
        assert!(engine.start_step(&wf, &mut exec, "test").is_err());

        let mut queued = engine.resume(&wf, &mut exec).unwrap();
        queued.sort();
        assert_eq!(queued, vec!["docs", "test"]);
    }

    #[test]
    fn test_cancel_cascades_and_keeps_finished_steps() {
        let (engine, _, _) = engine();
        let wf = diamond();
        let mut exec = WorkflowExecution::new(&wf);
        engine.start(&wf, &mut exec).unwrap();
        run(&engine, &wf, &mut exec, "build");
        engine.start_step(&wf, &mut exec, "test").unwrap();
        engine.cancel(&mut exec, "release aborted").unwrap();

        assert_eq!(exec.status, WorkflowStatus::Cancelled);
        assert_eq!(exec.step_status("build"), Some(StepStatus::Completed));
        for id in ["test", "docs", "ship"] {
            assert_eq!(exec.step_status(id), Some(StepStatus::Cancelled), "{id}");
        }
        assert!(engine.cancel(&mut exec, "again").is_err());
    }

    #[tokio::test]
    async fn test_record_step_result_persists_with_version_bump() {
        let (engine, _, repo) = engine();
        let wf = diamond();
        repo.create_workflow(&wf).await.unwrap();
        let (exec, queued) = engine.start_execution(wf.id).await.unwrap();
        assert_eq!(queued, vec!["build"]);

        let updated = engine
            .update_execution(exec.id, |e| {
                engine.start_step(&wf, e, "build")?;
                Ok(true)
            })
            .await
            .unwrap();
        assert_eq!(updated.version, exec.version + 1);

        let done = engine
            .record_step_result(exec.id, "build", StepResult::Succeeded(json!("ok")))
            .await
            .unwrap();
        assert_eq!(done.version, exec.version + 2);
        assert_eq!(done.step_status("test"), Some(StepStatus::Queued));

        let again = engine
            .record_step_result(exec.id, "build", StepResult::Succeeded(json!("ok")))
            .await
            .unwrap();
        assert_eq!(again.version, done.version);
    }
}
