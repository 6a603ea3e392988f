use crate::repository::Repository;
use crate::types::Task;
use meshflow_core::{Clock, MeshError, MeshResult, MetricsSink, Status, StatusMachine, TaskStatus};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Owns the state transitions of individual tasks.
///
/// Every mutator goes through the task [`StatusMachine`], so a terminal task
/// can never change status again. Mutators only touch the in-memory record;
/// persisting it is a version-guarded write, see [`TaskLifecycle::update`].
#[derive(Clone)]
pub struct TaskLifecycle {
    machine: StatusMachine<TaskStatus>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl TaskLifecycle {
    pub fn new(metrics: Arc<dyn MetricsSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            machine: StatusMachine::new(),
            metrics,
            clock,
        }
    }

    pub fn machine(&self) -> &StatusMachine<TaskStatus> {
        &self.machine
    }

    pub fn is_terminal(&self, task: &Task) -> bool {
        self.machine.is_terminal(task.status)
    }

    /// Not terminal and retries left.
    pub fn can_retry(&self, task: &Task) -> bool {
        !self.is_terminal(task) && task.retry_count < task.max_retries
    }

    /// Started, not terminal, and past `started_at + timeout_seconds`.
    pub fn is_overdue(&self, task: &Task, now: chrono::DateTime<chrono::Utc>) -> bool {
        let Some(started) = task.started_at else {
            return false;
        };
        if self.is_terminal(task) {
            return false;
        }
        let timeout = chrono::Duration::seconds(i64::try_from(task.timeout_seconds).unwrap_or(i64::MAX / 1000));
        now > started + timeout
    }

    /// `completed_at - started_at`, or zero when either is unset.
    pub fn duration(&self, task: &Task) -> std::time::Duration {
        match (task.started_at, task.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => std::time::Duration::ZERO,
        }
    }

    /// Move `task` along one validated edge.
    pub fn transition(&self, task: &mut Task, to: TaskStatus) -> MeshResult<()> {
        let from = task.status;
        task.status = self.machine.transition_to(from, to, self.metrics.as_ref())?;
        let now = self.clock.now();
        task.updated_at = now;
        match to {
            TaskStatus::Assigned => task.assigned_at = Some(now),
            TaskStatus::InProgress => task.started_at = Some(now),
            TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Cancelled
            | TaskStatus::Timeout => {
                task.completed_at = Some(now);
                if let Some(started) = task.started_at {
                    let elapsed = (now - started).to_std().unwrap_or_default();
                    self.metrics
                        .record_timing("task.duration", elapsed, &[("status", to.as_str())]);
                }
            }
            _ => {}
        }
        debug!(task_id = %task.id, %from, %to, "task transition");
        Ok(())
    }

    /// Walk the shortest legal path to `target`. A task already there is left alone.
    pub fn advance_to(&self, task: &mut Task, target: TaskStatus) -> MeshResult<()> {
        let path = self
            .machine
            .path(task.status, target)
            .ok_or_else(|| MeshError::InvalidTransition {
                kind: "task",
                from: task.status.to_string(),
                to: target.to_string(),
            })?;
        for next in path {
            self.transition(task, next)?;
        }
        Ok(())
    }

    /// Hand the task to `agent`. Reassigning an already-assigned task keeps its status.
    pub fn assign(&self, task: &mut Task, agent: &str) -> MeshResult<()> {
        if task.status != TaskStatus::Assigned {
            self.transition(task, TaskStatus::Assigned)?;
        } else {
            task.assigned_at = Some(self.clock.now());
            task.updated_at = self.clock.now();
        }
        task.assigned_to = Some(agent.to_string());
        Ok(())
    }

    /// Reassignment driven by delegation. Same as [`assign`](Self::assign) but
    /// refuses terminal tasks with a delegation error.
    pub fn reassign(&self, task: &mut Task, to_agent: &str) -> MeshResult<()> {
        if self.is_terminal(task) {
            return Err(MeshError::Delegation(format!(
                "task {} is {} and cannot be reassigned",
                task.id, task.status
            )));
        }
        self.assign(task, to_agent)
    }

    pub fn accept(&self, task: &mut Task) -> MeshResult<()> {
        self.transition(task, TaskStatus::Accepted)
    }

    pub fn reject(&self, task: &mut Task, reason: &str) -> MeshResult<()> {
        self.transition(task, TaskStatus::Rejected)?;
        task.assigned_to = None;
        task.error = Some(reason.to_string());
        Ok(())
    }

    pub fn start(&self, task: &mut Task) -> MeshResult<()> {
        self.transition(task, TaskStatus::InProgress)
    }

    pub fn complete(&self, task: &mut Task, result: serde_json::Value) -> MeshResult<()> {
        self.transition(task, TaskStatus::Completed)?;
        task.result = Some(result);
        task.error = None;
        Ok(())
    }

    /// Record a failed attempt of an in-progress task.
    ///
    /// With retries left the task goes back to `pending` (unassigned,
    /// `retry_count + 1`) and `Ok(true)` is returned; otherwise it becomes
    /// `failed` and `Ok(false)` is returned.
    pub fn fail_attempt(&self, task: &mut Task, error: &str) -> MeshResult<bool> {
        if self.can_retry(task) {
            self.transition(task, TaskStatus::Pending)?;
            task.retry_count += 1;
            task.assigned_to = None;
            task.started_at = None;
            task.error = Some(error.to_string());
            self.metrics.increment_counter("task.retried", 1.0, &[]);
            info!(task_id = %task.id, retry = task.retry_count, max = task.max_retries, "task queued for retry");
            return Ok(true);
        }
        self.transition(task, TaskStatus::Failed)?;
        task.error = Some(error.to_string());
        self.metrics.increment_counter("task.failed", 1.0, &[]);
        warn!(task_id = %task.id, error, "task failed");
        Ok(false)
    }

    pub fn cancel(&self, task: &mut Task, reason: &str) -> MeshResult<()> {
        self.transition(task, TaskStatus::Cancelled)?;
        task.error = Some(reason.to_string());
        Ok(())
    }

    pub fn mark_timeout(&self, task: &mut Task) -> MeshResult<()> {
        self.transition(task, TaskStatus::Timeout)?;
        task.error = Some(format!("timed out after {}s", task.timeout_seconds));
        self.metrics.increment_counter("task.timeout", 1.0, &[]);
        Ok(())
    }

    /// Load, mutate, and write back a task under optimistic concurrency.
    ///
    /// `mutate` returns whether it changed anything; an unchanged task is not
    /// written. On a version conflict the task is reloaded and `mutate` runs
    /// again, up to `max_attempts` times.
    pub async fn update<F>(
        &self,
        repo: &dyn Repository,
        task_id: Uuid,
        max_attempts: u32,
        mut mutate: F,
    ) -> MeshResult<Task>
    where
        F: FnMut(&Self, &mut Task) -> MeshResult<bool> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut task = repo.load_task(task_id).await?;
            let expected = task.version;
            if !mutate(self, &mut task)? {
                return Ok(task);
            }
            match repo.save_task(&task, expected).await {
                Ok(version) => {
                    task.version = version;
                    return Ok(task);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    self.metrics
                        .increment_counter("task.update.conflict", 1.0, &[]);
                    debug!(task_id = %task_id, attempt, "version conflict, reloading task");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use chrono::{Duration, Utc};
    use meshflow_core::{ManualClock, NoopMetrics, RecordingMetrics};

    fn lifecycle_with_clock() -> (TaskLifecycle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (
            TaskLifecycle::new(Arc::new(NoopMetrics), clock.clone()),
            clock,
        )
    }

    fn task() -> Task {
        Task::new(Uuid::new_v4(), "analyze", "Analyze repo", "planner")
    }

    #[test]
    fn test_happy_path_sets_timestamps() {
        let (lc, clock) = lifecycle_with_clock();
        let mut t = task();
        lc.assign(&mut t, "agent-1").unwrap();
        assert_eq!(t.status, TaskStatus::Assigned);
        assert!(t.assigned_at.is_some());
        lc.accept(&mut t).unwrap();
        lc.start(&mut t).unwrap();
        clock.advance(Duration::seconds(42));
        lc.complete(&mut t, serde_json::json!({"ok": true})).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(lc.duration(&t), std::time::Duration::from_secs(42));
    }

    #[test]
    fn test_finished_task_reports_duration_tagged_by_status() {
        let metrics = Arc::new(RecordingMetrics::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let lc = TaskLifecycle::new(metrics.clone(), clock.clone());
        let mut t = task();
        lc.assign(&mut t, "agent-1").unwrap();
        lc.advance_to(&mut t, TaskStatus::InProgress).unwrap();
        clock.advance(Duration::seconds(3));
        lc.complete(&mut t, serde_json::json!(null)).unwrap();

        let timing = metrics
            .records()
            .into_iter()
            .find(|r| r.name == "task.duration")
            .unwrap();
        assert_eq!(timing.tags["status"], "completed");
        assert_eq!(timing.value, 3_000.0);
    }

    #[test]
    fn test_terminal_task_is_immutable() {
        let (lc, _) = lifecycle_with_clock();
        let mut t = task();
        lc.cancel(&mut t, "no longer needed").unwrap();
        let before = t.clone();
        assert!(lc.start(&mut t).is_err());
        assert!(lc.assign(&mut t, "agent-2").is_err());
        assert!(lc.reassign(&mut t, "agent-2").is_err());
        assert_eq!(t, before);
    }

    #[test]
    fn test_can_retry() {
        let (lc, _) = lifecycle_with_clock();
        let mut t = task().with_max_retries(1);
        assert!(lc.can_retry(&t));
        t.retry_count = 1;
        assert!(!lc.can_retry(&t));
        t.retry_count = 0;
        t.status = TaskStatus::Failed;
        assert!(!lc.can_retry(&t));
    }

    #[test]
    fn test_fail_attempt_retries_then_fails() {
        let (lc, _) = lifecycle_with_clock();
        let mut t = task().with_max_retries(1);
        lc.advance_to(&mut t, TaskStatus::InProgress).unwrap();
        assert!(lc.fail_attempt(&mut t, "oom").unwrap());
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 1);
        assert!(t.assigned_to.is_none());

        lc.advance_to(&mut t, TaskStatus::InProgress).unwrap();
        assert!(!lc.fail_attempt(&mut t, "oom again").unwrap());
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some("oom again"));
    }

    #[test]
    fn test_is_overdue() {
        let (lc, clock) = lifecycle_with_clock();
        let mut t = task().with_timeout(60);
        assert!(!lc.is_overdue(&t, clock.now()));
        lc.advance_to(&mut t, TaskStatus::InProgress).unwrap();
        clock.advance(Duration::seconds(60));
        assert!(!lc.is_overdue(&t, clock.now()));
        clock.advance(Duration::seconds(1));
        assert!(lc.is_overdue(&t, clock.now()));
        lc.mark_timeout(&mut t).unwrap();
        assert!(!lc.is_overdue(&t, clock.now()));
    }

    #[test]
    fn test_duration_zero_when_unset() {
        let (lc, _) = lifecycle_with_clock();
        assert_eq!(lc.duration(&task()), std::time::Duration::ZERO);
    }

    #[test]
    fn test_advance_to_walks_legal_edges() {
        let metrics = Arc::new(RecordingMetrics::new());
        let lc = TaskLifecycle::new(metrics.clone(), Arc::new(ManualClock::default()));
        let mut t = task();
        lc.advance_to(&mut t, TaskStatus::Completed).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(
            metrics.counter_total("status_machine.transition.success"),
            4.0
        );
        let err = lc.advance_to(&mut t, TaskStatus::Pending).unwrap_err();
        assert!(matches!(err, MeshError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_update_bumps_version_by_one() {
        let (lc, _) = lifecycle_with_clock();
        let repo = InMemoryRepository::new();
        let t = task();
        repo.create_task(&t).await.unwrap();

        let updated = lc
            .update(&repo, t.id, 3, |lc, task| {
                lc.assign(task, "agent-1")?;
                Ok(true)
            })
            .await
            .unwrap();
        assert_eq!(updated.version, t.version + 1);
        assert_eq!(repo.load_task(t.id).await.unwrap().version, t.version + 1);
    }

    #[tokio::test]
    async fn test_update_without_change_does_not_write() {
        let (lc, _) = lifecycle_with_clock();
        let repo = InMemoryRepository::new();
        let t = task();
        repo.create_task(&t).await.unwrap();
        let same = lc.update(&repo, t.id, 3, |_, _| Ok(false)).await.unwrap();
        assert_eq!(same.version, t.version);
    }
}
