use crate::events::{DomainEvent, EventSink};
use crate::lifecycle::TaskLifecycle;
use crate::repository::Repository;
use crate::types::{DelegationType, Task, TaskDelegation};
use meshflow_core::{Clock, MeshError, MeshResult, MetricsSink};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Records the chain of hand-offs a task goes through.
pub struct DelegationTracker {
    repo: Arc<dyn Repository>,
    lifecycle: TaskLifecycle,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    max_conflict_retries: u32,
}

impl DelegationTracker {
    pub fn new(
        repo: Arc<dyn Repository>,
        lifecycle: TaskLifecycle,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            repo,
            lifecycle,
            events,
            metrics,
            clock,
            max_conflict_retries,
        }
    }

    /// Check that `task` may move from `from_agent` to `to_agent`.
    pub fn validate(&self, task: &Task, from_agent: &str, to_agent: &str) -> MeshResult<()> {
        if self.lifecycle.is_terminal(task) {
            return Err(MeshError::Delegation(format!(
                "cannot delegate task {} in terminal status {}",
                task.id, task.status
            )));
        }
        if from_agent.is_empty() || to_agent.is_empty() {
            return Err(MeshError::Delegation(
                "from_agent and to_agent are required".to_string(),
            ));
        }
        if from_agent == to_agent {
            return Err(MeshError::Delegation(
                "cannot delegate a task to the same agent".to_string(),
            ));
        }
        if task.assigned_to.as_deref() != Some(from_agent) {
            return Err(MeshError::Delegation(format!(
                "task {} is not assigned to {from_agent}",
                task.id
            )));
        }
        Ok(())
    }

    /// Append one delegation record. `task.assigned_to` is left alone; see
    /// [`hand_off`](Self::hand_off) for the combined operation.
    pub async fn delegate(
        &self,
        task: &Task,
        from_agent: &str,
        to_agent: &str,
        delegation_type: DelegationType,
        reason: &str,
    ) -> MeshResult<TaskDelegation> {
        self.validate(task, from_agent, to_agent)?;
        let record = TaskDelegation {
            id: Uuid::new_v4(),
            task_id: task.id,
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            delegation_type,
            reason: reason.to_string(),
            delegated_at: self.clock.now(),
        };
        self.repo.append_delegation(&record).await?;
        self.metrics.increment_counter(
            "delegation.created",
            1.0,
            &[("type", delegation_type.to_string().as_str())],
        );
        Ok(record)
    }

    /// Reassign a task and record the hop.
    ///
    /// The reassignment is a version-guarded write; the record is appended
    /// only once that write lands, then `TaskDelegated` is published.
    pub async fn hand_off(
        &self,
        task_id: Uuid,
        from_agent: &str,
        to_agent: &str,
        delegation_type: DelegationType,
        reason: &str,
    ) -> MeshResult<(Task, TaskDelegation)> {
        let task = self
            .lifecycle
            .update(
                self.repo.as_ref(),
                task_id,
                self.max_conflict_retries,
                |lc, task| {
                    self.validate(task, from_agent, to_agent)?;
                    lc.reassign(task, to_agent)?;
                    Ok(true)
                },
            )
            .await?;

        let record = TaskDelegation {
            id: Uuid::new_v4(),
            task_id,
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            delegation_type,
            reason: reason.to_string(),
            delegated_at: self.clock.now(),
        };
        self.repo.append_delegation(&record).await?;
        self.metrics.increment_counter(
            "delegation.created",
            1.0,
            &[("type", delegation_type.to_string().as_str())],
        );
        info!(
            task_id = %task_id,
            from = from_agent,
            to = to_agent,
            kind = %delegation_type,
            "task delegated"
        );
        self.events.publish(DomainEvent::TaskDelegated {
            task_id,
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            delegation_type,
            reason: reason.to_string(),
            at: record.delegated_at,
        });
        Ok((task, record))
    }

    /// Every hop of `task_id`, oldest first.
    pub async fn chain(&self, task_id: Uuid) -> MeshResult<Vec<TaskDelegation>> {
        self.repo.delegations_for(task_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::repository::InMemoryRepository;
    use chrono::Duration;
    use meshflow_core::{ManualClock, NoopMetrics, TaskStatus};

    struct Fixture {
        tracker: DelegationTracker,
        repo: Arc<InMemoryRepository>,
        events: Arc<MemoryEventSink>,
        clock: Arc<ManualClock>,
        lifecycle: TaskLifecycle,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let events = Arc::new(MemoryEventSink::new());
        let clock = Arc::new(ManualClock::default());
        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        let lifecycle = TaskLifecycle::new(metrics.clone(), clock.clone());
        let tracker = DelegationTracker::new(
            repo.clone(),
            lifecycle.clone(),
            events.clone(),
            metrics,
            clock.clone(),
            3,
        );
        Fixture {
            tracker,
            repo,
            events,
            clock,
            lifecycle,
        }
    }

    async fn assigned_task(f: &Fixture, agent: &str) -> Task {
        let mut task = Task::new(Uuid::new_v4(), "scan", "Scan", "planner");
        f.lifecycle.assign(&mut task, agent).unwrap();
        f.repo.create_task(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_delegate_does_not_touch_assignee() {
        let f = fixture();
        let task = assigned_task(&f, "a").await;
        let record = f
            .tracker
            .delegate(&task, "a", "b", DelegationType::Manual, "shift change")
            .await
            .unwrap();
        assert_eq!(record.to_agent, "b");
        let stored = f.repo.load_task(task.id).await.unwrap();
        assert_eq!(stored.assigned_to.as_deref(), Some("a"));
        assert_eq!(stored.version, task.version);
    }

    #[tokio::test]
    async fn test_validation_rules() {
        let f = fixture();
        let task = assigned_task(&f, "a").await;
        for (from, to) in [("", "b"), ("a", ""), ("a", "a"), ("c", "b")] {
            let err = f
                .tracker
                .delegate(&task, from, to, DelegationType::Manual, "x")
                .await
                .unwrap_err();
            assert!(matches!(err, MeshError::Delegation(_)), "{from}->{to}");
        }
        let mut done = task.clone();
        done.status = TaskStatus::Completed;
        assert!(f
            .tracker
            .delegate(&done, "a", "b", DelegationType::Manual, "x")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_hand_off_reassigns_and_records_chain() {
        let f = fixture();
        let task = assigned_task(&f, "a").await;

        let (moved, _) = f
            .tracker
            .hand_off(task.id, "a", "b", DelegationType::LoadBalance, "a is hot")
            .await
            .unwrap();
        assert_eq!(moved.assigned_to.as_deref(), Some("b"));
        assert_eq!(moved.status, TaskStatus::Assigned);
        assert_eq!(moved.version, task.version + 1);

        f.clock.advance(Duration::seconds(5));
        f.tracker
            .hand_off(task.id, "b", "c", DelegationType::Failover, "b went dark")
            .await
            .unwrap();

        let chain = f.tracker.chain(task.id).await.unwrap();
        let hops: Vec<_> = chain
            .iter()
            .map(|d| (d.from_agent.as_str(), d.to_agent.as_str()))
            .collect();
        assert_eq!(hops, vec![("a", "b"), ("b", "c")]);
        assert_eq!(f.events.count("task_delegated"), 2);
    }

    #[tokio::test]
    async fn test_hand_off_from_wrong_agent_writes_nothing() {
        let f = fixture();
        let task = assigned_task(&f, "a").await;
        assert!(f
            .tracker
            .hand_off(task.id, "z", "b", DelegationType::Manual, "x")
            .await
            .is_err());
        assert!(f.tracker.chain(task.id).await.unwrap().is_empty());
        assert_eq!(f.repo.load_task(task.id).await.unwrap().version, task.version);
        assert_eq!(f.events.count("task_delegated"), 0);
    }
}
