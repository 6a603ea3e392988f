use crate::aggregation::ResultAggregator;
use crate::delegation::DelegationTracker;
use crate::distributed::{CoordinationMode, DistributedTask, ExecutionPlan, PlanActions, SyncTimeout};
use crate::events::{DomainEvent, EventSink};
use crate::lifecycle::TaskLifecycle;
use crate::repository::Repository;
use crate::types::{DelegationType, Task, TaskEvent, TaskEventType};
use meshflow_core::{Clock, CoordinatorConfig, MeshError, MeshResult, MetricsSink, TaskStatus};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Splits work across agents and folds their results back together.
///
/// The coordinator has no thread of its own. It reacts to [`TaskEvent`]s via
/// [`handle_event`](Self::handle_event) and to a periodic
/// [`check_timeouts`](Self::check_timeouts) call. Every write to a task or a
/// distributed task is a version-guarded compare-and-swap that is reloaded
/// and reapplied on conflict, so concurrent delivery needs no lock.
pub struct DistributedTaskCoordinator {
    repo: Arc<dyn Repository>,
    lifecycle: TaskLifecycle,
    delegation: DelegationTracker,
    aggregator: ResultAggregator,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

impl DistributedTaskCoordinator {
    pub fn new(
        repo: Arc<dyn Repository>,
        metrics: Arc<dyn MetricsSink>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        let lifecycle = TaskLifecycle::new(metrics.clone(), clock.clone());
        let delegation = DelegationTracker::new(
            repo.clone(),
            lifecycle.clone(),
            events.clone(),
            metrics.clone(),
            clock.clone(),
            config.max_conflict_retries,
        );
        Self {
            repo,
            lifecycle,
            delegation,
            aggregator: ResultAggregator,
            events,
            metrics,
            clock,
            config,
        }
    }

    pub fn lifecycle(&self) -> &TaskLifecycle {
        &self.lifecycle
    }

    pub fn delegation(&self) -> &DelegationTracker {
        &self.delegation
    }

    pub async fn get(&self, id: Uuid) -> MeshResult<DistributedTask> {
        self.repo.load_distributed(id).await
    }

    /// Partition the input over `agents`, then [`submit`](Self::submit).
    pub async fn submit_partitioned(
        &self,
        mut dt: DistributedTask,
        agents: &[String],
    ) -> MeshResult<DistributedTask> {
        dt.partition_across(agents)?;
        self.submit(dt).await
    }

    /// Create the main task, one task per subtask, and start the plan.
    pub async fn submit(&self, mut dt: DistributedTask) -> MeshResult<DistributedTask> {
        dt.set_defaults();
        dt.validate()?;
        if dt.subtasks.is_empty() {
            return Err(MeshError::InvalidConfig(
                "a distributed task needs at least one subtask".to_string(),
            ));
        }
        let ids: Vec<Uuid> = dt.subtasks.iter().map(|s| s.id).collect();
        if ids.iter().collect::<HashSet<_>>().len() != ids.len() {
            return Err(MeshError::InvalidConfig("duplicate subtask id".to_string()));
        }
        let mode = dt.coordination_mode.unwrap_or(CoordinationMode::Parallel);
        let plan = match dt.execution_plan.take() {
            Some(plan) => plan,
            None => ExecutionPlan::for_mode(mode, &dt.subtasks, self.config.default_max_retries),
        };
        plan.validate(&ids)?;

        if dt.created_by.is_empty() {
            dt.created_by = self.config.coordinator_id.clone();
        }
        let priority = dt.priority.unwrap_or_default();
        let now = self.clock.now();

        let mut main = Task::new(dt.tenant_id, dt.task_type.as_str(), dt.title.as_str(), dt.created_by.as_str())
            .with_id(dt.id)
            .with_priority(priority)
            .with_description(dt.description.as_str())
            .with_parameters(json!({
                "coordination_mode": mode,
                "completion_mode": dt.completion_mode,
                "subtasks": ids.len(),
            }));
        self.lifecycle.assign(&mut main, &self.config.coordinator_id)?;
        self.lifecycle.advance_to(&mut main, TaskStatus::InProgress)?;
        self.repo.create_task(&main).await?;
        self.events.publish(DomainEvent::TaskCreated {
            task_id: main.id,
            tenant_id: main.tenant_id,
            task_type: main.task_type.clone(),
            created_by: main.created_by.clone(),
            at: now,
        });

        for sub in &dt.subtasks {
            let max_retry = plan
                .phase_of(sub.id)
                .and_then(|i| plan.phases.get(i))
                .map_or(self.config.default_max_retries, |p| p.max_retry);
            let title = if sub.description.is_empty() {
                dt.title.clone()
            } else {
                sub.description.clone()
            };
            let task = Task::new(dt.tenant_id, dt.task_type.as_str(), title, self.config.coordinator_id.as_str())
                .with_id(sub.id)
                .with_parent(dt.id)
                .with_priority(priority)
                .with_description(sub.description.as_str())
                .with_parameters(sub.parameters.clone())
                .with_max_retries(max_retry)
                .with_timeout(sub.timeout_seconds.unwrap_or(self.config.default_subtask_timeout_secs));
            self.repo.create_task(&task).await?;
            self.events.publish(DomainEvent::SubtaskCreated {
                task_id: task.id,
                parent_task_id: dt.id,
                agent_id: sub.agent_id.clone(),
                at: now,
            });
            debug!(task_id = %task.id, parent = %dt.id, agent = ?sub.agent_id, "subtask created");
        }

        dt.subtask_ids = ids;
        dt.execution_plan = Some(plan);
        self.advance_status(&mut dt, TaskStatus::InProgress)?;
        dt.started_at = Some(now);
        dt.progress.total_steps = u32::try_from(dt.subtask_ids.len()).unwrap_or(u32::MAX);
        dt.progress.eta = dt.estimated_completion();
        dt.resource_usage.agents_used = u32::try_from(
            dt.subtasks
                .iter()
                .filter_map(|s| s.agent_id.as_deref())
                .collect::<BTreeSet<_>>()
                .len(),
        )
        .unwrap_or(u32::MAX);
        self.repo.create_distributed(&dt).await?;

        self.metrics.increment_counter(
            "distributed_task.submitted",
            1.0,
            &[("mode", mode.to_string().as_str())],
        );
        info!(
            task_id = %dt.id,
            mode = %mode,
            subtasks = dt.subtask_ids.len(),
            "distributed task submitted"
        );
        self.drive(dt.id).await
    }

    /// Apply one agent report to its subtask and to the owning distributed task.
    ///
    /// An event whose id was already handled is ignored, so redelivery never
    /// spends a second retry or counts a result twice.
    pub async fn handle_event(&self, event: TaskEvent) -> MeshResult<DistributedTask> {
        let task = self.repo.load_task(event.task_id).await?;
        let parent = task.parent_task_id.ok_or_else(|| {
            MeshError::InvalidConfig(format!("task {} is not a subtask", task.id))
        })?;
        if !self.repo.append_event(&event).await? {
            self.metrics.increment_counter("task_event.duplicate", 1.0, &[]);
            debug!(task_id = %task.id, event_id = %event.id, "duplicate event ignored");
            return self.repo.load_distributed(parent).await;
        }
        let dt = self.repo.load_distributed(parent).await?;
        if !dt.subtask_ids.contains(&task.id) {
            debug!(task_id = %task.id, parent = %parent, "event for a replaced subtask ignored");
            return Ok(dt);
        }
        if dt.is_terminal() {
            debug!(task_id = %task.id, parent = %parent, status = %dt.status, "event for a finished distributed task ignored");
            return Ok(dt);
        }

        let retries = self.config.max_conflict_retries;
        let agent = event.agent_id.as_str();
        match event.event_type {
            TaskEventType::Accepted => {
                self.lifecycle
                    .update(self.repo.as_ref(), task.id, retries, |lc, t| {
                        if t.status != TaskStatus::Assigned {
                            return Ok(false);
                        }
                        lc.accept(t)?;
                        Ok(true)
                    })
                    .await?;
                Ok(dt)
            }
            TaskEventType::Rejected => {
                let reason = payload_text(&event.payload, "reason");
                self.lifecycle
                    .update(self.repo.as_ref(), task.id, retries, |lc, t| {
                        if t.status != TaskStatus::Assigned {
                            return Ok(false);
                        }
                        lc.reject(t, &reason)?;
                        Ok(true)
                    })
                    .await?;
                warn!(task_id = %task.id, agent, reason = %reason, "subtask rejected");
                Ok(dt)
            }
            TaskEventType::Started => {
                self.lifecycle
                    .update(self.repo.as_ref(), task.id, retries, |lc, t| {
                        if lc.is_terminal(t) || t.status == TaskStatus::InProgress {
                            return Ok(false);
                        }
                        if t.assigned_to.is_none() {
                            t.assigned_to = Some(agent.to_string());
                        }
                        lc.advance_to(t, TaskStatus::InProgress)?;
                        Ok(true)
                    })
                    .await?;
                Ok(dt)
            }
            TaskEventType::Progress => {
                let cpu = event.payload.get("cpu_seconds").and_then(Value::as_f64);
                let memory = event.payload.get("memory_mb").and_then(Value::as_f64);
                debug!(task_id = %task.id, agent, "subtask progress");
                if cpu.is_none() && memory.is_none() {
                    return Ok(dt);
                }
                let (dt, ()) = self
                    .update_distributed(parent, |dt, _| {
                        if let Some(cpu) = cpu {
                            dt.resource_usage.cpu_seconds += cpu;
                        }
                        if let Some(memory) = memory {
                            dt.resource_usage.memory_mb = dt.resource_usage.memory_mb.max(memory);
                        }
                        Ok(())
                    })
                    .await?;
                Ok(dt)
            }
            TaskEventType::Completed => {
                let stored = self
                    .lifecycle
                    .update(self.repo.as_ref(), task.id, retries, |lc, t| {
                        if lc.is_terminal(t) {
                            return Ok(false);
                        }
                        if t.assigned_to.is_none() {
                            t.assigned_to = Some(agent.to_string());
                        }
                        lc.advance_to(t, TaskStatus::InProgress)?;
                        lc.complete(t, event.payload.clone())?;
                        Ok(true)
                    })
                    .await?;
                if stored.status != TaskStatus::Completed {
                    debug!(task_id = %task.id, status = %stored.status, "late result for a finished subtask ignored");
                    return self.drive(parent).await;
                }
                let result = stored.result.clone().unwrap_or(Value::Null);
                let received_at = event.timestamp;
                let (_, counted) = self
                    .update_distributed(parent, |dt, _| {
                        if dt.is_terminal() {
                            return Ok(false);
                        }
                        Ok(dt.record_result(stored.id, agent, result.clone(), received_at))
                    })
                    .await?;
                if counted {
                    self.metrics
                        .increment_counter("distributed_task.result_collected", 1.0, &[]);
                    info!(task_id = %parent, subtask = %task.id, agent, "subtask result collected");
                }
                self.drive(parent).await
            }
            TaskEventType::Failed => {
                let error = payload_text(&event.payload, "error");
                let fallback_agent = dt
                    .subtasks
                    .iter()
                    .find(|s| s.id == task.id)
                    .and_then(|s| s.agent_id.clone());
                self.lifecycle
                    .update(self.repo.as_ref(), task.id, retries, |lc, t| {
                        if lc.is_terminal(t) {
                            return Ok(false);
                        }
                        let retry_agent = t
                            .assigned_to
                            .clone()
                            .or_else(|| fallback_agent.clone())
                            .unwrap_or_else(|| agent.to_string());
                        lc.advance_to(t, TaskStatus::InProgress)?;
                        if lc.fail_attempt(t, &error)? {
                            lc.assign(t, &retry_agent)?;
                        }
                        Ok(true)
                    })
                    .await?;
                self.drive(parent).await
            }
            TaskEventType::LeaderElected => {
                let (dt, elected) = self
                    .update_distributed(parent, |dt, _| {
                        if dt.coordination_mode != Some(CoordinationMode::LeaderElect)
                            || dt.leader_agent.is_some()
                        {
                            return Ok(false);
                        }
                        dt.leader_agent = Some(agent.to_string());
                        Ok(true)
                    })
                    .await?;
                if elected {
                    info!(task_id = %parent, leader = agent, "leader recorded");
                }
                Ok(dt)
            }
        }
    }

    /// Run the clock-driven checks on every active distributed task.
    pub async fn check_timeouts(&self) -> MeshResult<Vec<DistributedTask>> {
        let mut touched = Vec::new();
        for id in self.repo.list_active_distributed().await? {
            touched.push(self.check_timeouts_for(id).await?);
        }
        Ok(touched)
    }

    /// Time out overdue subtasks and apply any expired sync-point policy.
    pub async fn check_timeouts_for(&self, id: Uuid) -> MeshResult<DistributedTask> {
        let dt = self.repo.load_distributed(id).await?;
        if dt.is_terminal() {
            return Ok(dt);
        }
        let now = self.clock.now();
        for task in self.repo.list_subtasks(id).await? {
            if !dt.subtask_ids.contains(&task.id) || !self.lifecycle.is_overdue(&task, now) {
                continue;
            }
            self.lifecycle
                .update(self.repo.as_ref(), task.id, self.config.max_conflict_retries, |lc, t| {
                    if !lc.is_overdue(t, now) {
                        return Ok(false);
                    }
                    lc.mark_timeout(t)?;
                    Ok(true)
                })
                .await?;
            warn!(task_id = %task.id, parent = %id, "subtask timed out");
        }

        let default_timeout = self.config.default_sync_timeout_secs;
        let (dt, outcome) = self
            .update_distributed(id, |dt, tasks| {
                if dt.is_terminal() {
                    return Ok(SyncTimeout::NotDue);
                }
                Ok(dt.check_sync_timeout(tasks, now, default_timeout))
            })
            .await?;
        match outcome {
            SyncTimeout::NotDue => {}
            SyncTimeout::Continued(name) => {
                warn!(task_id = %id, sync_point = %name, "sync point timed out, continuing");
            }
            SyncTimeout::Retried(actions) => {
                warn!(
                    task_id = %id,
                    retry = dt.plan_state.sync_retries,
                    reissued = actions.reissue.len() + actions.replace.len(),
                    "sync point timed out, re-issuing unmet subtasks"
                );
                self.apply_actions(&dt, &actions).await?;
            }
            SyncTimeout::Failed(reason) => {
                warn!(task_id = %id, reason = %reason, "sync point timed out, failing");
                return self.fail(id, &reason).await;
            }
        }
        self.drive(id).await
    }

    /// Cancel the distributed task, its main task, and every unfinished subtask.
    pub async fn cancel(&self, id: Uuid, reason: &str) -> MeshResult<DistributedTask> {
        let now = self.clock.now();
        let (dt, ()) = self
            .update_distributed(id, |dt, _| {
                if dt.is_terminal() {
                    return Err(MeshError::InvalidTransition {
                        kind: "task",
                        from: dt.status.to_string(),
                        to: TaskStatus::Cancelled.to_string(),
                    });
                }
                self.advance_status(dt, TaskStatus::Cancelled)?;
                dt.completed_at = Some(now);
                dt.error = Some(reason.to_string());
                Ok(())
            })
            .await?;
        self.close_main_task(id, |lc, t| lc.cancel(t, reason)).await?;
        self.cancel_open_subtasks(&dt, reason).await?;
        self.metrics.increment_counter("distributed_task.cancelled", 1.0, &[]);
        info!(task_id = %id, reason, "distributed task cancelled");
        Ok(dt)
    }

    /// Move a subtask to another agent.
    pub async fn reassign_subtask(
        &self,
        subtask_id: Uuid,
        to_agent: &str,
        delegation_type: DelegationType,
        reason: &str,
    ) -> MeshResult<Task> {
        let task = self.repo.load_task(subtask_id).await?;
        let parent = task.parent_task_id.ok_or_else(|| {
            MeshError::InvalidConfig(format!("task {subtask_id} is not a subtask"))
        })?;
        let moved = match task.assigned_to.as_deref() {
            Some(from) => {
                self.delegation
                    .hand_off(subtask_id, from, to_agent, delegation_type, reason)
                    .await?
                    .0
            }
            None => {
                self.lifecycle
                    .update(self.repo.as_ref(), subtask_id, self.config.max_conflict_retries, |lc, t| {
                        if lc.is_terminal(t) {
                            return Err(MeshError::Delegation(format!(
                                "cannot reassign task {} in terminal status {}",
                                t.id, t.status
                            )));
                        }
                        lc.assign(t, to_agent)?;
                        Ok(true)
                    })
                    .await?
            }
        };
        self.update_distributed(parent, |dt, _| {
            if let Some(sub) = dt.subtasks.iter_mut().find(|s| s.id == subtask_id) {
                sub.agent_id = Some(to_agent.to_string());
            }
            Ok(())
        })
        .await?;
        Ok(moved)
    }

    /// Advance the plan until it stops producing work, then settle.
    async fn drive(&self, id: Uuid) -> MeshResult<DistributedTask> {
        let mut rounds = 0usize;
        loop {
            rounds += 1;
            let now = self.clock.now();
            let (dt, actions) = self
                .update_distributed(id, |dt, tasks| {
                    if dt.is_terminal() {
                        return Ok(PlanActions::default());
                    }
                    Ok(dt.advance_plan(tasks, now))
                })
                .await?;
            if dt.is_terminal() {
                return Ok(dt);
            }
            if actions.is_empty() {
                return self.settle(dt).await;
            }
            self.check_plan_rounds(id, rounds, plan_round_limit(dt.subtask_ids.len()))?;
            self.apply_actions(&dt, &actions).await?;
        }
    }

    /// A plan that still produces work after `limit` rounds is malformed.
    fn check_plan_rounds(&self, id: Uuid, rounds: usize, limit: usize) -> MeshResult<()> {
        if rounds <= limit {
            return Ok(());
        }
        self.metrics.increment_counter("distributed_task.plan_unsettled", 1.0, &[]);
        error!(task_id = %id, rounds, "plan did not settle");
        Err(MeshError::InvalidConfig(format!(
            "execution plan of distributed task {id} did not settle after {rounds} rounds"
        )))
    }

    /// Finish the distributed task when its completion policy is met, or fail
    /// it when every subtask is done and the policy can no longer be met.
    async fn settle(&self, dt: DistributedTask) -> MeshResult<DistributedTask> {
        if dt.is_terminal() {
            return Ok(dt);
        }
        if dt.is_complete() {
            return self.finalize(dt.id).await;
        }
        let statuses: HashMap<Uuid, TaskStatus> = self
            .repo
            .list_subtasks(dt.id)
            .await?
            .into_iter()
            .map(|t| (t.id, t.status))
            .collect();
        let all_done = dt.subtask_ids.iter().all(|id| {
            statuses
                .get(id)
                .is_some_and(|s| self.lifecycle.machine().is_terminal(*s))
        });
        if all_done {
            return self
                .fail(
                    dt.id,
                    "all subtasks finished without meeting the completion policy",
                )
                .await;
        }
        Ok(dt)
    }

    async fn finalize(&self, id: Uuid) -> MeshResult<DistributedTask> {
        let now = self.clock.now();
        let (dt, finished) = self
            .update_distributed(id, |dt, _| {
                if dt.is_terminal() || !dt.is_complete() {
                    return Ok(false);
                }
                dt.final_result = Some(
                    self.aggregator
                        .aggregate(&dt.aggregation, &dt.intermediate_results),
                );
                self.advance_status(dt, TaskStatus::Completed)?;
                dt.completed_at = Some(now);
                dt.progress.current_step = None;
                Ok(true)
            })
            .await?;
        if !finished {
            return Ok(dt);
        }

        let result = dt.final_result.clone().unwrap_or(Value::Null);
        self.close_main_task(id, |lc, t| lc.complete(t, result.clone()))
            .await?;
        if self.config.cancel_outstanding_on_completion {
            self.cancel_open_subtasks(&dt, "completion policy met").await?;
        }
        self.events.publish(DomainEvent::DistributedTaskCompleted {
            task_id: id,
            results_collected: dt.results_collected,
            at: now,
        });
        self.metrics
            .increment_counter("distributed_task.completed", 1.0, &[]);
        if let Some(started) = dt.started_at {
            self.metrics.record_timing(
                "distributed_task.duration",
                (now - started).to_std().unwrap_or_default(),
                &[],
            );
        }
        info!(task_id = %id, results = dt.results_collected, "distributed task completed");
        Ok(dt)
    }

    async fn fail(&self, id: Uuid, reason: &str) -> MeshResult<DistributedTask> {
        let now = self.clock.now();
        let (dt, failed) = self
            .update_distributed(id, |dt, _| {
                if dt.is_terminal() {
                    return Ok(false);
                }
                self.advance_status(dt, TaskStatus::Failed)?;
                dt.completed_at = Some(now);
                dt.error = Some(reason.to_string());
                Ok(true)
            })
            .await?;
        if !failed {
            return Ok(dt);
        }
        self.close_main_task(id, |lc, t| {
            lc.advance_to(t, TaskStatus::Failed)?;
            t.error = Some(reason.to_string());
            Ok(())
        })
        .await?;
        self.cancel_open_subtasks(&dt, reason).await?;
        self.events.publish(DomainEvent::DistributedTaskFailed {
            task_id: id,
            reason: reason.to_string(),
            at: now,
        });
        self.metrics.increment_counter("distributed_task.failed", 1.0, &[]);
        warn!(task_id = %id, reason, "distributed task failed");
        Ok(dt)
    }

    /// Carry the outcome over to the backing main task.
    async fn close_main_task<F>(&self, id: Uuid, mut close: F) -> MeshResult<()>
    where
        F: FnMut(&TaskLifecycle, &mut Task) -> MeshResult<()> + Send,
    {
        self.lifecycle
            .update(self.repo.as_ref(), id, self.config.max_conflict_retries, |lc, t| {
                if lc.is_terminal(t) {
                    return Ok(false);
                }
                close(lc, t)?;
                Ok(true)
            })
            .await?;
        Ok(())
    }

    async fn cancel_open_subtasks(&self, dt: &DistributedTask, reason: &str) -> MeshResult<()> {
        for id in &dt.subtask_ids {
            self.cancel_subtask(*id, reason).await?;
        }
        Ok(())
    }

    async fn cancel_subtask(&self, id: Uuid, reason: &str) -> MeshResult<()> {
        self.lifecycle
            .update(self.repo.as_ref(), id, self.config.max_conflict_retries, |lc, t| {
                if lc.is_terminal(t) {
                    return Ok(false);
                }
                lc.cancel(t, reason)?;
                Ok(true)
            })
            .await?;
        Ok(())
    }

    async fn apply_actions(&self, dt: &DistributedTask, actions: &PlanActions) -> MeshResult<()> {
        let retries = self.config.max_conflict_retries;
        let agent_of = |id: Uuid| {
            dt.subtasks
                .iter()
                .find(|s| s.id == id)
                .and_then(|s| s.agent_id.clone())
        };

        for order in &actions.issue {
            self.lifecycle
                .update(self.repo.as_ref(), order.task_id, retries, |lc, t| {
                    if t.status != TaskStatus::Pending {
                        return Ok(false);
                    }
                    let mut changed = false;
                    if let Some(input) = &order.input {
                        t.parameters = with_input(&t.parameters, input.clone());
                        changed = true;
                    }
                    if let Some(agent) = &order.agent_id {
                        lc.assign(t, agent)?;
                        changed = true;
                    }
                    Ok(changed)
                })
                .await?;
            debug!(task_id = %order.task_id, agent = ?order.agent_id, "subtask issued");
        }

        for id in &actions.cancel {
            self.cancel_subtask(*id, "upstream pipeline stage did not complete")
                .await?;
        }

        for id in &actions.reissue {
            let fallback = agent_of(*id);
            self.lifecycle
                .update(self.repo.as_ref(), *id, retries, |lc, t| {
                    if lc.is_terminal(t) {
                        return Ok(false);
                    }
                    let Some(agent) = t.assigned_to.clone().or_else(|| fallback.clone()) else {
                        return Ok(false);
                    };
                    t.retry_count += 1;
                    t.started_at = None;
                    lc.assign(t, &agent)?;
                    Ok(true)
                })
                .await?;
            info!(task_id = %id, parent = %dt.id, "subtask re-issued");
        }

        for (old, new) in &actions.replace {
            let previous = self.repo.load_task(*old).await?;
            let mut fresh = Task::new(
                previous.tenant_id,
                previous.task_type.as_str(),
                previous.title.as_str(),
                previous.created_by.as_str(),
            )
            .with_id(*new)
            .with_parent(dt.id)
            .with_priority(previous.priority)
            .with_description(previous.description.as_str())
            .with_parameters(previous.parameters.clone())
            .with_max_retries(previous.max_retries)
            .with_timeout(previous.timeout_seconds);
            fresh.retry_count = previous.retry_count + 1;
            if let Some(agent) = agent_of(*new).or_else(|| previous.assigned_to.clone()) {
                self.lifecycle.assign(&mut fresh, &agent)?;
            }
            self.repo.create_task(&fresh).await?;
            self.events.publish(DomainEvent::SubtaskCreated {
                task_id: fresh.id,
                parent_task_id: dt.id,
                agent_id: fresh.assigned_to.clone(),
                at: self.clock.now(),
            });
            info!(old = %old, new = %new, parent = %dt.id, "subtask replaced");
        }
        Ok(())
    }

    fn advance_status(&self, dt: &mut DistributedTask, target: TaskStatus) -> MeshResult<()> {
        let machine = self.lifecycle.machine();
        let path = machine
            .path(dt.status, target)
            .ok_or_else(|| MeshError::InvalidTransition {
                kind: "task",
                from: dt.status.to_string(),
                to: target.to_string(),
            })?;
        for next in path {
            dt.status = machine.transition_to(dt.status, next, self.metrics.as_ref())?;
        }
        Ok(())
    }

    /// Load-mutate-save a distributed task under version CAS, reloading and
    /// reapplying `mutate` on conflict. Nothing is written when `mutate`
    /// leaves the record unchanged.
    async fn update_distributed<R, F>(&self, id: Uuid, mut mutate: F) -> MeshResult<(DistributedTask, R)>
    where
        F: FnMut(&mut DistributedTask, &HashMap<Uuid, Task>) -> MeshResult<R> + Send,
        R: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut dt = self.repo.load_distributed(id).await?;
            let tasks: HashMap<Uuid, Task> = self
                .repo
                .list_subtasks(id)
                .await?
                .into_iter()
                .map(|t| (t.id, t))
                .collect();
            let before = dt.clone();
            let out = mutate(&mut dt, &tasks)?;
            if dt == before {
                return Ok((dt, out));
            }
            let expected = dt.version;
            match self.repo.save_distributed(&dt, expected).await {
                Ok(version) => {
                    dt.version = version;
                    return Ok((dt, out));
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_conflict_retries => {
                    self.metrics
                        .increment_counter("distributed_task.update.conflict", 1.0, &[]);
                    debug!(task_id = %id, attempt, "distributed task version conflict, reloading");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Upper bound on plan rounds per drive. A round that does not settle has
/// issued or cancelled at least one subtask.
fn plan_round_limit(subtasks: usize) -> usize {
    subtasks * 2 + 8
}

/// Merge upstream output into a subtask's parameters under `input`.
fn with_input(parameters: &Value, input: Value) -> Value {
    match parameters {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("input".to_string(), input);
            Value::Object(map)
        }
        Value::Null => json!({ "input": input }),
        other => json!({ "parameters": other, "input": input }),
    }
}

fn payload_text(payload: &Value, key: &str) -> String {
    match payload.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None if payload.is_null() => "unspecified".to_string(),
        None => payload.to_string(),
    }
}
