use crate::distributed::DistributedTask;
use crate::types::{Task, TaskDelegation, TaskEvent};
use crate::workflow::{Workflow, WorkflowExecution};
use async_trait::async_trait;
use meshflow_core::{MeshError, MeshResult, TaskStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Persistence contract the orchestration core writes through.
///
/// Every `save_*` is a compare-and-swap on `version`: the write succeeds only
/// when the stored version equals `expected_version`, stores the entity with
/// `expected_version + 1`, and returns that new version. A stale write fails
/// with [`MeshError::OptimisticLockConflict`] and leaves the stored value
/// unchanged.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_task(&self, id: Uuid) -> MeshResult<Task>;
    async fn create_task(&self, task: &Task) -> MeshResult<()>;
    async fn save_task(&self, task: &Task, expected_version: i64) -> MeshResult<i64>;
    /// Children of `parent`, oldest first.
    async fn list_subtasks(&self, parent: Uuid) -> MeshResult<Vec<Task>>;

    async fn append_delegation(&self, delegation: &TaskDelegation) -> MeshResult<()>;
    /// The delegation chain of a task, ascending by `delegated_at`.
    async fn delegations_for(&self, task_id: Uuid) -> MeshResult<Vec<TaskDelegation>>;

    async fn load_workflow(&self, id: Uuid) -> MeshResult<Workflow>;
    async fn create_workflow(&self, workflow: &Workflow) -> MeshResult<()>;
    async fn save_workflow(&self, workflow: &Workflow, expected_version: i64) -> MeshResult<i64>;

    async fn load_execution(&self, id: Uuid) -> MeshResult<WorkflowExecution>;
    async fn create_execution(&self, execution: &WorkflowExecution) -> MeshResult<()>;
    async fn save_execution(
        &self,
        execution: &WorkflowExecution,
        expected_version: i64,
    ) -> MeshResult<i64>;

    async fn load_distributed(&self, id: Uuid) -> MeshResult<DistributedTask>;
    async fn create_distributed(&self, task: &DistributedTask) -> MeshResult<()>;
    async fn save_distributed(
        &self,
        task: &DistributedTask,
        expected_version: i64,
    ) -> MeshResult<i64>;
    /// Ids of distributed tasks whose status is not terminal.
    async fn list_active_distributed(&self) -> MeshResult<Vec<Uuid>>;

    /// Record an event. Returns `false`, storing nothing, when an event with
    /// the same id is already recorded.
    async fn append_event(&self, event: &TaskEvent) -> MeshResult<bool>;
    async fn events_for(&self, task_id: Uuid) -> MeshResult<Vec<TaskEvent>>;
}

/// Entities stored under version CAS.
pub trait Versioned: Clone {
    const ENTITY: &'static str;
    fn entity_id(&self) -> Uuid;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);
}

impl Versioned for Task {
    const ENTITY: &'static str = "task";
    fn entity_id(&self) -> Uuid {
        self.id
    }
    fn version(&self) -> i64 {
        self.version
    }
    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

impl Versioned for Workflow {
    const ENTITY: &'static str = "workflow";
    fn entity_id(&self) -> Uuid {
        self.id
    }
    fn version(&self) -> i64 {
        self.version
    }
    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

impl Versioned for WorkflowExecution {
    const ENTITY: &'static str = "workflow_execution";
    fn entity_id(&self) -> Uuid {
        self.id
    }
    fn version(&self) -> i64 {
        self.version
    }
    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

impl Versioned for DistributedTask {
    const ENTITY: &'static str = "distributed_task";
    fn entity_id(&self) -> Uuid {
        self.id
    }
    fn version(&self) -> i64 {
        self.version
    }
    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

/// One CAS-guarded map per entity kind.
struct Table<T: Versioned> {
    rows: RwLock<HashMap<Uuid, T>>,
}

impl<T: Versioned> Table<T> {
    fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    fn load(&self, id: Uuid) -> MeshResult<T> {
        self.rows
            .read()
            .get(&id)
            .cloned()
            .ok_or(MeshError::NotFound {
                entity: T::ENTITY,
                id,
            })
    }

    fn create(&self, row: &T) -> MeshResult<()> {
        let mut rows = self.rows.write();
        let id = row.entity_id();
        if rows.contains_key(&id) {
            return Err(MeshError::InvalidConfig(format!(
                "{} {id} already exists",
                T::ENTITY
            )));
        }
        rows.insert(id, row.clone());
        Ok(())
    }

    fn save(&self, row: &T, expected: i64) -> MeshResult<i64> {
        let mut rows = self.rows.write();
        let id = row.entity_id();
        let stored = rows.get(&id).ok_or(MeshError::NotFound {
            entity: T::ENTITY,
            id,
        })?;
        let actual = stored.version();
        if actual != expected {
            return Err(MeshError::OptimisticLockConflict {
                entity: T::ENTITY,
                id,
                expected,
                actual,
            });
        }
        let mut next = row.clone();
        next.set_version(expected + 1);
        rows.insert(id, next);
        Ok(expected + 1)
    }
}

/// In-process repository backed by `parking_lot` maps.
///
/// Suitable for tests and single-node embedding; a database-backed
/// implementation maps `save_*` onto `UPDATE ... WHERE version = ?`.
pub struct InMemoryRepository {
    tasks: Table<Task>,
    workflows: Table<Workflow>,
    executions: Table<WorkflowExecution>,
    distributed: Table<DistributedTask>,
    delegations: RwLock<Vec<TaskDelegation>>,
    events: RwLock<Vec<TaskEvent>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            tasks: Table::new(),
            workflows: Table::new(),
            executions: Table::new(),
            distributed: Table::new(),
            delegations: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn load_task(&self, id: Uuid) -> MeshResult<Task> {
        self.tasks.load(id)
    }

    async fn create_task(&self, task: &Task) -> MeshResult<()> {
        self.tasks.create(task)
    }

    async fn save_task(&self, task: &Task, expected_version: i64) -> MeshResult<i64> {
        self.tasks.save(task, expected_version)
    }

    async fn list_subtasks(&self, parent: Uuid) -> MeshResult<Vec<Task>> {
        let mut children: Vec<Task> = self
            .tasks
            .rows
            .read()
            .values()
            .filter(|t| t.parent_task_id == Some(parent))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(children)
    }

    async fn append_delegation(&self, delegation: &TaskDelegation) -> MeshResult<()> {
        self.delegations.write().push(delegation.clone());
        Ok(())
    }

    async fn delegations_for(&self, task_id: Uuid) -> MeshResult<Vec<TaskDelegation>> {
        let mut chain: Vec<TaskDelegation> = self
            .delegations
            .read()
            .iter()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect();
        // Stable sort keeps append order for equal timestamps.
        chain.sort_by_key(|d| d.delegated_at);
        Ok(chain)
    }

    async fn load_workflow(&self, id: Uuid) -> MeshResult<Workflow> {
        self.workflows.load(id)
    }

    async fn create_workflow(&self, workflow: &Workflow) -> MeshResult<()> {
        self.workflows.create(workflow)
    }

    async fn save_workflow(&self, workflow: &Workflow, expected_version: i64) -> MeshResult<i64> {
        self.workflows.save(workflow, expected_version)
    }

    async fn load_execution(&self, id: Uuid) -> MeshResult<WorkflowExecution> {
        self.executions.load(id)
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> MeshResult<()> {
        self.executions.create(execution)
    }

    async fn save_execution(
        &self,
        execution: &WorkflowExecution,
        expected_version: i64,
    ) -> MeshResult<i64> {
        self.executions.save(execution, expected_version)
    }

    async fn load_distributed(&self, id: Uuid) -> MeshResult<DistributedTask> {
        self.distributed.load(id)
    }

    async fn create_distributed(&self, task: &DistributedTask) -> MeshResult<()> {
        self.distributed.create(task)
    }

    async fn save_distributed(
        &self,
        task: &DistributedTask,
        expected_version: i64,
    ) -> MeshResult<i64> {
        self.distributed.save(task, expected_version)
    }

    async fn list_active_distributed(&self) -> MeshResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .distributed
            .rows
            .read()
            .values()
            .filter(|dt| {
                !matches!(
                    dt.status,
                    TaskStatus::Completed
                        | TaskStatus::Failed
                        | TaskStatus::Cancelled
                        | TaskStatus::Timeout
                )
            })
            .map(|dt| dt.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn append_event(&self, event: &TaskEvent) -> MeshResult<bool> {
        let mut events = self.events.write();
        if events.iter().any(|e| e.id == event.id) {
            return Ok(false);
        }
        events.push(event.clone());
        Ok(true)
    }

    async fn events_for(&self, task_id: Uuid) -> MeshResult<Vec<TaskEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::DelegationType;
    use chrono::{Duration, Utc};

    fn task() -> Task {
        Task::new(Uuid::new_v4(), "index", "Index docs", "planner")
    }

    #[tokio::test]
    async fn test_save_increments_version_by_one() {
        let repo = InMemoryRepository::new();
        let mut t = task();
        repo.create_task(&t).await.unwrap();

        t.title = "Index all docs".into();
        let v2 = repo.save_task(&t, 1).await.unwrap();
        assert_eq!(v2, 2);
        t.version = v2;
        let v3 = repo.save_task(&t, v2).await.unwrap();
        assert_eq!(v3, 3);
        assert_eq!(repo.load_task(t.id).await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_stale_write_is_rejected_and_value_unchanged() {
        let repo = InMemoryRepository::new();
        let t = task();
        repo.create_task(&t).await.unwrap();

        let mut first = t.clone();
        first.title = "first writer".into();
        repo.save_task(&first, 1).await.unwrap();

        let mut second = t.clone();
        second.title = "second writer".into();
        let err = repo.save_task(&second, 1).await.unwrap_err();
        match err {
            MeshError::OptimisticLockConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        let stored = repo.load_task(t.id).await.unwrap();
        assert_eq!(stored.title, "first writer");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_missing_task_is_not_found() {
        let repo = InMemoryRepository::new();
        let err = repo.load_task(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, MeshError::NotFound { entity: "task", .. }));
        let err = repo.save_task(&task(), 1).await.unwrap_err();
        assert!(matches!(err, MeshError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let repo = InMemoryRepository::new();
        let t = task();
        repo.create_task(&t).await.unwrap();
        assert!(repo.create_task(&t).await.is_err());
    }

    #[tokio::test]
    async fn test_list_subtasks_filters_by_parent() {
        let repo = InMemoryRepository::new();
        let parent = task();
        repo.create_task(&parent).await.unwrap();
        for _ in 0..3 {
            repo.create_task(&task().with_parent(parent.id)).await.unwrap();
        }
        repo.create_task(&task()).await.unwrap();
        assert_eq!(repo.list_subtasks(parent.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delegation_chain_is_ordered_by_time() {
        let repo = InMemoryRepository::new();
        let task_id = Uuid::new_v4();
        let base = Utc::now();
        let hop = |from: &str, to: &str, offset: i64| TaskDelegation {
            id: Uuid::new_v4(),
            task_id,
            from_agent: from.into(),
            to_agent: to.into(),
            delegation_type: DelegationType::Manual,
            reason: "rebalance".into(),
            delegated_at: base + Duration::seconds(offset),
        };
        repo.append_delegation(&hop("b", "c", 10)).await.unwrap();
        repo.append_delegation(&hop("a", "b", 0)).await.unwrap();
        let chain = repo.delegations_for(task_id).await.unwrap();
        let hops: Vec<_> = chain.iter().map(|d| d.to_agent.as_str()).collect();
        assert_eq!(hops, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_event_with_known_id_is_not_appended_twice() {
        let repo = InMemoryRepository::new();
        let task_id = Uuid::new_v4();
        let event = TaskEvent::failed(task_id, "agent-1", "crashed");
        assert!(repo.append_event(&event).await.unwrap());
        assert!(!repo.append_event(&event).await.unwrap());
        assert!(repo
            .append_event(&TaskEvent::failed(task_id, "agent-1", "crashed"))
            .await
            .unwrap());
        assert_eq!(repo.events_for(task_id).await.unwrap().len(), 2);
    }
}
