//! Orchestration layer for the Meshflow control plane.
//!
//! Owns every piece of mutable domain state: tasks and their lifecycle,
//! agent records, delegation history, workflow executions, and distributed
//! tasks. All writes go through a [`Repository`] under optimistic version
//! checks, so independent coordinators can share one store.
//!
//! # Main types
//!
//! - [`TaskLifecycle`]: Validated task transitions plus the CAS update loop.
//! - [`AgentRegistry`]: Agent records, heartbeats, and workload scoring.
//! - [`DelegationTracker`]: Reassignment with an append-only hop history.
//! - [`WorkflowExecutionEngine`]: Dependency-ordered step execution with retries.
//! - [`DistributedTaskCoordinator`]: Fan-out, plan phases, sync points, aggregation.
//! - [`ResultAggregator`]: Folds subtask results into a final result.
//! - [`InMemoryRepository`]: Reference [`Repository`] backend.

/// Result folding strategies.
pub mod aggregation;
/// Distributed-task coordination.
pub mod coordinator;
/// Task reassignment and its history.
pub mod delegation;
/// Distributed-task model and plan walking.
pub mod distributed;
/// Workflow execution engine.
pub mod engine;
/// Domain events and sinks.
pub mod events;
/// Task lifecycle rules.
pub mod lifecycle;
/// Agent registry.
pub mod monitor;
/// Persistence seam.
pub mod repository;
/// Shared task, agent, and event records.
pub mod types;
/// Workflow definitions and execution records.
pub mod workflow;
/// Workload scoring.
pub mod workload;

pub use aggregation::{AggregationConfig, AggregationMethod, IntermediateResult, ResultAggregator};
pub use coordinator::DistributedTaskCoordinator;
pub use delegation::DelegationTracker;
pub use distributed::{
    CompletionMode, CoordinationMode, DistributedTask, ExecutionPhase, ExecutionPlan, OnTimeout,
    Subtask, SubtaskStage, SyncPoint, TaskPartition,
};
pub use engine::{StepResult, WorkflowExecutionEngine};
pub use events::{ChannelEventSink, DomainEvent, EventSink, MemoryEventSink, NoopEventSink};
pub use lifecycle::TaskLifecycle;
pub use monitor::AgentRegistry;
pub use repository::{InMemoryRepository, Repository, Versioned};
pub use types::{
    Agent, AgentWorkload, DelegationType, Task, TaskDelegation, TaskEvent, TaskEventType,
    TaskPriority,
};
pub use workflow::{
    BackoffType, StepExecutionStatus, Workflow, WorkflowExecution, WorkflowRetryPolicy,
    WorkflowStep, WorkflowType,
};
pub use workload::WorkloadScorer;
