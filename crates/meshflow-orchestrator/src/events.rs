use crate::types::DelegationType;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Facts the control plane publishes for an external event bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskCreated {
        task_id: Uuid,
        tenant_id: Uuid,
        task_type: String,
        created_by: String,
        at: DateTime<Utc>,
    },
    SubtaskCreated {
        task_id: Uuid,
        parent_task_id: Uuid,
        agent_id: Option<String>,
        at: DateTime<Utc>,
    },
    TaskDelegated {
        task_id: Uuid,
        from_agent: String,
        to_agent: String,
        delegation_type: DelegationType,
        reason: String,
        at: DateTime<Utc>,
    },
    DistributedTaskCompleted {
        task_id: Uuid,
        results_collected: usize,
        at: DateTime<Utc>,
    },
    DistributedTaskFailed {
        task_id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Task the event is about.
    pub fn task_id(&self) -> Uuid {
        match self {
            DomainEvent::TaskCreated { task_id, .. }
            | DomainEvent::SubtaskCreated { task_id, .. }
            | DomainEvent::TaskDelegated { task_id, .. }
            | DomainEvent::DistributedTaskCompleted { task_id, .. }
            | DomainEvent::DistributedTaskFailed { task_id, .. } => *task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TaskCreated { .. } => "task_created",
            DomainEvent::SubtaskCreated { .. } => "subtask_created",
            DomainEvent::TaskDelegated { .. } => "task_delegated",
            DomainEvent::DistributedTaskCompleted { .. } => "distributed_task_completed",
            DomainEvent::DistributedTaskFailed { .. } => "distributed_task_failed",
        }
    }
}

/// Fire-and-forget publisher. Publishing never fails the caller.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: DomainEvent);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: DomainEvent) {}
}

/// Forwards events over an unbounded channel to whatever drains the receiver.
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: DomainEvent) {
        debug!(event = event.name(), task_id = %event.task_id(), "publishing domain event");
        // A closed receiver means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events with the given [`DomainEvent::name`].
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for MemoryEventSink {
    fn publish(&self, event: DomainEvent) {
        self.events.lock().push(event);
    }
}
