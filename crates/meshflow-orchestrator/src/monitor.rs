use crate::types::{Agent, AgentWorkload};
use crate::workload::WorkloadScorer;
use meshflow_core::{AgentStatus, Clock, MeshError, MeshResult, MetricsSink, StatusMachine};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Tracks every registered agent, its status, and its reported workload.
///
/// Agents are never removed; [`retire`](Self::retire) walks them to `offline`.
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Agent>>>,
    machine: StatusMachine<AgentStatus>,
    scorer: WorkloadScorer,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl AgentRegistry {
    pub fn new(metrics: Arc<dyn MetricsSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            machine: StatusMachine::new(),
            scorer: WorkloadScorer::new(metrics.clone()),
            metrics,
            clock,
        }
    }

    /// Register an agent. It always enters the registry `offline`.
    pub async fn register(&self, mut agent: Agent) -> MeshResult<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent.id) {
            return Err(MeshError::InvalidConfig(format!(
                "agent {} is already registered",
                agent.id
            )));
        }
        let now = self.clock.now();
        agent.status = AgentStatus::Offline;
        agent.created_at = now;
        agent.last_seen = now;
        info!(agent_id = %agent.id, name = %agent.name, "agent registered");
        agents.insert(agent.id.clone(), agent);
        self.metrics
            .record_gauge("agent.registered", agents.len() as f64, &[]);
        Ok(())
    }

    /// Apply one validated status edge.
    pub async fn transition(&self, agent_id: &str, to: AgentStatus) -> MeshResult<AgentStatus> {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(agent_id).ok_or_else(|| not_found(agent_id))?;
        agent.status = self
            .machine
            .transition_to(agent.status, to, self.metrics.as_ref())?;
        agent.last_seen = self.clock.now();
        Ok(agent.status)
    }

    /// Walk the shortest legal path to `offline`.
    pub async fn retire(&self, agent_id: &str) -> MeshResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(agent_id).ok_or_else(|| not_found(agent_id))?;
        let path = self
            .machine
            .path(agent.status, AgentStatus::Offline)
            .ok_or_else(|| MeshError::InvalidTransition {
                kind: "agent",
                from: agent.status.to_string(),
                to: AgentStatus::Offline.to_string(),
            })?;
        for next in path {
            agent.status = self
                .machine
                .transition_to(agent.status, next, self.metrics.as_ref())?;
        }
        agent.last_seen = self.clock.now();
        info!(agent_id, "agent retired");
        Ok(())
    }

    pub async fn heartbeat(&self, agent_id: &str) -> MeshResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(agent_id).ok_or_else(|| not_found(agent_id))?;
        agent.last_seen = self.clock.now();
        Ok(())
    }

    /// Replace the reported workload and return the new score.
    pub async fn update_workload(&self, agent_id: &str, workload: AgentWorkload) -> MeshResult<f64> {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(agent_id).ok_or_else(|| not_found(agent_id))?;
        agent.workload = workload;
        agent.last_seen = self.clock.now();
        let score = self.scorer.score_agent(agent);
        debug!(agent_id, score, "workload updated");
        Ok(score)
    }

    pub async fn score(&self, agent_id: &str) -> MeshResult<f64> {
        let agents = self.agents.read().await;
        let agent = agents.get(agent_id).ok_or_else(|| not_found(agent_id))?;
        Ok(WorkloadScorer::score_workload(&agent.workload))
    }

    /// The `active` agent with the lowest workload score, optionally
    /// restricted to those advertising `capability`. Ties go to the smaller id.
    pub async fn least_loaded(&self, capability: Option<&str>) -> Option<Agent> {
        let agents = self.agents.read().await;
        agents
            .values()
            .filter(|a| a.status == AgentStatus::Active)
            .filter(|a| capability.map_or(true, |c| a.has_capability(c)))
            .map(|a| (WorkloadScorer::score_workload(&a.workload), a))
            .min_by(|(sa, a), (sb, b)| sa.total_cmp(sb).then_with(|| a.id.cmp(&b.id)))
            .map(|(_, a)| a.clone())
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// All agents sorted by id.
    pub async fn snapshot(&self) -> Vec<Agent> {
        let agents = self.agents.read().await;
        let mut all: Vec<Agent> = agents.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn by_tenant(&self, tenant_id: Uuid) -> Vec<Agent> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|a| a.tenant_id == tenant_id)
            .collect()
    }
}

fn not_found(agent_id: &str) -> MeshError {
    MeshError::InvalidConfig(format!("unknown agent: {agent_id}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use meshflow_core::{ManualClock, NoopMetrics};

    fn registry() -> (AgentRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (AgentRegistry::new(Arc::new(NoopMetrics), clock.clone()), clock)
    }

    async fn active(registry: &AgentRegistry, id: &str, caps: &[&str], active_tasks: u32) {
        let tenant = Uuid::nil();
        registry
            .register(Agent::new(id, tenant, id).with_capabilities(caps.iter().copied()))
            .await
            .unwrap();
        registry.transition(id, AgentStatus::Starting).await.unwrap();
        registry.transition(id, AgentStatus::Active).await.unwrap();
        registry
            .update_workload(
                id,
                AgentWorkload {
                    active_tasks,
                    ..AgentWorkload::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_forces_offline() {
        let (registry, _) = registry();
        let mut agent = Agent::new("a", Uuid::new_v4(), "a");
        agent.status = AgentStatus::Active;
        registry.register(agent).await.unwrap();
        assert_eq!(registry.get("a").await.unwrap().status, AgentStatus::Offline);
        assert!(registry.register(Agent::new("a", Uuid::new_v4(), "a")).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_agent_transition() {
        let (registry, _) = registry();
        registry.register(Agent::new("a", Uuid::new_v4(), "a")).await.unwrap();
        let err = registry.transition("a", AgentStatus::Active).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidTransition { kind: "agent", .. }));
        assert_eq!(registry.get("a").await.unwrap().status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn test_retire_walks_to_offline() {
        let (registry, _) = registry();
        active(&registry, "a", &[], 0).await;
        registry.retire("a").await.unwrap();
        assert_eq!(registry.get("a").await.unwrap().status, AgentStatus::Offline);
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_idle_capable_agent() {
        let (registry, _) = registry();
        active(&registry, "busy", &["gpu"], 5).await;
        active(&registry, "idle", &["cpu"], 0).await;
        active(&registry, "warm", &["gpu"], 1).await;
        registry.register(Agent::new("off", Uuid::nil(), "off")).await.unwrap();

        assert_eq!(registry.least_loaded(None).await.unwrap().id, "idle");
        assert_eq!(registry.least_loaded(Some("gpu")).await.unwrap().id, "warm");
        assert!(registry.least_loaded(Some("tpu")).await.is_none());
    }

    #[tokio::test]
    async fn test_least_loaded_breaks_ties_by_id() {
        let (registry, _) = registry();
        active(&registry, "b", &[], 0).await;
        active(&registry, "a", &[], 0).await;
        assert_eq!(registry.least_loaded(None).await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_heartbeat_updates_last_seen() {
        let (registry, clock) = registry();
        registry.register(Agent::new("a", Uuid::new_v4(), "a")).await.unwrap();
        clock.advance(Duration::seconds(30));
        registry.heartbeat("a").await.unwrap();
        assert_eq!(registry.get("a").await.unwrap().last_seen, clock.now());
        assert!(registry.heartbeat("ghost").await.is_err());
    }
}
