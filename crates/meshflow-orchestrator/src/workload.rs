use crate::types::{Agent, AgentWorkload};
use meshflow_core::MetricsSink;
use std::sync::Arc;

const TASK_WEIGHT: f64 = 0.6;
const RESOURCE_WEIGHT: f64 = 0.4;

/// Ranks agents by a 0-100 load score. Higher means busier.
#[derive(Clone)]
pub struct WorkloadScorer {
    metrics: Arc<dyn MetricsSink>,
}

impl WorkloadScorer {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self { metrics }
    }

    /// Pure score computation.
    ///
    /// Each active task counts double a queued one, ten points per unit,
    /// capped at 100; resources are the mean of CPU and memory percentages.
    /// The two parts are blended 60/40 and clamped to `[0, 100]`.
    pub fn score(active_tasks: u32, queued_tasks: u32, cpu_percent: f64, memory_percent: f64) -> f64 {
        let load_units = f64::from(active_tasks) * 2.0 + f64::from(queued_tasks);
        let task_score = (load_units * 10.0).min(100.0);
        let resource_score = (cpu_percent + memory_percent) / 2.0;
        let score = task_score * TASK_WEIGHT + resource_score * RESOURCE_WEIGHT;
        if score.is_nan() {
            return 0.0;
        }
        score.clamp(0.0, 100.0)
    }

    pub fn score_workload(workload: &AgentWorkload) -> f64 {
        Self::score(
            workload.active_tasks,
            workload.queued_tasks,
            workload.cpu_percent,
            workload.memory_percent,
        )
    }

    /// Score an agent and report it as the `agent.workload_score` gauge.
    pub fn score_agent(&self, agent: &Agent) -> f64 {
        let score = Self::score_workload(&agent.workload);
        self.metrics
            .record_gauge("agent.workload_score", score, &[("agent_id", agent.id.as_str())]);
        score
    }
}
