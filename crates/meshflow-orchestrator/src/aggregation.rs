use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// How subtask outputs fold into the final result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    /// Every result, in arrival order.
    #[default]
    CombineResults,
    /// The earliest result.
    FirstComplete,
    /// The value most results agree on.
    MajorityVote,
    /// Weight-adjusted combination.
    Weighted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default)]
    pub method: AggregationMethod,
}

/// One subtask's reported output, kept until aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateResult {
    pub subtask_id: Uuid,
    pub agent_id: String,
    pub result: Value,
    pub weight: f64,
    pub received_at: DateTime<Utc>,
}

/// Folds intermediate results into a final result.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn aggregate(&self, config: &AggregationConfig, results: &[IntermediateResult]) -> Value {
        match config.method {
            AggregationMethod::CombineResults => self.combine_results(results),
            AggregationMethod::FirstComplete => self.first_complete(results),
            AggregationMethod::MajorityVote => self.majority_vote(results),
            AggregationMethod::Weighted => self.weighted(results),
        }
    }

    pub fn combine_results(&self, results: &[IntermediateResult]) -> Value {
        let mut ordered: Vec<&IntermediateResult> = results.iter().collect();
        ordered.sort_by_key(|r| r.received_at);
        Value::Array(ordered.into_iter().map(|r| r.result.clone()).collect())
    }

    pub fn first_complete(&self, results: &[IntermediateResult]) -> Value {
        results
            .iter()
            .min_by_key(|r| r.received_at)
            .map_or(Value::Null, |r| r.result.clone())
    }

    /// Strict majority wins. Without one, the most common value wins when it
    /// was reported more than once (ties broken by canonical form). When every
    /// value is distinct a no-consensus report is returned instead.
    pub fn majority_vote(&self, results: &[IntermediateResult]) -> Value {
        match results {
            [] => return Value::Null,
            [only] => return only.result.clone(),
            _ => {}
        }

        // serde_json objects are key-sorted, so the serialized form is canonical.
        let mut votes: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_key: BTreeMap<String, &Value> = BTreeMap::new();
        for r in results {
            let key = r.result.to_string();
            *votes.entry(key.clone()).or_insert(0) += 1;
            by_key.entry(key).or_insert(&r.result);
        }

        let total = results.len();
        let max_votes = votes.values().copied().max().unwrap_or(0);
        // BTreeMap iteration is sorted, so the first hit is the tie-break winner.
        let winner = votes
            .iter()
            .find(|(_, count)| **count == max_votes)
            .and_then(|(key, _)| by_key.get(key));

        if let Some(winner) = winner {
            if max_votes > total / 2 || max_votes > 1 {
                return (*winner).clone();
            }
        }

        let per_subtask: Map<String, Value> = results
            .iter()
            .map(|r| (r.subtask_id.to_string(), r.result.clone()))
            .collect();
        json!({
            "consensus": false,
            "reason": "no majority agreement",
            "votes": votes,
            "total": total,
            "required": total / 2 + 1,
            "results": per_subtask,
        })
    }

    /// Numeric results combine into a weighted mean. Anything else yields
    /// the heaviest result, earliest first on equal weight.
    pub fn weighted(&self, results: &[IntermediateResult]) -> Value {
        if results.is_empty() {
            return Value::Null;
        }
        let numbers: Option<Vec<(f64, f64)>> = results
            .iter()
            .map(|r| r.result.as_f64().map(|v| (v, r.weight.max(0.0))))
            .collect();
        if let Some(numbers) = numbers {
            let total_weight: f64 = numbers.iter().map(|(_, w)| w).sum();
            let mean = if total_weight > 0.0 {
                numbers.iter().map(|(v, w)| v * w).sum::<f64>() / total_weight
            } else {
                numbers.iter().map(|(v, _)| v).sum::<f64>() / numbers.len() as f64
            };
            return json!(mean);
        }
        results
            .iter()
            .min_by(|a, b| {
                b.weight
                    .total_cmp(&a.weight)
                    .then_with(|| a.received_at.cmp(&b.received_at))
            })
            .map_or(Value::Null, |r| r.result.clone())
    }
}
