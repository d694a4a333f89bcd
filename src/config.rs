//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the decision engine and its strategies.
///
/// All fields have defaults matching long-observed behavior; hosts typically
/// construct this once, override a field or two, and pass it to
/// [`DecisionEngine::new`](crate::engine::DecisionEngine::new).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct EngineConfig {
    /// Probability of picking a uniformly random candidate (exploration).
    pub epsilon: f64,
    /// Step size for temporal-difference value updates.
    pub learning_rate: f64,
    /// Discount factor applied to the successor state's value.
    pub discount: f64,
    /// Minimum confidence for a reinforcement prediction to win outright.
    pub reinforcement_gate: f64,
    /// Minimum raw cosine similarity for a few-shot match to exist at all.
    pub fewshot_threshold: f64,
    /// Minimum confidence for a few-shot prediction to win outright.
    pub fewshot_gate: f64,
    /// Minimum Jaccard similarity between situation names for transfer.
    pub transfer_similarity_threshold: f64,
    /// Minimum confidence for a transferred prediction to win outright.
    pub transfer_gate: f64,
    /// Number of nearest historical neighbors the voter considers.
    pub voter_k: usize,
    /// Minimum vote confidence below which the voter abstains.
    pub voter_min_confidence: f64,
    /// Minimum confidence for a voter prediction to win outright.
    pub voter_gate: f64,
    /// Best-candidate confidence below which the user is asked to choose.
    pub uncertainty_threshold: f64,
    /// Minimum occurrences of a trailing action pattern before suggesting
    /// the next workflow step.
    pub workflow_min_occurrences: usize,
    /// Days of action history to keep when pruning.
    pub retention_days: i64,
    /// Bounded timeout for a single embedding provider call.
    pub embedding_timeout_ms: u64,
    /// Per-decision time budget. When exceeded, remaining strategies are
    /// skipped and the best pooled prediction so far is returned.
    pub decision_budget_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.2,
            learning_rate: 0.1,
            discount: 0.9,
            reinforcement_gate: 0.8,
            fewshot_threshold: 0.75,
            fewshot_gate: 0.75,
            transfer_similarity_threshold: 0.7,
            transfer_gate: 0.7,
            voter_k: 10,
            voter_min_confidence: 0.7,
            voter_gate: 0.7,
            uncertainty_threshold: 0.6,
            workflow_min_occurrences: 5,
            retention_days: 90,
            embedding_timeout_ms: 5_000,
            decision_budget_ms: 4_000,
        }
    }
}
