//! DecisionEngine: priority-ordered strategy pipeline with confidence gates.
//!
//! Strategies run in a fixed order (reinforcement, few-shot, transfer,
//! historical vote); the first to clear its gate wins outright. Sub-threshold
//! predictions are pooled, and when nothing clears a gate the active learner
//! decides whether to flag the best candidate for user disambiguation. All
//! strategy failures are logged and swallowed so a broken collaborator can
//! never abort a decision cycle. A per-decision time budget bounds the whole
//! pipeline.

use crate::active::ActiveLearner;
use crate::config::EngineConfig;
use crate::context::ContextSnapshot;
use crate::embedding::EmbeddingProvider;
use crate::fewshot::{FewShotMatcher, FewShotStats};
use crate::meta::{TransferLearner, TransferStats};
use crate::reinforcement::{ValueLearner, ValueStats};
use crate::store::EventStore;
use crate::types::{ActionParams, LearningStats, Outcome, Prediction, WorkflowSuggestion};
use crate::voter::HistoryVoter;
use crate::EngineError;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Aggregated statistics from every subsystem.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub reinforcement: ValueStats,
    pub fewshot: FewShotStats,
    pub transfer: TransferStats,
    pub history: LearningStats,
}

/// The hybrid decision pipeline.
///
/// One instance per store; every strategy shares the injected
/// [`EventStore`] handle, so hosts can point the whole engine at an
/// in-memory store for tests.
pub struct DecisionEngine {
    store: Arc<EventStore>,
    reinforcement: ValueLearner,
    fewshot: FewShotMatcher,
    transfer: TransferLearner,
    voter: HistoryVoter,
    active: ActiveLearner,
    config: EngineConfig,
}

impl DecisionEngine {
    /// Wire up all strategies around one store and one embedding provider.
    pub async fn new(
        store: Arc<EventStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let reinforcement = ValueLearner::new(store.clone(), &config).await?;
        let fewshot = FewShotMatcher::new(
            store.clone(),
            provider,
            config.fewshot_threshold,
            Duration::from_millis(config.embedding_timeout_ms),
        );
        let transfer = TransferLearner::new(store.clone(), config.transfer_similarity_threshold);
        let voter = HistoryVoter::new(
            store.clone(),
            config.voter_k,
            config.voter_min_confidence,
            config.workflow_min_occurrences,
        );
        let active = ActiveLearner::new(store.clone(), config.uncertainty_threshold);

        Ok(Self {
            store,
            reinforcement,
            fewshot,
            transfer,
            voter,
            active,
            config,
        })
    }

    /// Pick the best next action for a situation.
    ///
    /// Returns `None` only when every strategy abstained. A returned
    /// prediction with `ask_user` set carries ranked `options` for a
    /// disambiguation prompt.
    pub async fn select_action(
        &self,
        user_text: &str,
        situation: &str,
        context: &ContextSnapshot,
        candidate_actions: &[String],
    ) -> Option<Prediction> {
        let started = Instant::now();
        let budget = Duration::from_millis(self.config.decision_budget_ms);
        let mut pool: Vec<Prediction> = Vec::new();

        // 1. Reinforcement values.
        if let Some(prediction) =
            self.reinforcement
                .select_action(context, situation, candidate_actions)
        {
            if prediction.confidence > self.config.reinforcement_gate {
                tracing::debug!(action = %prediction.action, confidence = prediction.confidence, "reinforcement cleared its gate");
                return Some(prediction);
            }
            pool.push(prediction);
        }

        // 2. Few-shot semantic match.
        if self.within_budget(started, budget, "few-shot") {
            match self.fewshot.predict(user_text, Some(situation)).await {
                Ok(Some(prediction)) => {
                    if prediction.confidence > self.config.fewshot_gate {
                        tracing::debug!(action = %prediction.action, confidence = prediction.confidence, "few-shot cleared its gate");
                        return Some(prediction);
                    }
                    pool.push(prediction);
                }
                Ok(None) => {}
                Err(error) => tracing::warn!(%error, "few-shot strategy failed"),
            }
        }

        // 3. Cross-situation transfer.
        if self.within_budget(started, budget, "transfer") {
            match self.transfer.bootstrap(situation).await {
                Ok(Some(prediction)) => {
                    if prediction.confidence > self.config.transfer_gate {
                        tracing::debug!(action = %prediction.action, confidence = prediction.confidence, "transfer cleared its gate");
                        return Some(prediction);
                    }
                    pool.push(prediction);
                }
                Ok(None) => {}
                Err(error) => tracing::warn!(%error, "transfer strategy failed"),
            }
        }

        // 4. Historical vote.
        if self.within_budget(started, budget, "history vote") {
            match self.voter.predict(situation, context).await {
                Ok(Some(prediction)) => {
                    if prediction.confidence > self.config.voter_gate {
                        tracing::debug!(action = %prediction.action, confidence = prediction.confidence, "history vote cleared its gate");
                        return Some(prediction);
                    }
                    pool.push(prediction);
                }
                Ok(None) => {}
                Err(error) => tracing::warn!(%error, "history vote strategy failed"),
            }
        }

        // 5. Nothing cleared a gate: surface the best sub-threshold
        // prediction, flagged for disambiguation if warranted.
        if pool.is_empty() {
            return None;
        }
        let (ask, options) = self.active.should_ask(&pool);
        let mut best = pool.into_iter().max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if ask {
            tracing::debug!(action = %best.action, confidence = best.confidence, "uncertain, asking the user");
            best.ask_user = true;
            best.options = options;
        }
        Some(best)
    }

    fn within_budget(&self, started: Instant, budget: Duration, strategy: &str) -> bool {
        if started.elapsed() < budget {
            return true;
        }
        tracing::warn!(strategy, budget_ms = budget.as_millis() as u64, "decision budget exhausted, skipping remaining strategies");
        false
    }

    /// Feed an observed outcome back into the learners.
    ///
    /// Writes the action record (exactly one per completed attempt), always
    /// updates the reinforcement values, and stores a few-shot exemplar on
    /// success. Persistence failures degrade to warnings; the cycle
    /// continues on in-memory state.
    pub async fn learn_from_outcome(
        &self,
        user_text: &str,
        situation: &str,
        context: &ContextSnapshot,
        action: &str,
        params: &ActionParams,
        outcome: Outcome,
        duration_ms: i64,
    ) {
        if let Err(error) = self
            .store
            .record(context, situation, action, params, outcome, duration_ms)
            .await
        {
            tracing::warn!(%error, "failed to persist action record");
        }

        if let Err(error) = self
            .reinforcement
            .update(context, situation, action, outcome, None)
            .await
        {
            tracing::warn!(%error, "reinforcement update failed");
        }

        if outcome == Outcome::Success {
            if let Err(error) = self.fewshot.store_example(user_text, action, situation).await {
                tracing::warn!(%error, "few-shot exemplar write failed");
            }
        }
    }

    /// Render the disambiguation prompt for a set of options.
    pub fn format_disambiguation_prompt(
        &self,
        situation: &str,
        options: &[Prediction],
    ) -> String {
        self.active.format_query(situation, options)
    }

    /// Apply the user's answer to a disambiguation prompt.
    ///
    /// `None` for an invalid or out-of-range choice; the caller re-prompts
    /// or falls back.
    pub async fn apply_user_choice(
        &self,
        situation: &str,
        context: &ContextSnapshot,
        options: &[Prediction],
        choice: &str,
    ) -> Option<Prediction> {
        match self
            .active
            .apply_choice(situation, context, options, choice)
            .await
        {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(%error, "applying user choice failed");
                None
            }
        }
    }

    /// Suggest the next step of a recognized workflow, if any.
    pub async fn suggest_workflow(
        &self,
        recent_actions: &[String],
    ) -> Option<WorkflowSuggestion> {
        match self.voter.detect_workflow(recent_actions).await {
            Ok(suggestion) => suggestion,
            Err(error) => {
                tracing::warn!(%error, "workflow detection failed");
                None
            }
        }
    }

    /// Drop history past the configured retention window.
    pub async fn prune_history(&self) -> Result<u64, EngineError> {
        self.store.prune(self.config.retention_days).await
    }

    /// Statistics from every subsystem.
    pub async fn combined_stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            reinforcement: self.reinforcement.stats(),
            fewshot: self.fewshot.stats().await?,
            transfer: self.transfer.stats().await?,
            history: self.store.learning_stats().await?,
        })
    }

    /// The shared store handle, for hosts that need direct queries.
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Direct parameter refinement for an already-chosen action.
    pub async fn optimize_params(
        &self,
        action: &str,
        context: &ContextSnapshot,
        defaults: ActionParams,
    ) -> ActionParams {
        match self.voter.optimize_params(action, context, defaults.clone()).await {
            Ok(params) => params,
            Err(error) => {
                tracing::warn!(%error, "parameter optimization failed");
                defaults
            }
        }
    }

    /// Record a direct teaching from the user.
    pub async fn teach_action(
        &self,
        situation: &str,
        context: &ContextSnapshot,
        action: &str,
        params: ActionParams,
    ) {
        if let Err(error) = self
            .active
            .teach_action(situation, context, action, params)
            .await
        {
            tracing::warn!(%error, "teaching write failed");
        }
    }
}
