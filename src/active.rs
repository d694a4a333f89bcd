//! Active learner: asks the user when nothing is confident, and turns the
//! answer into an immediate high-confidence training example.

use crate::context::ContextSnapshot;
use crate::store::EventStore;
use crate::types::{ActionParams, Outcome, Prediction, StrategySource};
use crate::EngineError;

use std::sync::Arc;

/// Confidence assigned to a user-taught choice.
const USER_TAUGHT_CONFIDENCE: f64 = 0.95;
/// At most this many options appear in a disambiguation prompt.
const MAX_OPTIONS: usize = 3;

/// Human-in-the-loop fallback strategy.
pub struct ActiveLearner {
    store: Arc<EventStore>,
    uncertainty_threshold: f64,
}

impl ActiveLearner {
    pub fn new(store: Arc<EventStore>, uncertainty_threshold: f64) -> Self {
        Self {
            store,
            uncertainty_threshold,
        }
    }

    /// Whether the user should be asked, and the top options to show.
    ///
    /// Asks when the best candidate is below the uncertainty threshold;
    /// options come back sorted by confidence, best first.
    pub fn should_ask(&self, predictions: &[Prediction]) -> (bool, Vec<Prediction>) {
        let Some(top) = predictions
            .iter()
            .map(|prediction| prediction.confidence)
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        else {
            return (false, Vec::new());
        };

        if top >= self.uncertainty_threshold {
            return (false, Vec::new());
        }

        let mut options = predictions.to_vec();
        options.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        options.truncate(MAX_OPTIONS);
        (true, options)
    }

    /// Render a lettered multiple-choice prompt ending in an open option.
    pub fn format_query(&self, situation: &str, options: &[Prediction]) -> String {
        let mut prompt = format!("I'm not sure what to do for '{situation}'. Should I:\n");
        for (index, option) in options.iter().enumerate() {
            let letter = (b'A' + index as u8) as char;
            prompt.push_str(&format!(
                "  {letter}) {} (confidence: {:.0}%)\n",
                option.action,
                option.confidence * 100.0
            ));
        }
        let open_letter = (b'A' + options.len() as u8) as char;
        prompt.push_str(&format!("  {open_letter}) Something else\n"));
        prompt.push_str("Your choice (A/B/C...):");
        prompt
    }

    /// Apply the user's lettered choice.
    ///
    /// A valid in-range letter records the selection as a successful action
    /// (the strongest training signal available) and returns it with fixed
    /// high confidence. Anything else returns `None`; the caller re-prompts
    /// or falls back.
    pub async fn apply_choice(
        &self,
        situation: &str,
        context: &ContextSnapshot,
        options: &[Prediction],
        choice: &str,
    ) -> Result<Option<Prediction>, EngineError> {
        let trimmed = choice.trim();
        let mut chars = trimmed.chars();
        let (Some(letter), None) = (chars.next(), chars.next()) else {
            return Ok(None);
        };
        if !letter.is_ascii_alphabetic() {
            return Ok(None);
        }

        let index = (letter.to_ascii_uppercase() as u8 - b'A') as usize;
        let Some(selected) = options.get(index) else {
            return Ok(None);
        };

        if let Err(error) = self
            .store
            .record(
                context,
                situation,
                &selected.action,
                &selected.params,
                Outcome::Success,
                0,
            )
            .await
        {
            tracing::warn!(%error, "failed to persist user-taught record");
        }
        tracing::info!(situation, action = %selected.action, "user taught a choice");

        Ok(Some(
            Prediction::new(
                selected.action.clone(),
                USER_TAUGHT_CONFIDENCE,
                StrategySource::UserTaught,
                "you picked this when asked",
            )
            .with_params(selected.params.clone()),
        ))
    }

    /// Direct teaching: "when X happens, do Y". Writes a successful record
    /// without a prompt round-trip.
    pub async fn teach_action(
        &self,
        situation: &str,
        context: &ContextSnapshot,
        action: &str,
        params: ActionParams,
    ) -> Result<(), EngineError> {
        self.store
            .record(context, situation, action, &params, Outcome::Success, 0)
            .await?;
        tracing::info!(situation, action, "user taught a new action");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::snapshot_at;

    async fn learner() -> (Arc<EventStore>, ActiveLearner) {
        let store = EventStore::in_memory().await.unwrap();
        let learner = ActiveLearner::new(store.clone(), 0.6);
        (store, learner)
    }

    fn predictions(confidences: &[f64]) -> Vec<Prediction> {
        confidences
            .iter()
            .enumerate()
            .map(|(index, &confidence)| {
                Prediction::new(
                    format!("action.{index}"),
                    confidence,
                    StrategySource::History,
                    "test",
                )
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // should_ask
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn confident_predictions_are_not_questioned() {
        let (_store, learner) = learner().await;
        let (ask, options) = learner.should_ask(&predictions(&[0.75, 0.3]));
        assert!(!ask);
        assert!(options.is_empty());
    }

    #[tokio::test]
    async fn uncertain_predictions_surface_top_three_sorted() {
        let (_store, learner) = learner().await;
        let (ask, options) = learner.should_ask(&predictions(&[0.2, 0.5, 0.4, 0.1]));
        assert!(ask);
        assert_eq!(options.len(), 3);
        assert_eq!(options[0].confidence, 0.5);
        assert_eq!(options[1].confidence, 0.4);
        assert_eq!(options[2].confidence, 0.2);
    }

    #[tokio::test]
    async fn no_predictions_means_no_question() {
        let (_store, learner) = learner().await;
        let (ask, options) = learner.should_ask(&[]);
        assert!(!ask);
        assert!(options.is_empty());
    }

    // -----------------------------------------------------------------------
    // format_query
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn prompt_letters_options_and_ends_open() {
        let (_store, learner) = learner().await;
        let prompt = learner.format_query("tired", &predictions(&[0.5, 0.4]));
        assert!(prompt.contains("'tired'"));
        assert!(prompt.contains("A) action.0"));
        assert!(prompt.contains("B) action.1"));
        assert!(prompt.contains("C) Something else"));
        assert!(prompt.ends_with("Your choice (A/B/C...):"));
    }

    // -----------------------------------------------------------------------
    // apply_choice
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn choosing_b_returns_high_confidence_and_writes_a_record() {
        let (store, learner) = learner().await;
        let ctx = snapshot_at(2026, 8, 3, 21);
        let options = predictions(&[0.5, 0.4, 0.3]);

        let prediction = learner
            .apply_choice("tired", &ctx, &options, "B")
            .await
            .unwrap()
            .expect("accepted choice");
        assert_eq!(prediction.action, "action.1");
        assert_eq!(prediction.confidence, 0.95);
        assert_eq!(prediction.source, StrategySource::UserTaught);

        let stats = store.aggregate("tired", "action.1").await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.successes, 1);
    }

    #[tokio::test]
    async fn lowercase_choices_are_accepted() {
        let (_store, learner) = learner().await;
        let ctx = snapshot_at(2026, 8, 3, 21);
        let options = predictions(&[0.5]);
        let prediction = learner
            .apply_choice("tired", &ctx, &options, " a ")
            .await
            .unwrap();
        assert!(prediction.is_some());
    }

    #[tokio::test]
    async fn out_of_range_and_malformed_choices_return_none() {
        let (store, learner) = learner().await;
        let ctx = snapshot_at(2026, 8, 3, 21);
        let options = predictions(&[0.5, 0.4]);

        for choice in ["C", "Z", "", "1", "AB", "?"] {
            let result = learner
                .apply_choice("tired", &ctx, &options, choice)
                .await
                .unwrap();
            assert!(result.is_none(), "choice {choice:?} should be rejected");
        }

        // Nothing was recorded for any rejected choice.
        let stats = store.learning_stats().await.unwrap();
        assert_eq!(stats.total_actions, 0);
    }

    // -----------------------------------------------------------------------
    // teach_action
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn direct_teaching_writes_a_success_record() {
        let (store, learner) = learner().await;
        let ctx = snapshot_at(2026, 8, 3, 21);
        learner
            .teach_action("tired", &ctx, "dnd.on", ActionParams::new())
            .await
            .unwrap();
        let stats = store.aggregate("tired", "dnd.on").await.unwrap();
        assert_eq!(stats.successes, 1);
    }
}
