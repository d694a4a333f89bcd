//! Value learner: epsilon-greedy action selection over a persisted value table.
//!
//! States are fingerprinted from (situation, time-of-day bucket, weekday,
//! charging state, battery tier). Values live in an in-memory map hydrated
//! from the `value_table` table at construction; every update is written
//! through to the database with upsert semantics.

use crate::config::EngineConfig;
use crate::context::ContextSnapshot;
use crate::store::EventStore;
use crate::types::{Outcome, Prediction, StrategySource};
use crate::EngineError;

use rand::seq::SliceRandom;
use rand::Rng;
use sha2::{Digest, Sha256};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Deterministic state fingerprint: 16 hex chars of SHA-256 over the
/// canonical state tuple.
///
/// Battery tiers: above 70 high, below 30 low, medium otherwise; a missing
/// reading counts as medium. Unknown charging state counts as on-battery.
pub fn state_fingerprint(situation: &str, context: &ContextSnapshot) -> String {
    let battery = context.battery_percent.unwrap_or(50);
    let tier = if battery > 70 {
        "high"
    } else if battery < 30 {
        "low"
    } else {
        "medium"
    };
    let power = if context.is_charging.unwrap_or(false) {
        "charging"
    } else {
        "battery"
    };

    let canonical = format!(
        "{situation}|{}|{}|{power}|{tier}",
        context.time_of_day, context.day_of_week
    );
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Exploration/exploitation counters and table size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueStats {
    pub entries: usize,
    pub total_updates: u64,
    pub explorations: u64,
    pub exploitations: u64,
}

/// Epsilon-greedy learner over the (state fingerprint, action) value table.
pub struct ValueLearner {
    store: Arc<EventStore>,
    values: RwLock<HashMap<(String, String), f64>>,
    epsilon: f64,
    learning_rate: f64,
    discount: f64,
    total_updates: AtomicU64,
    explorations: AtomicU64,
    exploitations: AtomicU64,
}

impl ValueLearner {
    /// Hydrate the in-memory table from the store.
    pub async fn new(store: Arc<EventStore>, config: &EngineConfig) -> Result<Self, EngineError> {
        let rows = sqlx::query_as::<_, (String, String, f64)>(
            "SELECT state_hash, action, value FROM value_table",
        )
        .fetch_all(store.pool())
        .await?;

        let mut values = HashMap::with_capacity(rows.len());
        for (state_hash, action, value) in rows {
            values.insert((state_hash, action), value);
        }
        tracing::debug!(entries = values.len(), "hydrated value table");

        Ok(Self {
            store,
            values: RwLock::new(values),
            epsilon: config.epsilon,
            learning_rate: config.learning_rate,
            discount: config.discount,
            total_updates: AtomicU64::new(0),
            explorations: AtomicU64::new(0),
            exploitations: AtomicU64::new(0),
        })
    }

    fn value(&self, state_hash: &str, action: &str) -> f64 {
        self.values
            .read()
            .expect("value table lock")
            .get(&(state_hash.to_string(), action.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    /// Pick an action for the fingerprinted state.
    ///
    /// With probability epsilon a uniformly random candidate is explored;
    /// otherwise the highest-valued candidate wins (unseen pairs default to
    /// zero). Confidence is `min(|value|, 1)`. An empty candidate list is
    /// not an error; there is simply nothing to predict.
    pub fn select_action(
        &self,
        context: &ContextSnapshot,
        situation: &str,
        candidates: &[String],
    ) -> Option<Prediction> {
        if candidates.is_empty() {
            return None;
        }

        let state_hash = state_fingerprint(situation, context);
        let mut rng = rand::thread_rng();

        let (action, method) = if rng.gen::<f64>() < self.epsilon {
            self.explorations.fetch_add(1, Ordering::Relaxed);
            let action = candidates.choose(&mut rng).expect("non-empty candidates");
            (action.clone(), "exploration")
        } else {
            self.exploitations.fetch_add(1, Ordering::Relaxed);
            let action = candidates
                .iter()
                .map(|action| (action, self.value(&state_hash, action)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(action, _)| action.clone())
                .expect("non-empty candidates");
            (action, "greedy")
        };

        let value = self.value(&state_hash, &action);
        Some(Prediction::new(
            action,
            value.abs().min(1.0),
            StrategySource::Reinforcement,
            format!("{method} pick, learned value {value:.3}"),
        ))
    }

    /// Temporal-difference update from an observed outcome.
    ///
    /// The successor value bootstraps from the same action in the next
    /// state's fingerprint; with no next context the current one stands in.
    /// The new value is persisted with upsert semantics and the row's update
    /// counter is incremented.
    pub async fn update(
        &self,
        context: &ContextSnapshot,
        situation: &str,
        action: &str,
        outcome: Outcome,
        next_context: Option<&ContextSnapshot>,
    ) -> Result<(), EngineError> {
        let state_hash = state_fingerprint(situation, context);
        let next_hash = state_fingerprint(situation, next_context.unwrap_or(context));

        let reward = outcome.reward();
        let old_value = self.value(&state_hash, action);
        let max_next = self.value(&next_hash, action);
        let new_value =
            old_value + self.learning_rate * (reward + self.discount * max_next - old_value);

        self.values
            .write()
            .expect("value table lock")
            .insert((state_hash.clone(), action.to_string()), new_value);

        sqlx::query(
            "INSERT INTO value_table (state_hash, action, value, update_count, last_updated) \
             VALUES (?, ?, ?, 1, datetime('now')) \
             ON CONFLICT(state_hash, action) DO UPDATE SET \
                 value = excluded.value, \
                 update_count = update_count + 1, \
                 last_updated = excluded.last_updated",
        )
        .bind(&state_hash)
        .bind(action)
        .bind(new_value)
        .execute(self.store.pool())
        .await?;

        self.total_updates.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            state = %&state_hash[..8],
            action,
            old = %format!("{old_value:.3}"),
            new = %format!("{new_value:.3}"),
            reward,
            "value update"
        );
        Ok(())
    }

    pub fn stats(&self) -> ValueStats {
        ValueStats {
            entries: self.values.read().expect("value table lock").len(),
            total_updates: self.total_updates.load(Ordering::Relaxed),
            explorations: self.explorations.load(Ordering::Relaxed),
            exploitations: self.exploitations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::snapshot_at;

    async fn learner(epsilon: f64) -> (Arc<EventStore>, ValueLearner) {
        let store = EventStore::in_memory().await.unwrap();
        let config = EngineConfig {
            epsilon,
            ..EngineConfig::default()
        };
        let learner = ValueLearner::new(store.clone(), &config).await.unwrap();
        (store, learner)
    }

    fn candidates() -> Vec<String> {
        vec!["dnd.on".to_string(), "coffee.order".to_string()]
    }

    // -----------------------------------------------------------------------
    // Fingerprinting
    // -----------------------------------------------------------------------

    #[test]
    fn fingerprint_is_deterministic() {
        let ctx = snapshot_at(2026, 8, 3, 23);
        assert_eq!(
            state_fingerprint("tired", &ctx),
            state_fingerprint("tired", &ctx)
        );
        assert_eq!(state_fingerprint("tired", &ctx).len(), 16);
    }

    #[test]
    fn fingerprint_distinguishes_battery_tiers() {
        let mut high = snapshot_at(2026, 8, 3, 23);
        high.battery_percent = Some(90);
        let mut low = high.clone();
        low.battery_percent = Some(10);
        assert_ne!(
            state_fingerprint("tired", &high),
            state_fingerprint("tired", &low)
        );
    }

    #[test]
    fn fingerprint_treats_missing_battery_as_medium() {
        let unknown = snapshot_at(2026, 8, 3, 23);
        let mut medium = unknown.clone();
        medium.battery_percent = Some(50);
        assert_eq!(
            state_fingerprint("tired", &unknown),
            state_fingerprint("tired", &medium)
        );
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn empty_candidates_produce_no_prediction() {
        let (_store, learner) = learner(0.0).await;
        let ctx = snapshot_at(2026, 8, 3, 23);
        assert!(learner.select_action(&ctx, "tired", &[]).is_none());
    }

    #[tokio::test]
    async fn greedy_selection_prefers_higher_value() {
        let (_store, learner) = learner(0.0).await;
        let ctx = snapshot_at(2026, 8, 3, 23);

        // Teach "dnd.on" a positive value through repeated successes.
        for _ in 0..5 {
            learner
                .update(&ctx, "tired", "dnd.on", Outcome::Success, None)
                .await
                .unwrap();
        }

        let prediction = learner
            .select_action(&ctx, "tired", &candidates())
            .expect("prediction");
        assert_eq!(prediction.action, "dnd.on");
        assert_eq!(prediction.source, StrategySource::Reinforcement);
        assert!(prediction.confidence > 0.0 && prediction.confidence <= 1.0);
    }

    #[tokio::test]
    async fn confidence_is_clamped_to_one() {
        let (store, _learner) = learner(0.0).await;
        // Seed an absurdly large stored value, then rehydrate.
        sqlx::query(
            "INSERT INTO value_table (state_hash, action, value) VALUES (?, ?, ?)",
        )
        .bind(state_fingerprint("tired", &snapshot_at(2026, 8, 3, 23)))
        .bind("dnd.on")
        .bind(25.0_f64)
        .execute(store.pool())
        .await
        .unwrap();

        let rehydrated = ValueLearner::new(
            store,
            &EngineConfig {
                epsilon: 0.0,
                ..EngineConfig::default()
            },
        )
        .await
        .unwrap();

        let ctx = snapshot_at(2026, 8, 3, 23);
        let prediction = rehydrated
            .select_action(&ctx, "tired", &candidates())
            .expect("prediction");
        assert_eq!(prediction.confidence, 1.0);
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn repeated_updates_converge_without_overshooting() {
        let (_store, learner) = learner(0.0).await;
        let ctx = snapshot_at(2026, 8, 3, 23);
        // Next state in a different time bucket, so its value stays zero and
        // the target is exactly the reward.
        let next = snapshot_at(2026, 8, 3, 9);

        let state = state_fingerprint("tired", &ctx);
        let mut previous = learner.value(&state, "dnd.on");
        for _ in 0..50 {
            learner
                .update(&ctx, "tired", "dnd.on", Outcome::Success, Some(&next))
                .await
                .unwrap();
            let current = learner.value(&state, "dnd.on");
            // Strictly toward the +1.0 target, never past it.
            assert!(current > previous);
            assert!(current <= 1.0 + 1e-9);
            previous = current;
        }
        assert!(previous > 0.99);
    }

    #[tokio::test]
    async fn canceled_outcomes_push_values_negative() {
        let (_store, learner) = learner(0.0).await;
        let ctx = snapshot_at(2026, 8, 3, 23);
        let next = snapshot_at(2026, 8, 3, 9);
        learner
            .update(&ctx, "tired", "dnd.on", Outcome::Canceled, Some(&next))
            .await
            .unwrap();
        let state = state_fingerprint("tired", &ctx);
        assert!(learner.value(&state, "dnd.on") < 0.0);
    }

    #[tokio::test]
    async fn updates_persist_and_survive_rehydration() {
        let (store, learner) = learner(0.0).await;
        let ctx = snapshot_at(2026, 8, 3, 23);
        learner
            .update(&ctx, "tired", "dnd.on", Outcome::Success, None)
            .await
            .unwrap();
        learner
            .update(&ctx, "tired", "dnd.on", Outcome::Success, None)
            .await
            .unwrap();

        let (count,): (i64,) =
            sqlx::query_as("SELECT update_count FROM value_table WHERE action = 'dnd.on'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(count, 2);

        let rehydrated = ValueLearner::new(store, &EngineConfig::default())
            .await
            .unwrap();
        let state = state_fingerprint("tired", &ctx);
        assert!(rehydrated.value(&state, "dnd.on") > 0.0);
        assert_eq!(rehydrated.stats().entries, 1);
    }
}
