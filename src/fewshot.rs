//! Few-shot matcher: exemplar storage and similarity retrieval.
//!
//! One exemplar per (situation, action): repeated successful submissions
//! increment the success counter instead of inserting duplicate rows. At
//! prediction time candidates are *ranked* by a success-boosted similarity
//! but *gated* on the raw similarity, so a frequently confirmed exemplar can
//! win ties without inflating the confidence reported to the caller. That
//! asymmetry is deliberate.

use crate::embedding::{blob_to_vector, cosine_similarity, vector_to_blob, EmbeddingProvider};
use crate::store::EventStore;
use crate::types::{Prediction, StrategySource};
use crate::EngineError;

use std::sync::Arc;
use std::time::Duration;

/// Exemplar counts for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FewShotStats {
    pub exemplars: i64,
    pub distinct_situations: i64,
    pub total_uses: i64,
}

/// Semantic matcher over stored (text, action, situation) exemplars.
pub struct FewShotMatcher {
    store: Arc<EventStore>,
    provider: Arc<dyn EmbeddingProvider>,
    threshold: f64,
    embed_timeout: Duration,
}

impl FewShotMatcher {
    pub fn new(
        store: Arc<EventStore>,
        provider: Arc<dyn EmbeddingProvider>,
        threshold: f64,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            threshold,
            embed_timeout,
        }
    }

    /// Embed with the configured timeout. Any failure (provider error,
    /// timeout, empty vector) degrades to `None`; the matcher simply has no
    /// opinion without an embedding.
    async fn embed_bounded(&self, text: &str) -> Option<Vec<f32>> {
        match tokio::time::timeout(self.embed_timeout, self.provider.embed(text)).await {
            Ok(Ok(vector)) if !vector.is_empty() => Some(vector),
            Ok(Ok(_)) => {
                tracing::warn!("embedding provider returned an empty vector");
                None
            }
            Ok(Err(error)) => {
                tracing::warn!(%error, "embedding provider failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.embed_timeout.as_millis() as u64, "embedding call timed out");
                None
            }
        }
    }

    /// Store one exemplar, or bump the success counter of the existing row
    /// for this (situation, action). A dead embedding provider makes this a
    /// no-op rather than an error.
    pub async fn store_example(
        &self,
        text: &str,
        action: &str,
        situation: &str,
    ) -> Result<(), EngineError> {
        let Some(vector) = self.embed_bounded(text).await else {
            return Ok(());
        };

        let existing = sqlx::query_as::<_, (i64, i64)>(
            "SELECT id, success_count FROM exemplars WHERE situation = ? AND action = ?",
        )
        .bind(situation)
        .bind(action)
        .fetch_optional(self.store.pool())
        .await?;

        // Duplicate (situation, action): the original embedding stands, only
        // the counter moves.
        if let Some((id, count)) = existing {
            sqlx::query("UPDATE exemplars SET success_count = success_count + 1 WHERE id = ?")
                .bind(id)
                .execute(self.store.pool())
                .await?;
            tracing::debug!(situation, action, count = count + 1, "bumped exemplar");
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO exemplars (text, embedding, action, situation) VALUES (?, ?, ?, ?)",
        )
        .bind(text)
        .bind(vector_to_blob(&vector))
        .bind(action)
        .bind(situation)
        .execute(self.store.pool())
        .await?;
        tracing::debug!(situation, action, "stored new exemplar");
        Ok(())
    }

    /// Find the best-matching exemplar for the utterance, optionally
    /// restricted to one situation. Returns `None` when no exemplar clears
    /// the raw similarity threshold or the provider is unavailable.
    pub async fn predict(
        &self,
        text: &str,
        situation: Option<&str>,
    ) -> Result<Option<Prediction>, EngineError> {
        let Some(query) = self.embed_bounded(text).await else {
            return Ok(None);
        };

        let rows: Vec<(Vec<u8>, String, i64)> = match situation {
            Some(situation) => {
                sqlx::query_as(
                    "SELECT embedding, action, success_count FROM exemplars WHERE situation = ?",
                )
                .bind(situation)
                .fetch_all(self.store.pool())
                .await?
            }
            None => {
                sqlx::query_as("SELECT embedding, action, success_count FROM exemplars")
                    .fetch_all(self.store.pool())
                    .await?
            }
        };

        if rows.is_empty() {
            return Ok(None);
        }

        let mut best: Option<(String, f64, f64, i64)> = None; // action, raw, boosted, uses
        for (blob, action, success_count) in rows {
            let stored = blob_to_vector(&blob);
            let raw = cosine_similarity(&query, &stored);
            // Success history buys at most a 20% ranking boost.
            let boosted = raw * (1.0 + (success_count as f64 / 10.0).min(0.2));
            if best
                .as_ref()
                .map(|(_, _, top, _)| boosted > *top)
                .unwrap_or(true)
            {
                best = Some((action, raw, boosted, success_count));
            }
        }

        let Some((action, raw, _boosted, uses)) = best else {
            return Ok(None);
        };
        if raw < self.threshold {
            return Ok(None);
        }

        Ok(Some(Prediction::new(
            action,
            raw,
            StrategySource::FewShot,
            format!("semantic match to a remembered request ({:.0}% similar, confirmed {uses}x)", raw * 100.0),
        )))
    }

    pub async fn stats(&self) -> Result<FewShotStats, EngineError> {
        let (exemplars, distinct_situations, total_uses): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(DISTINCT situation), COALESCE(SUM(success_count), 0) \
             FROM exemplars",
        )
        .fetch_one(self.store.pool())
        .await?;
        Ok(FewShotStats {
            exemplars,
            distinct_situations,
            total_uses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingEmbedder, StubEmbedder};

    async fn matcher_with(provider: Arc<dyn EmbeddingProvider>) -> (Arc<EventStore>, FewShotMatcher) {
        let store = EventStore::in_memory().await.unwrap();
        let matcher = FewShotMatcher::new(
            store.clone(),
            provider,
            0.75,
            Duration::from_millis(500),
        );
        (store, matcher)
    }

    // -----------------------------------------------------------------------
    // Storage
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn duplicate_examples_bump_the_counter_once() {
        let (store, matcher) = matcher_with(Arc::new(StubEmbedder)).await;
        matcher
            .store_example("order my usual pizza", "food.order", "hungry")
            .await
            .unwrap();
        matcher
            .store_example("order my usual pizza", "food.order", "hungry")
            .await
            .unwrap();

        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT success_count FROM exemplars WHERE situation = 'hungry'")
                .fetch_all(store.pool())
                .await
                .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, 2);
    }

    #[tokio::test]
    async fn offline_provider_makes_storage_a_noop() {
        let (store, matcher) = matcher_with(Arc::new(FailingEmbedder)).await;
        matcher
            .store_example("order my usual pizza", "food.order", "hungry")
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM exemplars")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    // -----------------------------------------------------------------------
    // Prediction
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn identical_text_matches_with_full_confidence() {
        let (_store, matcher) = matcher_with(Arc::new(StubEmbedder)).await;
        matcher
            .store_example("order my usual pizza", "food.order", "hungry")
            .await
            .unwrap();

        let prediction = matcher
            .predict("order my usual pizza", Some("hungry"))
            .await
            .unwrap()
            .expect("match");
        assert_eq!(prediction.action, "food.order");
        assert!((prediction.confidence - 1.0).abs() < 1e-6);
        assert_eq!(prediction.source, StrategySource::FewShot);
    }

    #[tokio::test]
    async fn unrelated_text_stays_below_threshold() {
        let (_store, matcher) = matcher_with(Arc::new(StubEmbedder)).await;
        matcher
            .store_example("order my usual pizza", "food.order", "hungry")
            .await
            .unwrap();

        let prediction = matcher
            .predict("silence notifications tonight", Some("hungry"))
            .await
            .unwrap();
        assert!(prediction.is_none());
    }

    #[tokio::test]
    async fn situation_filter_hides_other_situations() {
        let (_store, matcher) = matcher_with(Arc::new(StubEmbedder)).await;
        matcher
            .store_example("order my usual pizza", "food.order", "hungry")
            .await
            .unwrap();

        let filtered = matcher
            .predict("order my usual pizza", Some("tired"))
            .await
            .unwrap();
        assert!(filtered.is_none());

        let unfiltered = matcher
            .predict("order my usual pizza", None)
            .await
            .unwrap();
        assert!(unfiltered.is_some());
    }

    #[tokio::test]
    async fn boost_ranks_but_raw_similarity_gates_and_reports() {
        let (store, matcher) = matcher_with(Arc::new(StubEmbedder)).await;
        // Two exemplars with identical text (so identical raw similarity to
        // the query) under different actions; one is heavily confirmed.
        sqlx::query(
            "INSERT INTO exemplars (text, embedding, action, situation, success_count) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind("open my mail")
        .bind(vector_to_blob(&StubEmbedder::encode("open my mail")))
        .bind("mail.open")
        .bind("catching_up")
        .bind(9_i64)
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO exemplars (text, embedding, action, situation, success_count) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind("open my mail")
        .bind(vector_to_blob(&StubEmbedder::encode("open my mail")))
        .bind("browser.open")
        .bind("catching_up")
        .bind(1_i64)
        .execute(store.pool())
        .await
        .unwrap();

        let prediction = matcher
            .predict("open my mail", Some("catching_up"))
            .await
            .unwrap()
            .expect("match");
        // The confirmed exemplar wins the ranking...
        assert_eq!(prediction.action, "mail.open");
        // ...but the reported confidence is the raw similarity, unboosted.
        assert!(prediction.confidence <= 1.0);
        assert!((prediction.confidence - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn throwing_provider_never_raises_from_predict() {
        let (store, matcher) = matcher_with(Arc::new(FailingEmbedder)).await;
        // An exemplar exists, but the provider is down.
        sqlx::query(
            "INSERT INTO exemplars (text, embedding, action, situation) VALUES (?, ?, ?, ?)",
        )
        .bind("order my usual pizza")
        .bind(vector_to_blob(&StubEmbedder::encode("order my usual pizza")))
        .bind("food.order")
        .bind("hungry")
        .execute(store.pool())
        .await
        .unwrap();

        for _ in 0..3 {
            let prediction = matcher.predict("order my usual pizza", None).await.unwrap();
            assert!(prediction.is_none());
        }
    }

    #[tokio::test]
    async fn stats_reflect_stored_exemplars() {
        let (_store, matcher) = matcher_with(Arc::new(StubEmbedder)).await;
        matcher
            .store_example("order my usual pizza", "food.order", "hungry")
            .await
            .unwrap();
        matcher
            .store_example("order my usual pizza", "food.order", "hungry")
            .await
            .unwrap();
        matcher
            .store_example("turn on do not disturb", "dnd.on", "tired")
            .await
            .unwrap();

        let stats = matcher.stats().await.unwrap();
        assert_eq!(stats.exemplars, 2);
        assert_eq!(stats.distinct_situations, 2);
        assert_eq!(stats.total_uses, 3);
    }
}
