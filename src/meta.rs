//! Transfer learner: bootstraps novel situations from behaviorally similar ones.
//!
//! Situation names are compared by Jaccard overlap of their underscore
//! tokens; a well-established source situation lends its best actions to the
//! target at a discounted confidence, never above 0.9. Every transfer is
//! appended to an audit trail.

use crate::store::EventStore;
use crate::types::{Prediction, StrategySource};
use crate::EngineError;

use sqlx::Row as _;

use std::collections::HashSet;
use std::sync::Arc;

/// Minimum successful occurrences before a situation can act as a source.
const MIN_SOURCE_OCCURRENCES: i64 = 3;
/// Source actions must clear this historical success rate.
const MIN_SOURCE_SUCCESS_RATE: f64 = 0.7;
/// Source actions must have run at least this often.
const MIN_SOURCE_FREQUENCY: i64 = 2;
/// Transferred knowledge is always discounted below this cap.
const TRANSFER_CONFIDENCE_CAP: f64 = 0.9;

/// Transfer audit counters.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStats {
    pub total_transfers: i64,
    pub distinct_targets: i64,
    pub avg_confidence: f64,
}

/// Cross-situation transfer of learned action preferences.
pub struct TransferLearner {
    store: Arc<EventStore>,
    similarity_threshold: f64,
}

impl TransferLearner {
    pub fn new(store: Arc<EventStore>, similarity_threshold: f64) -> Self {
        Self {
            store,
            similarity_threshold,
        }
    }

    /// Situations similar to `target`, scored by token Jaccard overlap and
    /// sorted best first. Only situations with at least three successful
    /// occurrences qualify.
    pub async fn similar_situations(
        &self,
        target: &str,
    ) -> Result<Vec<(String, f64)>, EngineError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT situation, COUNT(*) AS freq FROM action_history \
             WHERE situation != ? AND outcome = 1 \
             GROUP BY situation HAVING freq >= ?",
        )
        .bind(target)
        .bind(MIN_SOURCE_OCCURRENCES)
        .fetch_all(self.store.pool())
        .await?;

        let target_tokens = tokenize(target);
        let mut similar: Vec<(String, f64)> = Vec::new();
        for (situation, _freq) in rows {
            let tokens = tokenize(&situation);
            let overlap = target_tokens.intersection(&tokens).count();
            if overlap == 0 {
                continue;
            }
            let union = target_tokens.union(&tokens).count();
            let similarity = overlap as f64 / union as f64;
            if similarity >= self.similarity_threshold {
                similar.push((situation, similarity));
            }
        }
        similar.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(similar)
    }

    /// Transfer the top actions of `source` to `target`.
    ///
    /// Eligible actions have success rate above 0.7 and at least two runs;
    /// the top three (by rate, then frequency) move over at a discounted
    /// confidence `min(rate * 0.8 + min(freq / 10, 0.15), 0.9)`. Each
    /// transfer is logged to the audit trail.
    pub async fn transfer(
        &self,
        source: &str,
        target: &str,
    ) -> Result<Vec<Prediction>, EngineError> {
        let rows = sqlx::query(
            "SELECT action, COUNT(*) AS freq, \
                    AVG(CASE WHEN outcome = 1 THEN 1.0 ELSE 0.0 END) AS success_rate \
             FROM action_history WHERE situation = ? \
             GROUP BY action \
             HAVING success_rate > ? AND freq >= ? \
             ORDER BY success_rate DESC, freq DESC \
             LIMIT 3",
        )
        .bind(source)
        .bind(MIN_SOURCE_SUCCESS_RATE)
        .bind(MIN_SOURCE_FREQUENCY)
        .fetch_all(self.store.pool())
        .await?;

        let mut transferred = Vec::with_capacity(rows.len());
        for row in rows {
            let action: String = row.try_get("action")?;
            let freq: i64 = row.try_get("freq")?;
            let success_rate: f64 = row.try_get("success_rate")?;

            let confidence = (success_rate * 0.8 + (freq as f64 / 10.0).min(0.15))
                .min(TRANSFER_CONFIDENCE_CAP);

            sqlx::query(
                "INSERT INTO transfers (id, source_situation, target_situation, action, confidence) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(source)
            .bind(target)
            .bind(&action)
            .bind(confidence)
            .execute(self.store.pool())
            .await?;

            transferred.push(Prediction::new(
                action,
                confidence,
                StrategySource::Transfer,
                format!("borrowed from the similar situation '{source}'"),
            ));
        }

        if !transferred.is_empty() {
            tracing::info!(
                count = transferred.len(),
                source,
                target,
                "transferred action preferences"
            );
        }
        Ok(transferred)
    }

    /// Bootstrap a situation with no history of its own: transfer from the
    /// single most similar situation and return the best transferred
    /// prediction, annotated with the situation similarity.
    pub async fn bootstrap(&self, situation: &str) -> Result<Option<Prediction>, EngineError> {
        let similar = self.similar_situations(situation).await?;
        let Some((source, similarity)) = similar.into_iter().next() else {
            return Ok(None);
        };

        let mut transferred = self.transfer(&source, situation).await?;
        if transferred.is_empty() {
            return Ok(None);
        }
        let mut best = transferred.remove(0);
        best.reason = format!("{} (situation similarity {similarity:.2})", best.reason);
        Ok(Some(best))
    }

    pub async fn stats(&self) -> Result<TransferStats, EngineError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COUNT(DISTINCT target_situation) AS targets, \
                    COALESCE(AVG(confidence), 0.0) AS avg_confidence \
             FROM transfers",
        )
        .fetch_one(self.store.pool())
        .await?;
        Ok(TransferStats {
            total_transfers: row.try_get("total")?,
            distinct_targets: row.try_get("targets")?,
            avg_confidence: row.try_get("avg_confidence")?,
        })
    }
}

/// Lowercased underscore tokens of a situation name.
fn tokenize(situation: &str) -> HashSet<String> {
    situation
        .to_lowercase()
        .split('_')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}
