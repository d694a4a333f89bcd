//! Historical voter: k-nearest-neighbor prediction over past successes.
//!
//! Each similar record is scored by context similarity times a 30-day
//! recency decay; the top k vote for an action with their scores, and the
//! winner's parameters are rebuilt per key from the modal value across the
//! winning votes. Also detects trailing workflow patterns in the recent
//! action stream.

use crate::context::{context_similarity, ContextSnapshot};
use crate::store::EventStore;
use crate::types::{ActionParams, Prediction, StrategySource, WorkflowSuggestion};
use crate::EngineError;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use std::collections::HashMap;
use std::sync::Arc;

/// Fewer similar records than this and the voter abstains.
const MIN_SAMPLE: usize = 3;
/// Gap (seconds) that splits the action stream into separate sequences.
const SEQUENCE_GAP_SECS: i64 = 600;
/// Context similarity floor for parameter optimization donors.
const PARAM_DONOR_SIMILARITY: f64 = 0.6;

/// One scored historical vote.
struct Vote {
    action: String,
    params: ActionParams,
    score: f64,
}

/// k-NN predictor over the action history.
pub struct HistoryVoter {
    store: Arc<EventStore>,
    k: usize,
    min_confidence: f64,
    workflow_min_occurrences: usize,
}

impl HistoryVoter {
    pub fn new(
        store: Arc<EventStore>,
        k: usize,
        min_confidence: f64,
        workflow_min_occurrences: usize,
    ) -> Self {
        Self {
            store,
            k,
            min_confidence,
            workflow_min_occurrences,
        }
    }

    /// Predict an action for the situation from contextually similar past
    /// successes. Abstains (returns `None`) with fewer than three similar
    /// records or when the vote confidence misses the floor.
    pub async fn predict(
        &self,
        situation: &str,
        context: &ContextSnapshot,
    ) -> Result<Option<Prediction>, EngineError> {
        let records = self
            .store
            .query_similar(context, situation, self.k * 2)
            .await?;
        if records.len() < MIN_SAMPLE {
            return Ok(None);
        }

        let now = Utc::now();
        let mut votes: Vec<Vote> = Vec::with_capacity(records.len());
        for record in &records {
            // Rows whose snapshot can no longer be decoded are skipped, not
            // treated as errors.
            let Some(past) = record.context_snapshot() else {
                continue;
            };
            let Ok(timestamp) = DateTime::parse_from_rfc3339(&record.timestamp) else {
                continue;
            };
            let days_ago = (now - timestamp.with_timezone(&Utc)).num_days().max(0);
            let recency = 1.0 / (1.0 + days_ago as f64 / 30.0);
            let similarity = context_similarity(context, &past);
            let score = similarity * recency * record.outcome as f64;

            votes.push(Vote {
                action: record.action.clone(),
                params: record.params_map(),
                score,
            });
        }
        if votes.is_empty() {
            return Ok(None);
        }

        votes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        votes.truncate(self.k);

        // Sum scores per action.
        let mut tallies: HashMap<&str, f64> = HashMap::new();
        for vote in &votes {
            *tallies.entry(vote.action.as_str()).or_insert(0.0) += vote.score;
        }
        let (winner, total_score) = tallies
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .expect("votes are non-empty");

        let confidence = (total_score / self.k as f64).min(1.0);
        if confidence < self.min_confidence {
            return Ok(None);
        }

        let winner = winner.to_string();
        let supporting: Vec<&Vote> = votes.iter().filter(|vote| vote.action == winner).collect();
        let params = modal_params(supporting.iter().map(|vote| &vote.params));
        let count = supporting.len();
        let k = self.k;

        Ok(Some(
            Prediction::new(
                winner,
                confidence,
                StrategySource::History,
                format!("chosen {count} of the last {k} times in similar contexts"),
            )
            .with_params(params),
        ))
    }

    /// Detect a workflow continuation: does the trailing 2-action pattern of
    /// `recent_actions` appear in history often enough to suggest what comes
    /// next?
    pub async fn detect_workflow(
        &self,
        recent_actions: &[String],
    ) -> Result<Option<WorkflowSuggestion>, EngineError> {
        if recent_actions.len() < 2 {
            return Ok(None);
        }

        // Newest-first stream of recent successes.
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT action, timestamp FROM action_history \
             WHERE outcome = 1 ORDER BY timestamp DESC LIMIT 100",
        )
        .fetch_all(self.store.pool())
        .await?;

        // Split into chronological sequences on >10-minute gaps.
        let mut sequences: Vec<Vec<String>> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut last_time: Option<DateTime<Utc>> = None;
        for (action, timestamp) in &rows {
            let Ok(ts) = DateTime::parse_from_rfc3339(timestamp) else {
                continue;
            };
            let ts = ts.with_timezone(&Utc);
            if let Some(last) = last_time {
                if (last - ts).num_seconds() > SEQUENCE_GAP_SECS {
                    if current.len() >= 3 {
                        current.reverse();
                        sequences.push(std::mem::take(&mut current));
                    } else {
                        current.clear();
                    }
                }
            }
            current.push(action.clone());
            last_time = Some(ts);
        }
        if current.len() >= 3 {
            current.reverse();
            sequences.push(current);
        }

        let pattern: Vec<String> = recent_actions[recent_actions.len() - 2..].to_vec();
        let mut followers: Vec<&str> = Vec::new();
        for sequence in &sequences {
            for window_start in 0..sequence.len().saturating_sub(2) {
                if sequence[window_start..window_start + 2] == pattern[..] {
                    followers.push(sequence[window_start + 2].as_str());
                }
            }
        }
        if followers.len() < self.workflow_min_occurrences {
            return Ok(None);
        }

        // Modal follower; ties keep the follower seen first.
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for follower in followers.iter().copied() {
            match counts.iter_mut().find(|(action, _)| *action == follower) {
                Some((_, count)) => *count += 1,
                None => counts.push((follower, 1)),
            }
        }
        let mut winner: Option<(&str, usize)> = None;
        for (action, count) in counts {
            if winner.map(|(_, best)| count > best).unwrap_or(true) {
                winner = Some((action, count));
            }
        }
        let (next_action, occurrences) = winner.expect("followers are non-empty");

        Ok(Some(WorkflowSuggestion {
            pattern,
            next_action: next_action.to_string(),
            confidence: occurrences as f64 / followers.len() as f64,
            occurrences,
        }))
    }

    /// Refine default parameters for an action from recent successful uses in
    /// similar contexts. Falls back to the defaults with fewer than three
    /// past uses or no sufficiently similar donor.
    pub async fn optimize_params(
        &self,
        action: &str,
        context: &ContextSnapshot,
        defaults: ActionParams,
    ) -> Result<ActionParams, EngineError> {
        let records = sqlx::query_as::<_, (Option<String>, String)>(
            "SELECT params, context FROM action_history \
             WHERE action = ? AND outcome = 1 \
             ORDER BY timestamp DESC LIMIT 20",
        )
        .bind(action)
        .fetch_all(self.store.pool())
        .await?;
        if records.len() < MIN_SAMPLE {
            return Ok(defaults);
        }

        let mut donors: Vec<ActionParams> = Vec::new();
        for (params, context_json) in &records {
            let Ok(past) = serde_json::from_str::<ContextSnapshot>(context_json) else {
                continue;
            };
            if context_similarity(context, &past) > PARAM_DONOR_SIMILARITY {
                let map = params
                    .as_deref()
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or_default();
                donors.push(map);
            }
        }
        if donors.is_empty() {
            return Ok(defaults);
        }
        Ok(modal_params(donors.iter()))
    }
}

/// Per-key modal value across parameter maps. Ties keep the value seen
/// first, which favors higher-scored votes upstream.
fn modal_params<'a>(maps: impl Iterator<Item = &'a ActionParams>) -> ActionParams {
    let mut counts: HashMap<String, Vec<(JsonValue, usize)>> = HashMap::new();
    for map in maps {
        for (key, value) in map {
            let entry = counts.entry(key.clone()).or_default();
            match entry.iter_mut().find(|(seen, _)| seen == value) {
                Some((_, count)) => *count += 1,
                None => entry.push((value.clone(), 1)),
            }
        }
    }

    let mut result = ActionParams::new();
    for (key, values) in counts {
        let mut best: Option<(JsonValue, usize)> = None;
        for (value, count) in values {
            if best.as_ref().map(|(_, top)| count > *top).unwrap_or(true) {
                best = Some((value, count));
            }
        }
        if let Some((value, _)) = best {
            result.insert(key, value);
        }
    }
    result
}
