//! Data types shared across the decision strategies.

use crate::context::ContextSnapshot;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Opaque key-value parameters attached to an action.
pub type ActionParams = serde_json::Map<String, JsonValue>;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of an executed action, as reported by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Canceled,
}

impl Outcome {
    /// Numeric encoding used in the action history table.
    pub fn code(self) -> i64 {
        match self {
            Self::Success => 1,
            Self::Failure => 0,
            Self::Canceled => -1,
        }
    }

    /// Decode from the numeric column, defaulting to Failure.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Success,
            -1 => Self::Canceled,
            _ => Self::Failure,
        }
    }

    /// Fixed reward mapping for the value learner.
    pub fn reward(self) -> f64 {
        match self {
            Self::Success => 1.0,
            Self::Failure => -0.5,
            Self::Canceled => -1.0,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

// ---------------------------------------------------------------------------
// StrategySource
// ---------------------------------------------------------------------------

/// Which strategy produced a prediction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategySource {
    Reinforcement,
    FewShot,
    Transfer,
    History,
    UserTaught,
}

impl std::fmt::Display for StrategySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reinforcement => write!(f, "reinforcement"),
            Self::FewShot => write!(f, "few_shot"),
            Self::Transfer => write!(f, "transfer"),
            Self::History => write!(f, "history"),
            Self::UserTaught => write!(f, "user_taught"),
        }
    }
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

/// A candidate next action with a calibrated confidence.
///
/// Transient; predictions are never persisted. When `ask_user` is set the
/// orchestrator could not clear any confidence gate and `options` carries the
/// ranked candidates for a disambiguation prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    /// Identifier of the action to execute (e.g. "web.search").
    pub action: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Parameters to execute the action with.
    pub params: ActionParams,
    /// Strategy that produced this prediction.
    pub source: StrategySource,
    /// Human-readable justification.
    pub reason: String,
    /// Whether the host should surface a disambiguation prompt.
    pub ask_user: bool,
    /// Ranked candidates for the prompt, highest confidence first.
    pub options: Vec<Prediction>,
}

impl Prediction {
    /// Build a prediction with clamped confidence and no parameters.
    pub fn new(
        action: impl Into<String>,
        confidence: f64,
        source: StrategySource,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            confidence: confidence.clamp(0.0, 1.0),
            params: ActionParams::new(),
            source,
            reason: reason.into(),
            ask_user: false,
            options: Vec::new(),
        }
    }

    /// Attach parameters, consuming self.
    pub fn with_params(mut self, params: ActionParams) -> Self {
        self.params = params;
        self
    }
}

// ---------------------------------------------------------------------------
// ActionRecord
// ---------------------------------------------------------------------------

/// One row of the append-only action history.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActionRecord {
    pub id: i64,
    /// RFC 3339 timestamp of when the action ran.
    pub timestamp: String,
    pub hour: i64,
    pub day_of_week: String,
    pub is_weekend: bool,
    pub time_of_day: String,
    pub battery_percent: Option<i64>,
    pub situation: String,
    pub action: String,
    /// JSON-encoded action parameters, if any.
    pub params: Option<String>,
    /// 1 = success, 0 = failure, -1 = canceled.
    pub outcome: i64,
    pub duration_ms: i64,
    /// JSON-encoded full context snapshot.
    pub context: String,
}

impl ActionRecord {
    /// Decode the stored parameters, returning an empty map on malformed rows.
    pub fn params_map(&self) -> ActionParams {
        self.params
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    /// Decode the stored context snapshot. `None` if the row predates the
    /// current snapshot shape and cannot be read.
    pub fn context_snapshot(&self) -> Option<ContextSnapshot> {
        serde_json::from_str(&self.context).ok()
    }
}

// ---------------------------------------------------------------------------
// Derived statistics
// ---------------------------------------------------------------------------

/// Aggregate statistics for one (situation, action) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStats {
    pub total: i64,
    pub successes: i64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

/// Store-wide learning statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningStats {
    pub total_actions: i64,
    pub distinct_situations: i64,
    pub distinct_actions: i64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

/// A detected workflow continuation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSuggestion {
    /// The trailing action pattern that matched.
    pub pattern: Vec<String>,
    /// Modal next action observed after the pattern.
    pub next_action: String,
    /// Share of pattern matches that continued with `next_action`.
    pub confidence: f64,
    /// How many matches continued with `next_action`.
    pub occurrences: usize,
}
