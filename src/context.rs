//! Context snapshots and similarity scoring.
//!
//! A [`ContextSnapshot`] is produced by the host's context builder (time,
//! battery, active window, recent activity) and threaded through every
//! strategy. The weighted [`context_similarity`] score drives the historical
//! voter's nearest-neighbor retrieval.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TimeOfDay
// ---------------------------------------------------------------------------

/// Coarse time-of-day bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    /// Bucket boundaries: morning 05-12, afternoon 12-17, evening 17-21,
    /// night otherwise.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => Self::Morning,
            12..=16 => Self::Afternoon,
            17..=20 => Self::Evening,
            _ => Self::Night,
        }
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Morning => write!(f, "morning"),
            Self::Afternoon => write!(f, "afternoon"),
            Self::Evening => write!(f, "evening"),
            Self::Night => write!(f, "night"),
        }
    }
}

// ---------------------------------------------------------------------------
// ContextSnapshot
// ---------------------------------------------------------------------------

/// Structured snapshot of the environment at decision time.
///
/// Temporal fields are derived from `timestamp`; system and behavioral fields
/// are best-effort and may be absent on hosts without the corresponding
/// sensors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSnapshot {
    pub timestamp: DateTime<Utc>,
    pub hour: u32,
    pub minute: u32,
    /// Lowercase English weekday name ("monday" .. "sunday").
    pub day_of_week: String,
    pub is_weekend: bool,
    pub time_of_day: TimeOfDay,

    pub battery_percent: Option<i64>,
    pub is_charging: Option<bool>,
    pub memory_percent: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub active_window_title: Option<String>,
    pub active_window_process: Option<String>,

    /// Most recent action identifiers, newest last.
    #[serde(default)]
    pub recent_actions: Vec<String>,
    /// Situation label the intent classifier attached, if any.
    #[serde(default)]
    pub situation: Option<String>,
    /// Classifier confidence for `situation`.
    #[serde(default)]
    pub detection_confidence: Option<f64>,
}

impl ContextSnapshot {
    /// Build a snapshot at the given instant with temporal fields filled in
    /// and everything else absent.
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        let hour = timestamp.hour();
        let weekday = timestamp.weekday();
        Self {
            timestamp,
            hour,
            minute: timestamp.minute(),
            day_of_week: timestamp.format("%A").to_string().to_lowercase(),
            is_weekend: weekday.num_days_from_monday() >= 5,
            time_of_day: TimeOfDay::from_hour(hour),
            battery_percent: None,
            is_charging: None,
            memory_percent: None,
            cpu_percent: None,
            active_window_title: None,
            active_window_process: None,
            recent_actions: Vec::new(),
            situation: None,
            detection_confidence: None,
        }
    }

    /// Build a snapshot for the current instant.
    pub fn now() -> Self {
        Self::at(Utc::now())
    }
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

/// Weighted similarity between two contexts in [0, 1].
///
/// Weights: time-of-day match 0.3 (hour within 2 earns half credit),
/// day-of-week 0.2, weekend flag 0.1, battery closeness 0.1, situation
/// match 0.3. Missing battery readings earn no credit.
pub fn context_similarity(a: &ContextSnapshot, b: &ContextSnapshot) -> f64 {
    let mut score = 0.0;

    if a.time_of_day == b.time_of_day {
        score += 0.3;
    } else if (a.hour as i64 - b.hour as i64).abs() <= 2 {
        score += 0.15;
    }

    if a.day_of_week == b.day_of_week {
        score += 0.2;
    }

    if a.is_weekend == b.is_weekend {
        score += 0.1;
    }

    if let (Some(bat_a), Some(bat_b)) = (a.battery_percent, b.battery_percent) {
        let diff = (bat_a - bat_b).abs() as f64;
        score += 0.1 * (1.0 - diff / 100.0);
    }

    if a.situation.is_some() && a.situation == b.situation {
        score += 0.3;
    }

    score.clamp(0.0, 1.0)
}
