//! EventStore: the shared SQLite handle behind every strategy.
//!
//! Owns the connection pool, the embedded schema, and the append-only action
//! history. Strategy modules run their own queries against their own tables
//! through [`EventStore::pool`]; the generic history operations live here.

use crate::context::ContextSnapshot;
use crate::types::{ActionParams, ActionRecord, ActionStats, LearningStats, Outcome};
use crate::EngineError;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Columns selected whenever a full [`ActionRecord`] is materialized.
const RECORD_COLUMNS: &str = "id, timestamp, hour, day_of_week, is_weekend, time_of_day, \
     battery_percent, situation, action, params, outcome, duration_ms, context";

/// Wraps a dedicated SQLite connection pool for the engine's database.
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Connect to (or create) the database at the given path.
    ///
    /// Runs the embedded schema, enables WAL mode, and configures a small
    /// pool (one writer, one reader).
    pub async fn connect(path: &Path) -> Result<Arc<Self>, EngineError> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|error| EngineError::Engine(format!("invalid db path: {error}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Arc::new(Self { pool }))
    }

    /// In-memory store for tests and ephemeral hosts.
    ///
    /// Pinned to a single connection that is never recycled; dropping the
    /// last connection would drop the database with it.
    pub async fn in_memory() -> Result<Arc<Self>, EngineError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|error| EngineError::Engine(format!("invalid db url: {error}")))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Arc::new(Self { pool }))
    }

    /// Run the embedded schema. All statements use `IF NOT EXISTS` so
    /// re-running is safe.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), EngineError> {
        sqlx::raw_sql(SCHEMA).execute(pool).await?;
        Ok(())
    }

    /// Expose the pool for strategy modules that own their tables.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- Action history -----------------------------------------------------

    /// Append one action record. Returns the new row id.
    ///
    /// Durable immediately; there is no write buffering. Callers on the
    /// decision hot path catch and log failures rather than propagating.
    pub async fn record(
        &self,
        context: &ContextSnapshot,
        situation: &str,
        action: &str,
        params: &ActionParams,
        outcome: Outcome,
        duration_ms: i64,
    ) -> Result<i64, EngineError> {
        let params_json = if params.is_empty() {
            None
        } else {
            Some(serde_json::to_string(params).unwrap_or_else(|_| "{}".into()))
        };
        let context_json = serde_json::to_string(context)
            .map_err(|error| EngineError::Engine(format!("unserializable context: {error}")))?;

        let result = sqlx::query(
            "INSERT INTO action_history (timestamp, hour, day_of_week, is_weekend, time_of_day, \
             battery_percent, situation, action, params, outcome, duration_ms, context) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(context.timestamp.to_rfc3339())
        .bind(context.hour as i64)
        .bind(&context.day_of_week)
        .bind(context.is_weekend)
        .bind(context.time_of_day.to_string())
        .bind(context.battery_percent)
        .bind(situation)
        .bind(action)
        .bind(params_json)
        .bind(outcome.code())
        .bind(duration_ms)
        .bind(context_json)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Successful records for a situation, ranked by contextual closeness:
    /// exact time-of-day match, then hour proximity within 2, then matching
    /// weekend flag, newest first within each band.
    pub async fn query_similar(
        &self,
        context: &ContextSnapshot,
        situation: &str,
        limit: usize,
    ) -> Result<Vec<ActionRecord>, EngineError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM action_history \
             WHERE situation = ? AND outcome = 1 \
             ORDER BY CASE \
                 WHEN time_of_day = ? THEN 3 \
                 WHEN ABS(hour - ?) <= 2 THEN 2 \
                 WHEN is_weekend = ? THEN 1 \
                 ELSE 0 END DESC, \
                 timestamp DESC \
             LIMIT ?"
        );
        let records = sqlx::query_as::<_, ActionRecord>(&sql)
            .bind(situation)
            .bind(context.time_of_day.to_string())
            .bind(context.hour as i64)
            .bind(context.is_weekend)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    /// Aggregate statistics for one (situation, action) pair.
    pub async fn aggregate(
        &self,
        situation: &str,
        action: &str,
    ) -> Result<ActionStats, EngineError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COALESCE(SUM(CASE WHEN outcome = 1 THEN 1 ELSE 0 END), 0) AS successes, \
                    COALESCE(AVG(CASE WHEN outcome = 1 THEN duration_ms ELSE NULL END), 0.0) AS avg_duration_ms \
             FROM action_history WHERE situation = ? AND action = ?",
        )
        .bind(situation)
        .bind(action)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let successes: i64 = row.try_get("successes")?;
        let avg_duration_ms: f64 = row.try_get("avg_duration_ms")?;

        Ok(ActionStats {
            total,
            successes,
            success_rate: if total > 0 {
                successes as f64 / total as f64
            } else {
                0.0
            },
            avg_duration_ms,
        })
    }

    /// Most recent actions, newest first: (action, timestamp, situation).
    pub async fn recent_actions(
        &self,
        limit: usize,
    ) -> Result<Vec<(String, String, String)>, EngineError> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT action, timestamp, situation FROM action_history \
             ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Successful occurrences of a (situation, action) pair within a trailing
    /// window of days.
    pub async fn pattern_frequency(
        &self,
        situation: &str,
        action: &str,
        window_days: i64,
    ) -> Result<i64, EngineError> {
        let since = (Utc::now() - ChronoDuration::days(window_days)).to_rfc3339();
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM action_history \
             WHERE situation = ? AND action = ? AND outcome = 1 AND timestamp >= ?",
        )
        .bind(situation)
        .bind(action)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Delete history older than the retention window and reclaim space.
    /// Returns the number of deleted rows.
    pub async fn prune(&self, retention_days: i64) -> Result<u64, EngineError> {
        let cutoff = (Utc::now() - ChronoDuration::days(retention_days)).to_rfc3339();
        let result = sqlx::query("DELETE FROM action_history WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Store-wide learning statistics.
    pub async fn learning_stats(&self) -> Result<LearningStats, EngineError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total_actions, \
                    COUNT(DISTINCT situation) AS distinct_situations, \
                    COUNT(DISTINCT action) AS distinct_actions, \
                    COALESCE(SUM(CASE WHEN outcome = 1 THEN 1 ELSE 0 END), 0) AS successes, \
                    COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms \
             FROM action_history",
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total_actions")?;
        let successes: i64 = row.try_get("successes")?;

        Ok(LearningStats {
            total_actions: total,
            distinct_situations: row.try_get("distinct_situations")?,
            distinct_actions: row.try_get("distinct_actions")?,
            success_rate: if total > 0 {
                successes as f64 / total as f64
            } else {
                0.0
            },
            avg_duration_ms: row.try_get("avg_duration_ms")?,
        })
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

/// Embedded schema.
///
/// One append-only history table plus the three derived learning tables. All
/// statements use `IF NOT EXISTS` so re-running is safe.
const SCHEMA: &str = r#"
-- Append-only action history
CREATE TABLE IF NOT EXISTS action_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    hour INTEGER NOT NULL,
    day_of_week TEXT NOT NULL,
    is_weekend INTEGER NOT NULL,
    time_of_day TEXT NOT NULL,
    battery_percent INTEGER,
    situation TEXT NOT NULL,
    action TEXT NOT NULL,
    params TEXT,
    outcome INTEGER NOT NULL DEFAULT 1,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    context TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_history_situation ON action_history(situation);
CREATE INDEX IF NOT EXISTS idx_history_hour ON action_history(hour);
CREATE INDEX IF NOT EXISTS idx_history_dow ON action_history(day_of_week);
CREATE INDEX IF NOT EXISTS idx_history_timestamp ON action_history(timestamp);

-- Value table (state fingerprint x action -> learned value)
CREATE TABLE IF NOT EXISTS value_table (
    state_hash TEXT NOT NULL,
    action TEXT NOT NULL,
    value REAL NOT NULL,
    update_count INTEGER NOT NULL DEFAULT 1,
    last_updated TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (state_hash, action)
);

-- Few-shot exemplars with parallel embedding storage
CREATE TABLE IF NOT EXISTS exemplars (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    action TEXT NOT NULL,
    situation TEXT NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_exemplars_situation ON exemplars(situation);

-- Transfer audit trail (append-only)
CREATE TABLE IF NOT EXISTS transfers (
    id TEXT PRIMARY KEY,
    source_situation TEXT NOT NULL,
    target_situation TEXT NOT NULL,
    action TEXT NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_transfers_target ON transfers(target_situation);
"#;
