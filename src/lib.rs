//! Adaptive action selection engine for a personal desktop assistant.
//!
//! Given a detected situation (e.g. "hungry", "tired") and a snapshot of the
//! current context, the engine picks the best next action by running a layered
//! pipeline of strategies in strict priority order: reinforcement values,
//! few-shot semantic matching, cross-situation transfer, and historical k-NN
//! voting, with a human-in-the-loop fallback when nothing is confident. Every
//! outcome is persisted to a dedicated SQLite event log so each decision
//! improves the next one.
//!
//! All processing is fail-open: a strategy that errors or whose collaborator
//! is unavailable degrades to "no opinion" and the pipeline moves on. Nothing
//! in this crate raises an unhandled error up to the host.

pub mod active;
pub mod config;
pub mod context;
pub mod embedding;
pub mod engine;
pub mod fewshot;
pub mod meta;
pub mod reinforcement;
pub mod store;
pub mod types;
pub mod voter;

#[cfg(test)]
pub(crate) mod testing;

pub use active::ActiveLearner;
pub use config::EngineConfig;
pub use context::{context_similarity, ContextSnapshot, TimeOfDay};
pub use embedding::{cosine_similarity, EmbeddingProvider, HttpEmbedder};
pub use engine::{DecisionEngine, EngineStats};
pub use fewshot::{FewShotMatcher, FewShotStats};
pub use meta::{TransferLearner, TransferStats};
pub use reinforcement::{state_fingerprint, ValueLearner, ValueStats};
pub use store::EventStore;
pub use types::{
    ActionParams, ActionRecord, ActionStats, LearningStats, Outcome, Prediction,
    StrategySource, WorkflowSuggestion,
};
pub use voter::HistoryVoter;

use thiserror::Error;

/// Engine errors.
///
/// These surface only from internal plumbing; every public decision operation
/// flattens them into "no confident prediction" after logging.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("event store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
