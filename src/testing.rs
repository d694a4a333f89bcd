//! Shared test helpers: deterministic embedders and context factories.

use crate::context::ContextSnapshot;
use crate::embedding::EmbeddingProvider;
use crate::EngineError;

use chrono::{TimeZone, Utc};

/// Snapshot at a fixed UTC date and hour, no system signals.
pub(crate) fn snapshot_at(year: i32, month: u32, day: u32, hour: u32) -> ContextSnapshot {
    ContextSnapshot::at(Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap())
}

/// Deterministic embedder: each whitespace token is hashed into one of 32
/// buckets. Identical texts embed identically; texts with disjoint tokens
/// are (near-)orthogonal.
pub(crate) struct StubEmbedder;

impl StubEmbedder {
    pub(crate) fn encode(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; 32];
        for token in text.to_lowercase().split_whitespace() {
            let bucket = token.bytes().fold(0usize, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(b as usize)
            }) % 32;
            vector[bucket] += 1.0;
        }
        vector
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        Ok(Self::encode(text))
    }
}

/// Embedder that fails on every call, as if the provider were offline.
pub(crate) struct FailingEmbedder;

#[async_trait::async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EngineError> {
        Err(EngineError::Embedding("provider offline".into()))
    }
}
