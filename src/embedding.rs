//! Embedding provider seam and vector math.
//!
//! The engine never embeds text itself; it calls an [`EmbeddingProvider`]
//! supplied by the host. The bundled [`HttpEmbedder`] speaks the common
//! `/embeddings` JSON shape (OpenAI-compatible servers, local inference
//! gateways) with a bounded request timeout. Vectors are stored as
//! little-endian `f32` BLOBs next to their exemplars.

use crate::EngineError;

use serde::Deserialize;

use std::time::Duration;

/// Produces fixed-dimension dense vectors for utterance text.
///
/// Implementations must be cheap to share; the matcher holds one behind an
/// `Arc` for the lifetime of the engine. A provider that is down should
/// return an error promptly, never block indefinitely.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

/// Embedding client for an OpenAI-style `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpEmbedder {
    /// Build a client with a hard per-request timeout.
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| EngineError::Embedding(error.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|error| EngineError::Embedding(error.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Embedding(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| EngineError::Embedding(error.to_string()))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .filter(|vector| !vector.is_empty())
            .ok_or_else(|| EngineError::Embedding("empty embedding response".into()))
    }
}

// ---------------------------------------------------------------------------
// Vector math and storage codec
// ---------------------------------------------------------------------------

/// Cosine similarity in [-1, 1]. Zero when either vector has zero norm or
/// the dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Encode a vector as little-endian `f32` bytes for BLOB storage.
pub(crate) fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a BLOB back into a vector. Trailing partial floats are dropped.
pub(crate) fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
