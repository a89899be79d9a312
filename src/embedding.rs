//! Embedding gateway abstraction and the OpenAI-compatible implementation.
//!
//! The engine never computes embeddings itself; it depends on an external
//! provider through [`EmbeddingGateway`]. The bundled implementation speaks
//! the OpenAI `POST /embeddings` wire format, which also covers compatible
//! endpoints (DashScope, Azure, local servers) via `base_url`.
//!
//! Vectors are stored as little-endian `f32` BLOBs in SQLite; similarity is
//! cosine, and the same gateway must be used at index-build time and query
//! time — mixing models silently degrades search.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately as permanent
//! - Network errors and timeouts → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::config::EmbeddingConfig;
use crate::error::GatewayError;

/// External capability converting text batches into fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError>;
}

/// Build the configured gateway. Errors when the provider is misconfigured;
/// the `"disabled"` provider is valid and fails every embed call, which the
/// retriever reports as `RetrievalUnavailable`.
pub fn create_embedding_gateway(
    config: &EmbeddingConfig,
) -> anyhow::Result<std::sync::Arc<dyn EmbeddingGateway>> {
    match config.provider.as_str() {
        "disabled" => Ok(std::sync::Arc::new(DisabledEmbedding)),
        "openai" => Ok(std::sync::Arc::new(OpenAiEmbedding::new(config)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled gateway ============

/// Gateway used when embeddings are not configured; every call fails with
/// a permanent error so callers surface "retrieval unavailable" rather than
/// silently returning nothing.
pub struct DisabledEmbedding;

#[async_trait]
impl EmbeddingGateway for DisabledEmbedding {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        Err(GatewayError::Permanent(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI-compatible gateway ============

/// Embedding gateway speaking the OpenAI embeddings API.
pub struct OpenAiEmbedding {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiEmbedding {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for openai provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for openai provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingGateway for OpenAiEmbedding {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let started = Instant::now();
        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            let err = match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            GatewayError::Transient(format!("invalid embeddings response: {}", e))
                        })?;
                        let vectors = parse_embeddings_response(&json)?;
                        tracing::debug!(
                            target: "gateway",
                            kind = "embedding",
                            model = %self.model,
                            batch = texts.len(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            outcome = "ok",
                        );
                        return Ok(vectors);
                    }

                    let text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 {
                        GatewayError::RateLimited(text)
                    } else if status.is_server_error() {
                        GatewayError::Transient(format!("{}: {}", status, text))
                    } else {
                        let err = GatewayError::Permanent(format!("{}: {}", status, text));
                        tracing::warn!(
                            target: "gateway",
                            kind = "embedding",
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            outcome = "permanent",
                            error = %err,
                        );
                        return Err(err);
                    }
                }
                Err(e) if e.is_timeout() => GatewayError::Timeout(e.to_string()),
                Err(e) => GatewayError::Transient(e.to_string()),
            };

            last_err = Some(err);
        }

        let err = last_err
            .unwrap_or_else(|| GatewayError::Transient("embedding retries exhausted".to_string()));
        tracing::warn!(
            target: "gateway",
            kind = "embedding",
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = "exhausted",
            error = %err,
        );
        Err(err)
    }
}

/// Extract `data[].embedding` arrays from the wire response, in input order.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, GatewayError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| GatewayError::Transient("missing data array in response".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| GatewayError::Transient("missing embedding in response".to_string()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

// ============ Vector codecs ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors, in [-1, 1].
///
/// Returns 0.0 for empty vectors or mismatched lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn parse_response_preserves_order() {
        let json = serde_json::json!({
            "data": [
                { "embedding": [1.0, 0.0] },
                { "embedding": [0.0, 1.0] },
            ]
        });
        let vecs = parse_embeddings_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn disabled_gateway_always_fails() {
        let gw = DisabledEmbedding;
        let err = gw.embed(&["hi".to_string()]).await.unwrap_err();
        assert!(matches!(err, GatewayError::Permanent(_)));
    }
}
