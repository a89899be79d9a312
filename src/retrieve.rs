//! Query-time retrieval over the vector index.
//!
//! Distinguishes "no relevant knowledge" (a normal, answerable outcome)
//! from "retrieval broken" (embedding gateway down, index unreadable),
//! which callers surface as a degraded-service message instead of risking
//! an ungrounded answer.

use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingGateway;
use crate::error::RetrieveError;
use crate::index::VectorIndex;
use crate::models::RetrievedChunk;

/// Result of a retrieval pass for one query.
#[derive(Debug)]
pub enum RetrievalOutcome {
    /// At least one chunk cleared the relevance threshold, best-first.
    Grounded(Vec<RetrievedChunk>),
    /// Retrieval ran fine; nothing in the knowledge base is relevant.
    NoMatch,
}

#[derive(Clone)]
pub struct Retriever {
    config: RetrievalConfig,
    embedder: Arc<dyn EmbeddingGateway>,
    index: VectorIndex,
}

impl Retriever {
    pub fn new(
        config: RetrievalConfig,
        embedder: Arc<dyn EmbeddingGateway>,
        index: VectorIndex,
    ) -> Self {
        Self {
            config,
            embedder,
            index,
        }
    }

    /// Retrieve the most relevant chunks for `query`.
    pub async fn retrieve(&self, query: &str) -> Result<RetrievalOutcome, RetrieveError> {
        let started = std::time::Instant::now();

        let mut vectors = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(|e| RetrieveError::Unavailable(format!("query embedding: {}", e)))?;
        if vectors.is_empty() {
            return Err(RetrieveError::Unavailable(
                "embedding gateway returned no vector for the query".to_string(),
            ));
        }
        let query_vec = vectors.swap_remove(0);

        let hits = self
            .index
            .search(&query_vec, self.config.top_k, self.config.min_score)
            .await
            .map_err(|e| RetrieveError::Unavailable(format!("index search: {}", e)))?;

        tracing::debug!(
            target: "retrieve",
            hits = hits.len(),
            top_score = hits.first().map(|h| h.score).unwrap_or(0.0),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "retrieval complete"
        );

        if hits.is_empty() {
            Ok(RetrievalOutcome::NoMatch)
        } else {
            Ok(RetrievalOutcome::Grounded(hits))
        }
    }
}
