//! Document ingestion pipeline: extract, normalize, chunk, embed, commit.
//!
//! Ingestion is atomic per document. Every stage before the index commit
//! works on in-memory state only, so a failure at any point leaves the
//! knowledge base exactly as it was. Re-ingesting an origin replaces the
//! prior generation in a single transaction.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::embedding::EmbeddingGateway;
use crate::error::IngestError;
use crate::extract::extract_text;
use crate::index::VectorIndex;
use crate::models::{Chunk, Document, IngestReport};

#[derive(Clone)]
pub struct IngestionPipeline {
    config: Config,
    embedder: Arc<dyn EmbeddingGateway>,
    index: VectorIndex,
}

impl IngestionPipeline {
    pub fn new(config: Config, embedder: Arc<dyn EmbeddingGateway>, index: VectorIndex) -> Self {
        Self {
            config,
            embedder,
            index,
        }
    }

    /// Ingest one document from raw bytes.
    ///
    /// `origin` is the uploader-declared filename, `mime` the declared
    /// content type. On success the document is immediately searchable.
    pub async fn ingest(
        &self,
        origin: &str,
        mime: &str,
        bytes: &[u8],
    ) -> Result<IngestReport, IngestError> {
        let started = std::time::Instant::now();

        let text = extract_text(bytes, mime)?;

        let document_id = Uuid::new_v4().to_string();
        let chunks = chunk_text(
            &document_id,
            &text,
            self.config.chunking.chunk_chars,
            self.config.chunking.overlap_chars,
        );
        if chunks.is_empty() {
            return Err(IngestError::EmptyDocument);
        }

        let vectors = self.embed_chunks(&chunks).await?;

        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let document = Document {
            id: document_id,
            origin: origin.to_string(),
            mime: mime.to_string(),
            uploaded_at: Utc::now().timestamp(),
            content_hash: format!("{:x}", hasher.finalize()),
        };

        let replaced = self
            .index
            .commit_generation(&document, &chunks, &vectors, self.embedder.model_name())
            .await
            .map_err(|e| IngestError::IngestFailed(format!("index commit: {}", e)))?;

        tracing::info!(
            target: "ingest",
            origin = %document.origin,
            document_id = %document.id,
            chunks = chunks.len(),
            replaced,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "document ingested"
        );

        Ok(IngestReport {
            document_id: document.id,
            origin: document.origin,
            chunk_count: chunks.len(),
            replaced,
        })
    }

    /// Embed all chunks in configured batch sizes. The gateway handles
    /// per-request retries; a failure here aborts the whole ingestion.
    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, IngestError> {
        let batch_size = self.config.embedding.batch_size.max(1);
        let mut vectors = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let batch_vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| IngestError::IngestFailed(format!("embedding: {}", e)))?;
            if batch_vectors.len() != texts.len() {
                return Err(IngestError::IngestFailed(format!(
                    "embedding gateway returned {} vectors for {} inputs",
                    batch_vectors.len(),
                    texts.len()
                )));
            }
            vectors.extend(batch_vectors);
        }

        Ok(vectors)
    }
}
