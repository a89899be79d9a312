//! SQLite-backed vector index.
//!
//! Stores one embedding per chunk and serves nearest-neighbour search by
//! cosine similarity. Reads are snapshot-consistent (WAL + single-transaction
//! commits), so concurrent searches never observe a half-written document.
//! Writers are serialized through a commit lock; deletes tombstone rather
//! than remove, and search never returns tombstoned chunks.

use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::StoreError;
use crate::models::{Chunk, Document, RetrievedChunk};

#[derive(Clone)]
pub struct VectorIndex {
    pool: SqlitePool,
    /// Serializes generation commits; concurrent ingests of different
    /// documents may overlap everywhere except the commit point.
    commit_lock: Arc<tokio::sync::Mutex<()>>,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            commit_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Nearest-neighbour search over all live (non-tombstoned) chunks.
    ///
    /// Returns at most `k` results with score >= `min_score`, ordered by
    /// descending score with ties broken by chunk id ascending, so results
    /// are deterministic for a fixed index state.
    pub async fn search(
        &self,
        query_vec: &[f32],
        k: usize,
        min_score: f64,
    ) -> Result<Vec<RetrievedChunk>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.embedding,
                   c.document_id, c.chunk_index, c.text, c.span_start, c.span_end,
                   d.origin
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id AND c.tombstoned = 0
            JOIN documents d ON d.id = c.document_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<RetrievedChunk> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                let score = cosine_similarity(query_vec, &vec) as f64;
                if score < min_score {
                    return None;
                }
                Some(RetrievedChunk {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    origin: row.get("origin"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    span_start: row.get("span_start"),
                    span_end: row.get("span_end"),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);

        Ok(hits)
    }

    /// Tombstone chunks by id. Subsequent searches will not return them;
    /// rows stay on disk so persisted citations keep resolving.
    pub async fn delete(&self, chunk_ids: &[String]) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for id in chunk_ids {
            sqlx::query("UPDATE chunks SET tombstoned = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Atomically commit a new generation of a document.
    ///
    /// In one transaction: any live prior generation with the same origin is
    /// superseded and its chunks tombstoned, then the new document, chunks,
    /// and vectors are inserted. Readers see either the old generation or
    /// the new one, never both and never a partial write.
    ///
    /// Returns `true` when a prior generation was replaced.
    pub async fn commit_generation(
        &self,
        document: &Document,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model: &str,
    ) -> Result<bool, StoreError> {
        debug_assert_eq!(chunks.len(), vectors.len());

        let _guard = self.commit_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let prior_ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE origin = ? AND superseded = 0")
                .bind(&document.origin)
                .fetch_all(&mut *tx)
                .await?;

        for prior in &prior_ids {
            sqlx::query("UPDATE documents SET superseded = 1 WHERE id = ?")
                .bind(prior)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE chunks SET tombstoned = 1 WHERE document_id = ?")
                .bind(prior)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO documents (id, origin, mime, uploaded_at, content_hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&document.id)
        .bind(&document.origin)
        .bind(&document.mime)
        .bind(document.uploaded_at)
        .bind(&document.content_hash)
        .execute(&mut *tx)
        .await?;

        for (chunk, vec) in chunks.iter().zip(vectors.iter()) {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, span_start, span_end, hash) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.span_start)
            .bind(chunk.span_end)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, document_id, model, dims, embedding) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(model)
            .bind(vec.len() as i64)
            .bind(vec_to_blob(vec))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(!prior_ids.is_empty())
    }

    /// Number of live chunks visible to search.
    pub async fn live_chunk_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks c JOIN chunk_vectors cv ON cv.chunk_id = c.id WHERE c.tombstoned = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Live chunks without a vector row. Zero after any successful
    /// ingestion; exposed for diagnostics and tests.
    pub async fn unindexed_chunk_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks c LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id WHERE c.tombstoned = 0 AND cv.chunk_id IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
