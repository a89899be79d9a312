//! Core data models used throughout Corpus Chat.
//!
//! These types represent the documents, chunks, retrieval results, and
//! conversation turns that flow through the ingestion and chat pipelines.

use serde::{Deserialize, Serialize};

/// Normalized document stored in SQLite.
///
/// Documents are immutable once ingested. Re-uploading the same origin
/// creates a new generation under a fresh id and supersedes the old one.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    /// Origin filename as declared by the uploader (e.g. `handbook.pdf`).
    pub origin: String,
    pub mime: String,
    pub uploaded_at: i64,
    /// SHA-256 of the normalized body, for change detection.
    pub content_hash: String,
}

/// A bounded segment of a document's normalized body text.
///
/// The unit of embedding and retrieval. `span_start..span_end` is the
/// byte range within the normalized document text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub span_start: i64,
    pub span_end: i64,
    pub hash: String,
}

/// A chunk returned from vector search, joined with document provenance.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub origin: String,
    pub chunk_index: i64,
    pub text: String,
    pub span_start: i64,
    pub span_end: i64,
    /// Cosine similarity against the query vector, in [-1, 1].
    pub score: f64,
}

/// A reference from an assistant turn to a chunk that informed its answer.
///
/// The excerpt is snapshotted at generation time so persisted history stays
/// readable even after the source chunk is tombstoned by a re-ingest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub origin: String,
    pub span_start: i64,
    pub span_end: i64,
    pub score: f64,
    pub excerpt: String,
}

impl Citation {
    /// Snapshot a retrieval hit into a citation, bounding the excerpt length.
    pub fn from_hit(hit: &RetrievedChunk, excerpt_chars: usize) -> Self {
        let excerpt = if hit.text.chars().count() > excerpt_chars {
            let cut: String = hit.text.chars().take(excerpt_chars).collect();
            format!("{}…", cut.trim_end())
        } else {
            hit.text.clone()
        };
        Citation {
            chunk_id: hit.chunk_id.clone(),
            document_id: hit.document_id.clone(),
            origin: hit.origin.clone(),
            span_start: hit.span_start,
            span_end: hit.span_end,
            score: hit.score,
            excerpt,
        }
    }
}

/// Speaker role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// One persisted conversation turn. Append-only; never edited in place.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub id: String,
    pub session_id: String,
    /// Per-session ordinal, contiguous from 0 in append order.
    pub seq: i64,
    pub role: Role,
    pub text: String,
    pub citations: Vec<Citation>,
    /// Machine-readable marker when this turn records a failure
    /// (e.g. `generation_failed`). `None` for normal turns.
    pub error: Option<String>,
    pub created_at: i64,
}

/// A conversation session: ordered turn log plus an optional rolling summary
/// of turns that have aged out of the prompt window.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub created_at: i64,
    pub summary: Option<String>,
    pub turns: Vec<Turn>,
}

/// Lightweight session listing row.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub id: String,
    pub created_at: i64,
    pub turn_count: i64,
}

/// Outcome of a successful document ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub origin: String,
    pub chunk_count: usize,
    /// True when a previous generation of the same origin was superseded.
    pub replaced: bool,
}
