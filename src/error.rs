//! Error taxonomy for ingestion, retrieval, and generation.
//!
//! Gateways report [`GatewayError`], which carries enough classification for
//! callers to decide between retrying and failing fast. Pipeline-level errors
//! ([`IngestError`], [`RetrieveError`]) are what the serving layer maps to
//! HTTP responses. `anyhow` is used only at the CLI boundary.

use thiserror::Error;

/// Failure from an external model gateway (embedding or language model).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request did not complete within the configured timeout.
    #[error("gateway timeout: {0}")]
    Timeout(String),

    /// The provider rejected the request with a rate limit (HTTP 429).
    #[error("gateway rate limited: {0}")]
    RateLimited(String),

    /// Transient failure (server error, connection reset). Retryable.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// Permanent failure (bad credentials, malformed request). Never retried.
    #[error("permanent gateway error: {0}")]
    Permanent(String),
}

impl GatewayError {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, GatewayError::Permanent(_))
    }
}

/// Failure while ingesting a document. All variants guarantee that nothing
/// was committed: ingestion is atomic per document.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("parse error: {0}")]
    Parse(String),

    /// The document parsed to no usable text after normalization.
    #[error("document contains no extractable text")]
    EmptyDocument,

    /// Embedding retries were exhausted or the index commit failed; any
    /// partially computed state for this document was discarded.
    #[error("ingestion failed: {0}")]
    IngestFailed(String),
}

/// Failure while retrieving grounding passages for a query.
///
/// Distinct from an empty result: an empty result is a valid outcome
/// ("no relevant knowledge"), while `Unavailable` means retrieval itself
/// is broken and the caller should surface a degraded-service message.
#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("retrieval unavailable: {0}")]
    Unavailable(String),
}

/// Persistence-layer failure (conversation store or vector index).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The on-disk database is missing, unreadable, or carries an
    /// incompatible schema version. Always fatal at startup: the system
    /// refuses to serve retrieval rather than silently answer ungrounded.
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}
