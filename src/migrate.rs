//! Versioned schema migrations.
//!
//! The on-disk layout is self-describing: `schema_meta` records the schema
//! version, checked at every serving startup (see [`crate::db`]). Chunks are
//! tombstoned rather than deleted so persisted citations keep resolving
//! after a re-ingest replaces a document.

use anyhow::Result;
use sqlx::SqlitePool;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: i64 = 1;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            origin TEXT NOT NULL,
            mime TEXT NOT NULL,
            uploaded_at INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            superseded INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            span_start INTEGER NOT NULL,
            span_end INTEGER NOT NULL,
            hash TEXT NOT NULL,
            tombstoned INTEGER NOT NULL DEFAULT 0,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            summary TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS turns (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            text TEXT NOT NULL,
            citations_json TEXT NOT NULL DEFAULT '[]',
            error TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(session_id, seq),
            FOREIGN KEY (session_id) REFERENCES sessions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_origin ON documents(origin)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, seq)")
        .execute(pool)
        .await?;

    // Stamp the version on first run; refuse to touch a newer layout.
    let existing: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_meta")
        .fetch_optional(pool)
        .await?;
    match existing {
        None => {
            sqlx::query("INSERT INTO schema_meta (version) VALUES (?)")
                .bind(SCHEMA_VERSION)
                .execute(pool)
                .await?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => anyhow::bail!(
            "database schema version {} is incompatible with this build (expected {})",
            v,
            SCHEMA_VERSION
        ),
    }

    Ok(())
}
