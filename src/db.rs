//! SQLite connection handling and startup integrity verification.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;
use crate::error::StoreError;
use crate::migrate;

/// Open (or create) the database for `cchat init`.
pub async fn connect(config: &Config) -> Result<SqlitePool, StoreError> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::IndexCorrupt(format!("cannot create data dir: {}", e)))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .map_err(StoreError::Db)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Open the database for serving, refusing to start on missing or corrupt
/// state.
///
/// A missing file, failed integrity check, or schema-version mismatch is
/// reported as `IndexCorrupt` rather than silently serving an empty index —
/// masking data loss behind ungrounded answers is worse than failing.
pub async fn connect_verified(config: &Config) -> Result<SqlitePool, StoreError> {
    let db_path = &config.db.path;

    if !db_path.exists() {
        return Err(StoreError::IndexCorrupt(format!(
            "database not found at {} (run `cchat init` first)",
            db_path.display()
        )));
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .map_err(StoreError::Db)?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    verify(&pool).await?;
    Ok(pool)
}

/// Integrity and schema-version check run at startup.
async fn verify(pool: &SqlitePool) -> Result<(), StoreError> {
    let check: String = sqlx::query_scalar("PRAGMA quick_check")
        .fetch_one(pool)
        .await
        .map_err(|e| StoreError::IndexCorrupt(format!("integrity check failed: {}", e)))?;
    if check != "ok" {
        return Err(StoreError::IndexCorrupt(format!(
            "integrity check reported: {}",
            check
        )));
    }

    let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_meta")
        .fetch_optional(pool)
        .await
        .map_err(|e| StoreError::IndexCorrupt(format!("schema_meta unreadable: {}", e)))?;

    match version {
        Some(v) if v == migrate::SCHEMA_VERSION => Ok(()),
        Some(v) => Err(StoreError::IndexCorrupt(format!(
            "schema version {} found, expected {}",
            v,
            migrate::SCHEMA_VERSION
        ))),
        None => Err(StoreError::IndexCorrupt(
            "schema_meta holds no version row".to_string(),
        )),
    }
}
