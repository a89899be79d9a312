//! Durable conversation sessions.
//!
//! Sessions and turns live in the same SQLite database as the index.
//! The turn log is append-only: turns are never edited or reordered, and
//! each carries a per-session `seq` assigned inside the appending
//! transaction so concurrent appends cannot interleave.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Citation, Role, Session, SessionMeta, Turn};

#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load a session by id, creating it if it does not exist. Turns come
    /// back in append order.
    pub async fn load_or_create(&self, session_id: &str) -> Result<Session, StoreError> {
        sqlx::query("INSERT OR IGNORE INTO sessions (id, created_at) VALUES (?, ?)")
            .bind(session_id)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;

        let row = sqlx::query("SELECT created_at, summary FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        let created_at: i64 = row.get("created_at");
        let summary: Option<String> = row.get("summary");

        let turn_rows = sqlx::query(
            "SELECT id, seq, role, text, citations_json, error, created_at \
             FROM turns WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut turns = Vec::with_capacity(turn_rows.len());
        for row in turn_rows {
            turns.push(row_to_turn(session_id, &row)?);
        }

        Ok(Session {
            id: session_id.to_string(),
            created_at,
            summary,
            turns,
        })
    }

    /// Append one turn, assigning the next `seq` atomically.
    pub async fn append_turn(
        &self,
        session_id: &str,
        role: Role,
        text: &str,
        citations: &[Citation],
        error: Option<&str>,
    ) -> Result<Turn, StoreError> {
        let citations_json = serde_json::to_string(citations)
            .map_err(|e| StoreError::IndexCorrupt(format!("citations unserializable: {}", e)))?;

        let mut tx = self.pool.begin().await?;

        let seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq) + 1, 0) FROM turns WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await?;

        let turn = Turn {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            seq,
            role,
            text: text.to_string(),
            citations: citations.to_vec(),
            error: error.map(|s| s.to_string()),
            created_at: Utc::now().timestamp(),
        };

        sqlx::query(
            "INSERT INTO turns (id, session_id, seq, role, text, citations_json, error, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&turn.id)
        .bind(session_id)
        .bind(turn.seq)
        .bind(turn.role.as_str())
        .bind(&turn.text)
        .bind(&citations_json)
        .bind(&turn.error)
        .bind(turn.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(turn)
    }

    /// Replace the rolling summary of turns aged out of the prompt window.
    pub async fn set_summary(&self, session_id: &str, summary: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET summary = ? WHERE id = ?")
            .bind(summary)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop a session's turns and summary. The session row itself stays so
    /// the id remains usable.
    pub async fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM turns WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE sessions SET summary = NULL WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// List sessions, newest first.
    pub async fn list(&self) -> Result<Vec<SessionMeta>, StoreError> {
        let rows = sqlx::query(
            "SELECT s.id, s.created_at, COUNT(t.id) AS turn_count \
             FROM sessions s LEFT JOIN turns t ON t.session_id = s.id \
             GROUP BY s.id ORDER BY s.created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SessionMeta {
                id: row.get("id"),
                created_at: row.get("created_at"),
                turn_count: row.get("turn_count"),
            })
            .collect())
    }

    /// Load a session only if it already exists.
    pub async fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }
        Ok(Some(self.load_or_create(session_id).await?))
    }
}

fn row_to_turn(session_id: &str, row: &sqlx::sqlite::SqliteRow) -> Result<Turn, StoreError> {
    let role_str: String = row.get("role");
    let role = Role::parse(&role_str).ok_or_else(|| {
        StoreError::IndexCorrupt(format!("turn has unknown role: {}", role_str))
    })?;

    let citations_json: String = row.get("citations_json");
    let citations: Vec<Citation> = serde_json::from_str(&citations_json)
        .map_err(|e| StoreError::IndexCorrupt(format!("citations unreadable: {}", e)))?;

    Ok(Turn {
        id: row.get("id"),
        session_id: session_id.to_string(),
        seq: row.get("seq"),
        role,
        text: row.get("text"),
        citations,
        error: row.get("error"),
        created_at: row.get("created_at"),
    })
}
