//! Chat orchestration: retrieval, grounded prompt composition, generation,
//! and durable session persistence.
//!
//! Each request walks a fixed sequence of phases (retrieve, compose,
//! generate, persist). Gateway failures do not abort the session: the user
//! turn and an error-marked assistant turn are persisted, so history shows
//! exactly what happened and the session remains usable. Requests within a
//! session are serialized by a per-session lock; sessions never block each
//! other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RetrieveError, StoreError};
use crate::llm::{LanguageModelGateway, Prompt, PromptMessage};
use crate::models::{Citation, RetrievedChunk, Role, Session, Turn};
use crate::retrieve::{RetrievalOutcome, Retriever};
use crate::session::ConversationStore;

/// Error markers persisted on failed assistant turns.
pub const ERR_RETRIEVAL_UNAVAILABLE: &str = "retrieval_unavailable";
pub const ERR_GENERATION_FAILED: &str = "generation_failed";
pub const ERR_CANCELLED: &str = "cancelled";

const MSG_RETRIEVAL_UNAVAILABLE: &str =
    "I couldn't consult the knowledge base just now. Please try again shortly.";
const MSG_GENERATION_FAILED: &str =
    "I couldn't produce an answer just now. Please try again shortly.";

const SYSTEM_INSTRUCTIONS: &str = "You are a knowledge-base assistant. Answer using only the \
numbered source passages provided. When the sources do not contain the answer, say so plainly \
instead of guessing. Keep answers concise and mention which sources you relied on.";

const NO_MATCH_NOTE: &str = "No relevant passages were found in the knowledge base for this \
question. Tell the user the knowledge base does not cover it; do not invent an answer.";

/// Completed outcome of one chat request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    /// Error marker when the turn degraded (`generation_failed` etc.).
    pub error: Option<String>,
}

/// Events emitted by [`ChatOrchestrator::handle_stream`].
#[derive(Debug)]
pub enum ChatEvent {
    /// A fragment of the answer text, in order.
    Fragment(String),
    /// Terminal event; carries the persisted outcome.
    Completed(ChatResponse),
}

pub struct ChatOrchestrator {
    config: Config,
    retriever: Retriever,
    llm: Arc<dyn LanguageModelGateway>,
    store: ConversationStore,
    /// Per-session request serialization. Entries are created on first use
    /// and live for the process lifetime.
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatOrchestrator {
    pub fn new(
        config: Config,
        retriever: Retriever,
        llm: Arc<dyn LanguageModelGateway>,
        store: ConversationStore,
    ) -> Self {
        Self {
            config,
            retriever,
            llm,
            store,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.session_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Handle one user message end to end. A `None` session id starts a new
    /// session. Only store failures propagate as `Err`; gateway failures
    /// come back as error-marked responses.
    pub async fn handle(
        &self,
        session_id: Option<String>,
        message: &str,
    ) -> Result<ChatResponse, StoreError> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let message = message.trim();
        if message.is_empty() {
            return Ok(ChatResponse {
                session_id,
                answer: "Please enter a question.".to_string(),
                citations: Vec::new(),
                error: Some("empty_message".to_string()),
            });
        }

        let lock = self.lock_for(&session_id);
        let _guard = lock.lock().await;

        let session = self.store.load_or_create(&session_id).await?;

        let prepared = match self.retrieve_and_compose(&session, message).await {
            Ok(p) => p,
            Err(marker) => {
                return self
                    .persist_failed(&session_id, message, marker, MSG_RETRIEVAL_UNAVAILABLE)
                    .await;
            }
        };

        tracing::debug!(target: "chat", session_id = %session_id, phase = "generating");
        let answer = match self.llm.generate(&prepared.prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(target: "chat", session_id = %session_id, error = %e, "generation failed");
                return self
                    .persist_failed(&session_id, message, ERR_GENERATION_FAILED, MSG_GENERATION_FAILED)
                    .await;
            }
        };

        tracing::debug!(target: "chat", session_id = %session_id, phase = "persisting");
        self.store
            .append_turn(&session_id, Role::User, message, &[], None)
            .await?;
        self.store
            .append_turn(&session_id, Role::Assistant, &answer, &prepared.citations, None)
            .await?;

        self.maybe_refresh_summary(&session_id).await;

        Ok(ChatResponse {
            session_id,
            answer,
            citations: prepared.citations,
            error: None,
        })
    }

    /// Handle one user message, streaming answer fragments as they arrive.
    ///
    /// The turn is persisted after the stream ends. If the receiver is
    /// dropped mid-answer, the partial text is persisted with a `cancelled`
    /// marker and the session lock is released.
    pub async fn handle_stream(
        self: Arc<Self>,
        session_id: Option<String>,
        message: String,
    ) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(32);
        let this = self;
        tokio::spawn(async move {
            this.run_stream(session_id, &message, tx).await;
        });
        rx
    }

    async fn run_stream(
        &self,
        session_id: Option<String>,
        message: &str,
        tx: mpsc::Sender<ChatEvent>,
    ) {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let message = message.trim();
        if message.is_empty() {
            let _ = tx
                .send(ChatEvent::Completed(ChatResponse {
                    session_id,
                    answer: "Please enter a question.".to_string(),
                    citations: Vec::new(),
                    error: Some("empty_message".to_string()),
                }))
                .await;
            return;
        }

        let lock = self.lock_for(&session_id);
        let _guard = lock.lock().await;

        let session = match self.store.load_or_create(&session_id).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(target: "chat", session_id = %session_id, error = %e, "session load failed");
                return;
            }
        };

        let prepared = match self.retrieve_and_compose(&session, message).await {
            Ok(p) => p,
            Err(marker) => {
                let response = self
                    .persist_failed(&session_id, message, marker, MSG_RETRIEVAL_UNAVAILABLE)
                    .await;
                if let Ok(response) = response {
                    let _ = tx.send(ChatEvent::Completed(response)).await;
                }
                return;
            }
        };

        let mut stream = match self.llm.generate_stream(&prepared.prompt).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: "chat", session_id = %session_id, error = %e, "generation failed");
                let response = self
                    .persist_failed(&session_id, message, ERR_GENERATION_FAILED, MSG_GENERATION_FAILED)
                    .await;
                if let Ok(response) = response {
                    let _ = tx.send(ChatEvent::Completed(response)).await;
                }
                return;
            }
        };

        let mut answer = String::new();
        let mut marker: Option<&str> = None;
        use futures::StreamExt;
        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => {
                    answer.push_str(&fragment);
                    if tx.send(ChatEvent::Fragment(fragment)).await.is_err() {
                        // Client went away; keep what was generated so far.
                        marker = Some(ERR_CANCELLED);
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "chat", session_id = %session_id, error = %e, "stream failed");
                    marker = Some(ERR_GENERATION_FAILED);
                    break;
                }
            }
        }

        if marker == Some(ERR_GENERATION_FAILED) && answer.is_empty() {
            let response = self
                .persist_failed(&session_id, message, ERR_GENERATION_FAILED, MSG_GENERATION_FAILED)
                .await;
            if let Ok(response) = response {
                let _ = tx.send(ChatEvent::Completed(response)).await;
            }
            return;
        }

        let persisted = async {
            self.store
                .append_turn(&session_id, Role::User, message, &[], None)
                .await?;
            self.store
                .append_turn(
                    &session_id,
                    Role::Assistant,
                    &answer,
                    &prepared.citations,
                    marker,
                )
                .await?;
            Ok::<(), StoreError>(())
        }
        .await;

        if let Err(e) = persisted {
            tracing::error!(target: "chat", session_id = %session_id, error = %e, "persist failed");
            return;
        }

        if marker.is_none() {
            self.maybe_refresh_summary(&session_id).await;
        }

        let _ = tx
            .send(ChatEvent::Completed(ChatResponse {
                session_id,
                answer,
                citations: prepared.citations,
                error: marker.map(|m| m.to_string()),
            }))
            .await;
    }

    /// Retrieval and prompt composition, shared by both entry points.
    /// Returns the failure marker when retrieval is unavailable.
    async fn retrieve_and_compose(
        &self,
        session: &Session,
        message: &str,
    ) -> Result<PreparedTurn, &'static str> {
        tracing::debug!(target: "chat", session_id = %session.id, phase = "retrieving");
        let query = rewrite_query(&session.turns, message);

        let outcome = match self.retriever.retrieve(&query).await {
            Ok(o) => o,
            Err(RetrieveError::Unavailable(reason)) => {
                tracing::warn!(target: "chat", session_id = %session.id, %reason, "retrieval unavailable");
                return Err(ERR_RETRIEVAL_UNAVAILABLE);
            }
        };

        tracing::debug!(target: "chat", session_id = %session.id, phase = "composing");
        let hits = match outcome {
            RetrievalOutcome::Grounded(hits) => dedup_by_chunk(hits),
            RetrievalOutcome::NoMatch => Vec::new(),
        };

        let citations: Vec<Citation> = hits
            .iter()
            .map(|h| Citation::from_hit(h, self.config.history.excerpt_chars))
            .collect();

        let prompt = compose_prompt(
            &hits,
            session,
            message,
            self.config.retrieval.context_chars_per_chunk,
            self.config.history.window_turns,
        );

        Ok(PreparedTurn { prompt, citations })
    }

    /// Persist the user turn plus an error-marked assistant turn, returning
    /// the degraded response the caller should surface.
    async fn persist_failed(
        &self,
        session_id: &str,
        message: &str,
        marker: &str,
        user_message: &str,
    ) -> Result<ChatResponse, StoreError> {
        self.store
            .append_turn(session_id, Role::User, message, &[], None)
            .await?;
        self.store
            .append_turn(session_id, Role::Assistant, user_message, &[], Some(marker))
            .await?;
        Ok(ChatResponse {
            session_id: session_id.to_string(),
            answer: user_message.to_string(),
            citations: Vec::new(),
            error: Some(marker.to_string()),
        })
    }

    /// Fold turns that aged out of the prompt window into the rolling
    /// summary. Best-effort: a summarization failure only logs.
    async fn maybe_refresh_summary(&self, session_id: &str) {
        let session = match self.store.load_or_create(session_id).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: "chat", session_id, error = %e, "summary refresh skipped");
                return;
            }
        };
        if session.turns.len() <= self.config.history.summarize_after {
            return;
        }

        // Nothing to fold when the window still covers every turn.
        let window_start = session
            .turns
            .len()
            .saturating_sub(self.config.history.window_turns);
        if window_start == 0 {
            return;
        }

        let aged_out = &session.turns[..window_start];
        let mut transcript = String::new();
        if let Some(prior) = &session.summary {
            transcript.push_str("Summary so far:\n");
            transcript.push_str(prior);
            transcript.push_str("\n\n");
        }
        for turn in aged_out {
            transcript.push_str(turn.role.as_str());
            transcript.push_str(": ");
            transcript.push_str(&turn.text);
            transcript.push('\n');
        }

        let prompt = Prompt {
            system: "Summarize the following conversation in a short paragraph. Keep names, \
                     facts, and open questions; drop pleasantries."
                .to_string(),
            messages: vec![PromptMessage {
                role: "user".to_string(),
                content: transcript,
            }],
        };

        match self.llm.generate(&prompt).await {
            Ok(summary) => {
                if let Err(e) = self.store.set_summary(session_id, &summary).await {
                    tracing::warn!(target: "chat", session_id, error = %e, "summary persist failed");
                }
            }
            Err(e) => {
                tracing::debug!(target: "chat", session_id, error = %e, "summary refresh failed");
            }
        }
    }
}

struct PreparedTurn {
    prompt: Prompt,
    citations: Vec<Citation>,
}

/// Drop repeated chunk ids, keeping the first (best-scored) occurrence.
/// A single index search returns distinct chunks already; this pins the
/// guarantee down so multi-query retrieval cannot double-cite a passage.
pub fn dedup_by_chunk(hits: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
    let mut seen = std::collections::HashSet::new();
    hits.into_iter()
        .filter(|h| seen.insert(h.chunk_id.clone()))
        .collect()
}

/// Rewrite a follow-up question into a standalone retrieval query by
/// prepending the user's recent questions, so pronouns and ellipses
/// ("what about its population?") still retrieve the right passages.
pub fn rewrite_query(turns: &[Turn], message: &str) -> String {
    let recent: Vec<&str> = turns
        .iter()
        .rev()
        .filter(|t| t.role == Role::User && t.error.is_none())
        .take(2)
        .map(|t| t.text.as_str())
        .collect();

    if recent.is_empty() {
        return message.to_string();
    }

    let mut query = String::new();
    for prior in recent.iter().rev() {
        query.push_str(prior);
        query.push('\n');
    }
    query.push_str(message);
    query
}

/// Compose the grounded prompt: numbered source passages, the rolling
/// summary, the recent turn window, then the user's message.
pub fn compose_prompt(
    hits: &[RetrievedChunk],
    session: &Session,
    message: &str,
    context_chars_per_chunk: usize,
    window_turns: usize,
) -> Prompt {
    let mut system = String::from(SYSTEM_INSTRUCTIONS);

    if hits.is_empty() {
        system.push_str("\n\n");
        system.push_str(NO_MATCH_NOTE);
    } else {
        system.push_str("\n\nSources:\n");
        for (i, hit) in hits.iter().enumerate() {
            let preview: String = if hit.text.chars().count() > context_chars_per_chunk {
                let cut: String = hit.text.chars().take(context_chars_per_chunk).collect();
                format!("{}…", cut.trim_end())
            } else {
                hit.text.clone()
            };
            system.push_str(&format!("[{}] ({}) {}\n", i + 1, hit.origin, preview));
        }
    }

    if let Some(summary) = &session.summary {
        system.push_str("\nConversation summary:\n");
        system.push_str(summary);
        system.push('\n');
    }

    let window_start = session.turns.len().saturating_sub(window_turns);
    let mut messages: Vec<PromptMessage> = session.turns[window_start..]
        .iter()
        .filter(|t| t.error.is_none())
        .map(|t| PromptMessage {
            role: t.role.as_str().to_string(),
            content: t.text.clone(),
        })
        .collect();
    messages.push(PromptMessage {
        role: "user".to_string(),
        content: message.to_string(),
    });

    Prompt { system, messages }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(seq: i64, role: Role, text: &str, error: Option<&str>) -> Turn {
        Turn {
            id: format!("t{}", seq),
            session_id: "s1".to_string(),
            seq,
            role,
            text: text.to_string(),
            citations: Vec::new(),
            error: error.map(|s| s.to_string()),
            created_at: 0,
        }
    }

    fn session_with(turns: Vec<Turn>) -> Session {
        Session {
            id: "s1".to_string(),
            created_at: 0,
            summary: None,
            turns,
        }
    }

    fn hit(id: &str, origin: &str, text: &str, score: f64) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.to_string(),
            document_id: "d1".to_string(),
            origin: origin.to_string(),
            chunk_index: 0,
            text: text.to_string(),
            span_start: 0,
            span_end: text.len() as i64,
            score,
        }
    }

    #[test]
    fn first_message_is_not_rewritten() {
        assert_eq!(rewrite_query(&[], "What is Rust?"), "What is Rust?");
    }

    #[test]
    fn followup_carries_recent_user_questions() {
        let turns = vec![
            turn(0, Role::User, "What is the capital of France?", None),
            turn(1, Role::Assistant, "Paris.", None),
        ];
        let query = rewrite_query(&turns, "What about its population?");
        assert_eq!(
            query,
            "What is the capital of France?\nWhat about its population?"
        );
    }

    #[test]
    fn rewrite_keeps_at_most_two_prior_questions_in_order() {
        let turns = vec![
            turn(0, Role::User, "q1", None),
            turn(1, Role::Assistant, "a1", None),
            turn(2, Role::User, "q2", None),
            turn(3, Role::Assistant, "a2", None),
            turn(4, Role::User, "q3", None),
            turn(5, Role::Assistant, "a3", None),
        ];
        assert_eq!(rewrite_query(&turns, "q4"), "q2\nq3\nq4");
    }

    #[test]
    fn rewrite_skips_error_marked_turns() {
        let turns = vec![
            turn(0, Role::User, "q1", None),
            turn(1, Role::Assistant, "sorry", Some(ERR_GENERATION_FAILED)),
        ];
        assert_eq!(rewrite_query(&turns, "q2"), "q1\nq2");
    }

    #[test]
    fn dedup_keeps_first_occurrence_per_chunk() {
        let hits = vec![
            hit("c1", "a.txt", "first", 0.9),
            hit("c2", "a.txt", "second", 0.8),
            hit("c1", "a.txt", "first again", 0.7),
        ];
        let deduped = dedup_by_chunk(hits);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].chunk_id, "c1");
        assert_eq!(deduped[0].text, "first");
        assert_eq!(deduped[1].chunk_id, "c2");
    }

    #[test]
    fn prompt_numbers_sources_with_origin() {
        let hits = vec![
            hit("c1", "handbook.pdf", "Paris is the capital of France.", 0.9),
            hit("c2", "notes.md", "France borders Spain.", 0.5),
        ];
        let prompt = compose_prompt(&hits, &session_with(vec![]), "capital?", 500, 6);
        assert!(prompt.system.contains("[1] (handbook.pdf) Paris is the capital of France."));
        assert!(prompt.system.contains("[2] (notes.md) France borders Spain."));
        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].content, "capital?");
    }

    #[test]
    fn prompt_bounds_each_source_preview() {
        let long = "x".repeat(600);
        let hits = vec![hit("c1", "big.txt", &long, 0.9)];
        let prompt = compose_prompt(&hits, &session_with(vec![]), "q", 100, 6);
        let line = prompt
            .system
            .lines()
            .find(|l| l.starts_with("[1]"))
            .unwrap();
        assert!(line.chars().count() < 150);
        assert!(line.ends_with('…'));
    }

    #[test]
    fn prompt_notes_empty_retrieval() {
        let prompt = compose_prompt(&[], &session_with(vec![]), "q", 500, 6);
        assert!(prompt.system.contains("No relevant passages"));
    }

    #[test]
    fn prompt_window_keeps_only_recent_turns() {
        let turns: Vec<Turn> = (0..10)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                turn(i, role, &format!("m{}", i), None)
            })
            .collect();
        let prompt = compose_prompt(&[], &session_with(turns), "latest", 500, 4);
        // 4 windowed turns plus the incoming message.
        assert_eq!(prompt.messages.len(), 5);
        assert_eq!(prompt.messages[0].content, "m6");
        assert_eq!(prompt.messages[3].content, "m9");
        assert_eq!(prompt.messages[4].content, "latest");
    }

    #[test]
    fn prompt_excludes_error_turns_from_window() {
        let turns = vec![
            turn(0, Role::User, "q1", None),
            turn(1, Role::Assistant, "sorry", Some(ERR_GENERATION_FAILED)),
        ];
        let prompt = compose_prompt(&[], &session_with(turns), "q2", 500, 6);
        assert_eq!(prompt.messages.len(), 2);
        assert_eq!(prompt.messages[0].content, "q1");
        assert_eq!(prompt.messages[1].content, "q2");
    }

    #[test]
    fn prompt_includes_rolling_summary() {
        let mut session = session_with(vec![]);
        session.summary = Some("User is asking about France.".to_string());
        let prompt = compose_prompt(&[], &session, "q", 500, 6);
        assert!(prompt.system.contains("User is asking about France."));
    }
}
