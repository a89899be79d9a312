//! # Corpus Chat
//!
//! A knowledge-base-grounded conversational engine.
//!
//! Documents (PDF, DOCX, plain text, Markdown) are ingested into SQLite:
//! extracted, normalized, chunked with overlap, and embedded through an
//! OpenAI-compatible gateway. Chat requests retrieve the most relevant
//! chunks by cosine similarity, compose a grounded prompt with citations,
//! and generate answers through a chat-completions gateway, persisting
//! every turn in durable multi-turn sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │ Uploads  │──▶│   Pipeline    │──▶│  SQLite   │
//! │ pdf/docx │   │ Chunk+Embed  │   │ Vec+Turns │
//! └──────────┘   └──────────────┘   └────┬─────┘
//!                                        │
//!                    ┌───────────────────┤
//!                    ▼                   ▼
//!               ┌──────────┐       ┌──────────┐
//!               │   CLI    │       │   HTTP   │
//!               │ (cchat)  │       │  (axum)  │
//!               └──────────┘       └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Format-specific text extraction |
//! | [`chunk`] | Overlapping text chunking |
//! | [`embedding`] | Embedding gateway abstraction |
//! | [`index`] | SQLite-backed vector index |
//! | [`ingest`] | Document ingestion pipeline |
//! | [`retrieve`] | Query-time retrieval |
//! | [`session`] | Durable conversation sessions |
//! | [`llm`] | Language model gateway |
//! | [`chat`] | Chat orchestration |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection and verification |
//! | [`migrate`] | Schema migrations |

pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod retrieve;
pub mod server;
pub mod session;
