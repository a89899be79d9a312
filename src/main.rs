//! # Corpus Chat CLI (`cchat`)
//!
//! The `cchat` binary is the primary interface for Corpus Chat. It provides
//! commands for database initialization, document ingestion, retrieval
//! checks, grounded question answering, session management, and starting
//! the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! cchat --config ./config/corpus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cchat init` | Create the SQLite database and run schema migrations |
//! | `cchat ingest <path>` | Ingest a document (pdf, docx, txt, md) |
//! | `cchat search "<query>"` | Show the chunks retrieval would ground on |
//! | `cchat ask "<question>"` | Ask a grounded question, printing citations |
//! | `cchat sessions list` | List conversation sessions |
//! | `cchat sessions show <id>` | Print a session's turn log |
//! | `cchat sessions clear <id>` | Drop a session's turns and summary |
//! | `cchat serve` | Start the HTTP API server |

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corpus_chat::chat::ChatOrchestrator;
use corpus_chat::ingest::IngestionPipeline;
use corpus_chat::retrieve::{RetrievalOutcome, Retriever};
use corpus_chat::server::{self, AppState};
use corpus_chat::session::ConversationStore;
use corpus_chat::{config, db, embedding, extract, index, llm, migrate};

/// Corpus Chat CLI — a knowledge-base-grounded conversational engine.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/corpus.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cchat",
    about = "Corpus Chat — a knowledge-base-grounded conversational engine",
    version,
    long_about = "Corpus Chat ingests documents (PDF, DOCX, plain text, Markdown) into a \
    SQLite-backed vector index and answers questions grounded in them, with citations, \
    over durable multi-turn sessions. Serves a JSON API and a CLI."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/corpus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Ingest a document into the knowledge base.
    ///
    /// Extracts text, chunks it, embeds the chunks, and commits the
    /// document atomically. Re-ingesting a file with the same name
    /// replaces the previous version.
    Ingest {
        /// Path to the document file.
        path: PathBuf,

        /// Override the MIME type (guessed from the extension by default).
        #[arg(long)]
        mime: Option<String>,
    },

    /// Show the chunks retrieval would ground an answer on.
    Search {
        /// The query string.
        query: String,
    },

    /// Ask a grounded question and print the answer with citations.
    Ask {
        /// The question.
        question: String,

        /// Continue an existing session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
    },

    /// Manage conversation sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves
    /// ingestion, chat, and session endpoints.
    Serve,
}

/// Session management subcommands.
#[derive(Subcommand)]
enum SessionAction {
    /// List sessions, newest first.
    List,
    /// Print a session's full turn log.
    Show {
        /// Session id.
        id: String,
    },
    /// Drop a session's turns and rolling summary.
    Clear {
        /// Session id.
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path, mime } => {
            let engine = Engine::build(&cfg).await?;
            let mime = match mime {
                Some(m) => m,
                None => guess_mime(&path)?,
            };
            let origin = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?
                .to_string();
            let bytes = std::fs::read(&path)?;

            let report = engine.pipeline.ingest(&origin, &mime, &bytes).await?;
            println!(
                "Ingested {} as {} ({} chunks{})",
                report.origin,
                report.document_id,
                report.chunk_count,
                if report.replaced {
                    ", replaced previous version"
                } else {
                    ""
                }
            );
        }
        Commands::Search { query } => {
            let engine = Engine::build(&cfg).await?;
            match engine.retriever.retrieve(&query).await? {
                RetrievalOutcome::NoMatch => {
                    println!("No relevant chunks found.");
                }
                RetrievalOutcome::Grounded(hits) => {
                    for (i, hit) in hits.iter().enumerate() {
                        println!(
                            "{}. [{:.3}] {} (chunk {})",
                            i + 1,
                            hit.score,
                            hit.origin,
                            hit.chunk_index
                        );
                        let preview: String = hit.text.chars().take(160).collect();
                        println!("   {}", preview);
                    }
                }
            }
        }
        Commands::Ask { question, session } => {
            let engine = Engine::build(&cfg).await?;
            let response = engine.orchestrator.handle(session, &question).await?;

            println!("{}", response.answer);
            if !response.citations.is_empty() {
                println!();
                for (i, c) in response.citations.iter().enumerate() {
                    println!("[{}] {} ({:.3})", i + 1, c.origin, c.score);
                }
            }
            println!();
            println!("session: {}", response.session_id);
            if let Some(marker) = response.error {
                println!("note: this turn degraded ({})", marker);
            }
        }
        Commands::Sessions { action } => {
            let engine = Engine::build(&cfg).await?;
            let store = engine.orchestrator.store();
            match action {
                SessionAction::List => {
                    let sessions = store.list().await?;
                    if sessions.is_empty() {
                        println!("No sessions.");
                    }
                    for meta in sessions {
                        println!("{}  {} turns", meta.id, meta.turn_count);
                    }
                }
                SessionAction::Show { id } => {
                    let session = store
                        .load(&id)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("session not found: {}", id))?;
                    for turn in &session.turns {
                        let marker = turn
                            .error
                            .as_deref()
                            .map(|m| format!(" [{}]", m))
                            .unwrap_or_default();
                        println!("{:>3} {}{}: {}", turn.seq, turn.role.as_str(), marker, turn.text);
                    }
                    if let Some(summary) = &session.summary {
                        println!();
                        println!("summary: {}", summary);
                    }
                }
                SessionAction::Clear { id } => {
                    store.clear(&id).await?;
                    println!("Cleared session {}.", id);
                }
            }
        }
        Commands::Serve => {
            let engine = Engine::build(&cfg).await?;
            let state = Arc::new(AppState {
                pipeline: engine.pipeline,
                orchestrator: engine.orchestrator,
            });
            server::serve(state, &cfg.server.bind).await?;
        }
    }

    Ok(())
}

/// Wired-up engine components shared by the serving commands.
struct Engine {
    pipeline: IngestionPipeline,
    retriever: Retriever,
    orchestrator: Arc<ChatOrchestrator>,
}

impl Engine {
    async fn build(cfg: &config::Config) -> anyhow::Result<Self> {
        let pool = db::connect_verified(cfg).await?;
        let vector_index = index::VectorIndex::new(pool.clone());
        let embedder = embedding::create_embedding_gateway(&cfg.embedding)?;
        let llm_gateway = llm::create_llm_gateway(&cfg.llm)?;

        let pipeline =
            IngestionPipeline::new(cfg.clone(), embedder.clone(), vector_index.clone());
        let retriever = Retriever::new(cfg.retrieval.clone(), embedder, vector_index);
        let store = ConversationStore::new(pool);
        let orchestrator = Arc::new(ChatOrchestrator::new(
            cfg.clone(),
            retriever.clone(),
            llm_gateway,
            store,
        ));

        Ok(Engine {
            pipeline,
            retriever,
            orchestrator,
        })
    }
}

/// Guess a MIME type from the file extension.
fn guess_mime(path: &Path) -> anyhow::Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let mime = match ext.as_str() {
        "pdf" => extract::MIME_PDF,
        "docx" => extract::MIME_DOCX,
        "txt" => extract::MIME_TEXT,
        "md" | "markdown" => extract::MIME_MARKDOWN,
        other => anyhow::bail!(
            "cannot guess MIME type for '.{}' (use --mime; supported: pdf, docx, txt, md)",
            other
        ),
    };
    Ok(mime.to_string())
}
