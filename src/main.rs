//! # Compliance Harness CLI (`chk`)
//!
//! ## Usage
//!
//! ```bash
//! chk --config ./config/chk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chk init` | Create the SQLite database and schema |
//! | `chk ingest <id> --file <path> --class <class>` | Chunk, embed, and index a document |
//! | `chk delete <id>` | Remove a document and its vectors |
//! | `chk search "<query>"` | Show ranked evidence without calling the model |
//! | `chk ask "<query>"` | Produce a compliance verdict |
//! | `chk correct record\|apply\|list\|delete` | Manage corrections |
//! | `chk stats` | Index totals and per-document status |
//! | `chk serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! chk init
//! chk ingest aml-v2 --file ./docs/AML-Policy-v2.pdf --class internal_policy --name AML-Policy-v2
//! chk ask "What is the cash transaction reporting threshold?"
//! chk correct record --scope default --query "..." --response "..." --correction "..."
//! chk correct apply --scope default
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use compliance_harness::corrections::{self, NewCorrection};
use compliance_harness::{config, ingest, migrate, search, server, stats};
use compliance_harness_core::models::DocumentClass;

/// Compliance Harness — citation-backed compliance verdicts over a
/// curated regulatory and policy corpus.
#[derive(Parser)]
#[command(
    name = "chk",
    about = "Compliance Harness — retrieval-grounded compliance verdicts",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Extract, chunk, embed, and index one document.
    Ingest {
        /// Document id used by the document store.
        id: String,
        /// Plain text or PDF file.
        #[arg(long)]
        file: PathBuf,
        /// regulator_circular, regulator_policy, internal_policy, guideline, user_upload
        #[arg(long)]
        class: DocumentClass,
        /// Name used in citations. Defaults to the file stem.
        #[arg(long)]
        name: Option<String>,
        /// Knowledge base the document belongs to.
        #[arg(long = "kb")]
        knowledgebase_id: Option<String>,
    },

    /// Remove a document, its chunks, and its vectors.
    Delete { id: String },

    /// Show ranked evidence for a query without calling the model.
    Search {
        query: String,
        /// Restrict to these document ids.
        #[arg(long = "doc")]
        documents: Vec<String>,
        #[arg(long = "kb")]
        knowledgebase_id: Option<String>,
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Produce a compliance verdict for a query.
    Ask {
        query: String,
        /// Prompt scope; defaults to `[decision].default_scope`.
        #[arg(long)]
        scope: Option<String>,
        #[arg(long = "doc")]
        documents: Vec<String>,
        #[arg(long = "kb")]
        knowledgebase_id: Option<String>,
        /// Print the full assessment as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Record, apply, list, or delete operator corrections.
    Correct {
        #[command(subcommand)]
        action: CorrectAction,
    },

    /// Index totals and per-document processing status.
    Stats,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum CorrectAction {
    /// Record an unapplied correction.
    Record {
        #[arg(long)]
        scope: String,
        /// The query that produced the wrong answer.
        #[arg(long)]
        query: String,
        /// The wrong answer as returned.
        #[arg(long, default_value = "")]
        response: String,
        /// What the answer should have been.
        #[arg(long)]
        correction: String,
    },
    /// Fold pending corrections into the scope prompt.
    Apply {
        #[arg(long)]
        scope: String,
    },
    /// List corrections of a scope.
    List {
        #[arg(long)]
        scope: String,
    },
    /// Delete a correction by id.
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            id,
            file,
            class,
            name,
            knowledgebase_id,
        } => {
            ingest::run_ingest(&cfg, &id, &file, class, name, knowledgebase_id).await?;
        }
        Commands::Delete { id } => {
            ingest::run_delete(&cfg, &id).await?;
        }
        Commands::Search {
            query,
            documents,
            knowledgebase_id,
            top_k,
        } => {
            search::run_search(&cfg, &query, documents, knowledgebase_id, top_k).await?;
        }
        Commands::Ask {
            query,
            scope,
            documents,
            knowledgebase_id,
            json,
        } => {
            search::run_ask(&cfg, &query, scope, documents, knowledgebase_id, json).await?;
        }
        Commands::Correct { action } => match action {
            CorrectAction::Record {
                scope,
                query,
                response,
                correction,
            } => {
                corrections::run_record(
                    &cfg,
                    NewCorrection {
                        scope,
                        original_query: query,
                        original_response: response,
                        correction_text: correction,
                    },
                )
                .await?;
            }
            CorrectAction::Apply { scope } => {
                corrections::run_apply(&cfg, &scope).await?;
            }
            CorrectAction::List { scope } => {
                corrections::run_list(&cfg, &scope).await?;
            }
            CorrectAction::Delete { id } => {
                corrections::run_delete(&cfg, &id).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
