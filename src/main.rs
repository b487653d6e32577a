//! # Knowledge Assistant CLI (`ka`)
//!
//! ## Usage
//!
//! ```bash
//! ka --config ./config/ka.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ka init` | Create the tables on the active backend and the standby |
//! | `ka ask "<query>"` | Run one query through the workflow |
//! | `ka status` | Show which database backend answers |
//! | `ka serve` | Start the HTTP API |
//!
//! Logging is controlled with `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use knowledge_assistant::config;
use knowledge_assistant::db::ConnectionManager;
use knowledge_assistant::migrate;
use knowledge_assistant::models::WorkflowEvent;
use knowledge_assistant::server;
use knowledge_assistant::setup::build_workflow;

/// Knowledge Assistant: retrieval-augmented answers over your documents.
#[derive(Parser)]
#[command(name = "ka", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ka.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema.
    ///
    /// Idempotent. Runs against the active backend and, separately, the
    /// standby so both stay in sync.
    Init,

    /// Ask a single question.
    Ask {
        query: String,

        /// Attribute the question to this user (enables memory and logging).
        #[arg(long)]
        user_id: Option<i32>,

        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,
    },

    /// Report the database backend currently in use.
    Status,

    /// Start the HTTP server.
    Serve,
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
            let db = ConnectionManager::from_config(&cfg.db);
            migrate::ensure_schema(&db).await?;
            db.close_connection().await;
            println!("Database initialized successfully.");
        }
        Commands::Ask {
            query,
            user_id,
            stream,
        } => {
            let db = Arc::new(ConnectionManager::from_config(&cfg.db));
            let workflow = build_workflow(&cfg, Arc::clone(&db))?;

            if stream {
                let mut events = workflow.run_stream(&query, user_id).await?;
                let mut stdout = std::io::stdout();
                while let Some(event) = events.next().await {
                    match event {
                        WorkflowEvent::Metadata(meta) => {
                            eprintln!(
                                "query: {} (context: {}, memory: {})",
                                meta.normalized_query, meta.needs_context, meta.needs_memory
                            );
                        }
                        WorkflowEvent::Token(text) => {
                            print!("{}", text);
                            stdout.flush()?;
                        }
                        WorkflowEvent::Error(payload) => {
                            println!();
                            anyhow::bail!(payload.message);
                        }
                        WorkflowEvent::Done(_) => println!(),
                    }
                }
                // The answer is persisted after `done`; the runtime must outlive it.
                events.finish().await;
            } else {
                let outcome = workflow.run(&query, user_id).await?;
                eprintln!(
                    "query: {} (context: {}, memory: {})",
                    outcome.normalized_query, outcome.context_used, outcome.memory_used
                );
                println!("{}", outcome.answer);
            }

            db.close_connection().await;
        }
        Commands::Status => {
            let db = ConnectionManager::from_config(&cfg.db);
            match db.get_connection().await {
                Ok(conn) => println!("database: {}", conn.backend()),
                Err(e) => {
                    println!("database: unavailable");
                    eprintln!("{}", e);
                }
            }
            db.close_connection().await;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
