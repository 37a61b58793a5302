//! # Knowledge Sync CLI (`ksync`)
//!
//! ## Usage
//!
//! ```bash
//! ksync --config ./config/ksync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ksync init` | Create the SQLite database and run schema migrations |
//! | `ksync sources` | List platforms and whether their connectors start |
//! | `ksync sync <platform\|all>` | Run one sync cycle per tenant |
//! | `ksync run` | Run every sync worker until Ctrl-C |
//! | `ksync search "<query>"` | Similarity search over the knowledge graph |
//! | `ksync file <path>` | Decisions, discussions, and people around a file |
//! | `ksync decisions <target>` | Decision history for a file or feature |
//! | `ksync history <platform> <kind> <id>` | One entity and its revisions |
//! | `ksync serve` | Start the read API |
//!
//! ## Examples
//!
//! ```bash
//! ksync init
//! ksync sync github --tenant acme
//! ksync sync all --full
//! ksync file src/auth/session.rs
//! ksync decisions "#42"
//! ksync history github decision acme/web/pull/42
//! ksync run --serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use knowledge_sync::{config, db, ingest, migrate, query, server, sources};

/// Knowledge Sync: ingest engineering activity from GitHub, Slack, and
/// Discord into a queryable knowledge graph.
#[derive(Parser)]
#[command(name = "ksync", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the file does not exist, connectors are configured from
    /// environment variables (`GITHUB_TOKEN`, `SLACK_BOT_TOKEN`, ...).
    #[arg(long, global = true, default_value = "./config/ksync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List registered platforms with configured, enabled, and active status.
    Sources,

    /// Run a single sync cycle.
    ///
    /// Fetches events since the stored checkpoint, extracts entities and
    /// relationships, persists them, and advances the checkpoint.
    Sync {
        /// Platform name (`github`, `slack`, `discord`) or `all`.
        platform: String,

        /// Only sync this tenant.
        #[arg(long)]
        tenant: Option<String>,

        /// Ignore checkpoints and fetch the whole lookback window.
        #[arg(long)]
        full: bool,
    },

    /// Run every sync worker until interrupted.
    Run {
        /// Also serve the read API on `[server].bind`.
        #[arg(long)]
        serve: bool,
    },

    /// Similarity search over entities.
    Search {
        query: String,

        /// Project to search. Defaults to the first tenant's project.
        #[arg(long)]
        project: Option<String>,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Show the graph neighbourhood of a file.
    File {
        /// Exact path, or a path suffix such as `session.rs`.
        path: String,

        #[arg(long)]
        project: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Decisions linked to a file path or feature name, oldest first.
    Decisions {
        target: String,

        #[arg(long)]
        project: Option<String>,
    },

    /// Show an entity and its revision history.
    History {
        platform: String,

        /// `feature`, `file`, `decision`, `discussion`, or `contributor`.
        kind: String,

        platform_id: String,

        #[arg(long)]
        project: Option<String>,
    },

    /// Start the read API.
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
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Sync {
            platform,
            tenant,
            full,
        } => {
            let platform = (platform != "all").then_some(platform);
            ingest::run_sync(&cfg, platform.as_deref(), tenant.as_deref(), full).await?;
        }
        Commands::Run { serve } => {
            ingest::run_daemon(&cfg, serve).await?;
        }
        Commands::Search {
            query,
            project,
            limit,
        } => {
            query::run_search(&cfg, &query, project, limit).await?;
        }
        Commands::File {
            path,
            project,
            limit,
        } => {
            query::run_file_context(&cfg, &path, project, limit).await?;
        }
        Commands::Decisions { target, project } => {
            query::run_decisions(&cfg, &target, project).await?;
        }
        Commands::History {
            platform,
            kind,
            platform_id,
            project,
        } => {
            query::run_history(&cfg, &platform, &kind, &platform_id, project).await?;
        }
        Commands::Serve => {
            let pool = db::connect(&cfg).await?;
            migrate::apply(&pool).await?;
            let store = std::sync::Arc::new(knowledge_sync::store::sqlite::SqliteStore::new(pool));

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                signal.cancel();
            });
            server::serve(&cfg, store, shutdown).await?;
        }
    }

    Ok(())
}
