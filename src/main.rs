//! # Defense KB CLI (`dkb`)
//!
//! ## Usage
//!
//! ```bash
//! dkb --config ./config/dkb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dkb serve` | Start the HTTP API and the periodic sync loop |
//! | `dkb sync` | Run the sync pipeline once |
//! | `dkb status` | Print health and sync status |
//! | `dkb search "<query>"` | Similarity search over the active generation |
//! | `dkb get <id>` | Print one document |
//! | `dkb stats` | Print precomputed statistics |

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use defense_kb::config::{self, Config};
use defense_kb::error::EngineError;
use defense_kb::service::Service;
use defense_kb::sync::SyncOutcome;
use defense_kb::{logging, server, status};

const DEFAULT_CONFIG: &str = "./config/dkb.toml";

/// Defense KB: a locally hosted, continuously synced retrieval service for
/// an AI-defense knowledge base.
#[derive(Parser)]
#[command(name = "dkb", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/dkb.toml`; built-in defaults are used when that
    /// file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and background sync loop.
    Serve {
        /// Override `[server].bind`.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the sync pipeline once and exit.
    Sync,

    /// Print health and sync status as JSON.
    Status,

    /// Search the active generation.
    Search {
        query: String,

        /// Number of results.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Print a document by id (e.g. `AID-H-001.002`).
    Get { id: String },

    /// Print precomputed statistics as JSON.
    Stats,
}

fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG)),
        None => Ok(Config::default()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load(cli.config.as_deref())?;
    let _log_guards = logging::init(&cfg.logging)?;

    let service = Service::from_config(cfg)?;

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| service.config.server.bind.clone());
            let shutdown = CancellationToken::new();

            let sync_task = service.config.sync.auto_sync.then(|| {
                tokio::spawn(service.orchestrator.clone().sync_loop(
                    service.config.sync.interval(),
                    service.config.sync.sync_on_start,
                    shutdown.child_token(),
                ))
            });

            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                }
                signal.cancel();
            });

            server::run_server(&bind, service.app_state(), shutdown.clone()).await?;
            shutdown.cancel();
            if let Some(task) = sync_task {
                if let Err(e) = task.await {
                    tracing::error!(error = %e, "sync loop task failed");
                }
            }
        }
        Commands::Sync => match service.orchestrator.sync().await {
            SyncOutcome::Updated { version, documents } => {
                println!("Synced {} documents at version {}.", documents, version);
            }
            SyncOutcome::UpToDate { version } => {
                println!("Already up to date at version {}.", version);
            }
            SyncOutcome::AlreadyInProgress => {
                println!("A sync is already in progress.");
            }
            SyncOutcome::Failed { error } => bail!("sync failed: {}", error),
        },
        Commands::Status => {
            let report = status::report(
                &service.engine,
                &service.orchestrator,
                service.config.sync.interval(),
            )
            .await;
            print_json(&report)?;
        }
        Commands::Search { query, top_k } => {
            let hits = service.engine.search(&query, top_k).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} {} ({}, {})",
                    i + 1,
                    hit.score,
                    hit.id,
                    hit.metadata.name,
                    hit.metadata.doc_type,
                    hit.tactic
                );
            }
        }
        Commands::Get { id } => match service.engine.get_by_id(&id).await {
            Ok(doc) => print_json(&doc)?,
            Err(EngineError::NotFound(_)) => {
                let suggestions = service.engine.suggest_ids(&id, 5).await.unwrap_or_default();
                if suggestions.is_empty() {
                    bail!("document not found: {}", id);
                }
                let ids: Vec<&str> = suggestions.iter().map(|s| s.id.as_str()).collect();
                bail!("document not found: {} (did you mean {}?)", id, ids.join(", "));
            }
            Err(e) => return Err(e.into()),
        },
        Commands::Stats => {
            let stats = service.orchestrator.get_stats().await?;
            print_json(&stats)?;
        }
    }

    Ok(())
}
