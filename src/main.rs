//! # FaultLens — operator CLI
//!
//! Inspects and maintains the persisted state of the analysis scheduler.
//!
//! Usage:
//!   faultlens status                     # List live schedule records
//!   faultlens inspect <workflow-id>      # Record + workflow body as JSON
//!   faultlens pending                    # Queued trigger signals per workflow
//!   faultlens prune                      # Apply the workflow retention policy
//!   faultlens purge                      # Stop and remove all scheduler state
//!   faultlens config [--init]            # Print (or write) the effective config

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faultlens_core::FaultLensConfig;
use faultlens_scheduler::{AgentRegistry, AnalysisScheduler, SchedulerStores, StopOptions};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "faultlens",
    version,
    about = "🔭 FaultLens — resumable diagnostic analysis scheduler"
)]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = "~/.faultlens/config.toml")]
    config: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List live schedule records
    Status,
    /// Show one workflow's schedule record and body
    Inspect {
        /// Workflow id
        workflow_id: Uuid,
    },
    /// List queued trigger signals
    Pending,
    /// Apply the workflow-body retention policy
    Prune,
    /// Remove all scheduler state
    Purge {
        /// Skip the confirmation flag check
        #[arg(long)]
        yes: bool,
    },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config path
        #[arg(long)]
        init: bool,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn load_config(path: &str) -> Result<(PathBuf, FaultLensConfig)> {
    let path = PathBuf::from(expand_path(path));
    let mut config = if path.exists() {
        FaultLensConfig::load_from(&path)
            .with_context(|| format!("loading {}", path.display()))?
    } else {
        FaultLensConfig::default()
    };
    config.storage.path = expand_path(&config.storage.path);
    Ok((path, config))
}

fn init_logging(config: &FaultLensConfig, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("faultlens={level},faultlens_scheduler={level},faultlens_core={level}"))
    });
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config_path, config) = load_config(&cli.config)?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Command::Status => {
            let stores = SchedulerStores::open(&config.storage)?;
            let mut records = stores.records.snapshot()?;
            records.sort_by_key(|(_, r)| r.created_at);
            if records.is_empty() {
                println!("📭 No live workflows.");
                return Ok(());
            }
            println!("🔭 {} live workflow(s)\n", records.len());
            for (id, record) in records {
                let continuation = record
                    .continuation()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".into());
                let next = record
                    .scheduling
                    .next_activation
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{id}  {:<10}  {:<24}  attempts {}/{}  next {}",
                    record.status.to_string(),
                    continuation,
                    record.scheduling.attempts,
                    record.scheduling.max_attempts,
                    next
                );
            }
        }
        Command::Inspect { workflow_id } => {
            let stores = SchedulerStores::open(&config.storage)?;
            let record = stores.records.get(&workflow_id)?;
            let workflow = stores.workflows.get(&workflow_id)?;
            if record.is_none() && workflow.is_none() {
                anyhow::bail!("workflow {workflow_id} not found");
            }
            let view = serde_json::json!({
                "schedule_record": record,
                "workflow": workflow,
                "pending_signals": stores.pending.get(&workflow_id)?,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Pending => {
            let stores = SchedulerStores::open(&config.storage)?;
            let queues = stores.pending.get_all()?;
            if queues.is_empty() {
                println!("📭 No queued signals.");
            }
            for (id, queue) in queues {
                println!("📬 {id} ({} queued)", queue.len());
                for signal in queue {
                    println!("   {} → {}", signal.event.label(), signal.target);
                }
            }
        }
        Command::Prune => {
            let scheduler = open_scheduler(&config)?;
            // Startup reconciliation already applies retention once.
            let pruned = scheduler.recovery_report().pruned + scheduler.prune_expired()?;
            scheduler.shutdown().await;
            println!("🗑️ Pruned {pruned} workflow bodies.");
        }
        Command::Purge { yes } => {
            if !yes {
                anyhow::bail!("purge removes every workflow; re-run with --yes");
            }
            let scheduler = open_scheduler(&config)?;
            scheduler.stop(StopOptions::RemoveAllState).await?;
            scheduler.shutdown().await;
            println!("🧹 All scheduler state removed.");
        }
        Command::Config { init } => {
            if init {
                config.save_to(&config_path)?;
                println!("✅ Config written to {}", config_path.display());
            } else {
                println!("# {}", config_path.display());
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Scheduler with no agents, for maintenance commands. Startup reconciliation runs.
fn open_scheduler(config: &FaultLensConfig) -> Result<AnalysisScheduler> {
    let stores = SchedulerStores::open(&config.storage)?;
    Ok(AnalysisScheduler::new(
        config.scheduler.clone(),
        AgentRegistry::new(),
        stores,
    )?)
}
