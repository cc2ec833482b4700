use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pautabot_core::{NaturalKey, Outcome};
use pautabot_storage::StateStore;
use pautabot_sync::{build_pipeline, maybe_build_scheduler, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "pautabot")]
#[command(about = "Reports new municipal advertising purchase orders")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation cycle.
    Run,
    /// Publish a single order from the current catalog, skipping the diff and classifier.
    Publish {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        order: u64,
    },
    /// Show which sellers the next cycle would investigate.
    Probe,
    /// Create an empty state file.
    Init,
    /// Run cycles on the configured cron schedule until interrupted.
    Watch,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = build_pipeline(&config)?.run_once().await?;
            println!(
                "cycle complete: run_id={} sellers={} candidates={} published={} dropped={} errors={}",
                summary.run_id,
                summary.sellers_investigated.len(),
                summary.candidates,
                summary.published,
                summary.dropped,
                summary.errors
            );
        }
        Commands::Publish { year, order } => {
            let key = NaturalKey::new(year, order);
            let entry = build_pipeline(&config)?.publish_order(key).await?;
            match entry.outcome {
                Outcome::Processed { notification_id } => {
                    println!("published {key}: notification_id={notification_id}");
                }
                Outcome::Error { reason } => bail!("publishing {key} failed: {reason}"),
                Outcome::Dropped => println!("{key} recorded as dropped"),
            }
        }
        Commands::Probe => {
            let report = build_pipeline(&config)?.probe().await?;
            println!("last run: {}", report.last_run);
            if !report.has_changes() {
                println!("no seller totals increased");
            }
            for delta in &report.sellers {
                match delta.previous {
                    Some(previous) => println!("{}: {previous} -> {}", delta.seller, delta.current),
                    None => println!("{}: new seller at {}", delta.seller, delta.current),
                }
            }
        }
        Commands::Init => {
            let store = StateStore::new(config.state_file.clone());
            store.init(Utc::now()).await?;
            println!("initialized {}", store.path().display());
        }
        Commands::Watch => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(build_pipeline(&config)?);
            let Some(sched) = maybe_build_scheduler(&config, pipeline).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "watching; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
    }

    Ok(())
}
