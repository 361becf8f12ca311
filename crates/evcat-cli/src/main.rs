use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use evcat_core::{system_clock, SharedClock};
use evcat_storage::{CatalogStore, SqliteCatalogStore};
use evcat_sync::{
    build_pipeline, maybe_build_scheduler, open_store, run_sync_and_sweep, write_run_report,
    ExpirySweep, Purge, SyncConfig,
};
use serde_json::Value;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "evcat")]
#[command(about = "Event catalog ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over every enabled source.
    Sync,
    /// Mark entries whose event has passed as inactive.
    Sweep,
    /// Delete entries whose event is older than the retention window.
    Purge {
        /// Defaults to EVCAT_RETENTION_DAYS.
        #[arg(long)]
        older_than_days: Option<u32>,
        /// Without this flag the purge only reports what it would delete.
        #[arg(long)]
        confirm: bool,
    },
    /// Print catalog counters.
    Stats,
    /// Create or upgrade the catalog schema.
    Migrate,
    /// Run sync and sweep on their cron schedules until interrupted.
    Schedule {
        /// Run one sync before waiting for the first tick.
        #[arg(long)]
        run_now: bool,
    },
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let value: Value = serde_json::to_value(value).context("serializing output")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn open(config: &SyncConfig, clock: SharedClock) -> Result<Arc<SqliteCatalogStore>> {
    Ok(Arc::new(open_store(config, clock).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let clock = system_clock();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store = open(&config, clock.clone()).await?;
            let pipeline = build_pipeline(&config, store.clone(), clock).await?;
            let summary = pipeline.run_once().await;
            if let Some(dir) = &config.reports_dir {
                let path = write_run_report(dir, &summary).await?;
                info!(path = %path.display(), "run report written");
            }
            print_json(&summary)?;
            store.close().await;
            if !summary.is_success() {
                anyhow::bail!(
                    "sync run {} failed: {}",
                    summary.run_id,
                    summary.fatal_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Sweep => {
            let store = open(&config, clock.clone()).await?;
            let summary = ExpirySweep::new(store.clone(), clock).run().await?;
            print_json(&summary)?;
            store.close().await;
        }
        Commands::Purge {
            older_than_days,
            confirm,
        } => {
            let store = open(&config, clock.clone()).await?;
            let days = older_than_days.unwrap_or(config.retention_days);
            let summary = Purge::new(store.clone(), clock).execute(days, confirm).await?;
            if !confirm {
                warn!(
                    matched = summary.matched,
                    "dry run; pass --confirm to delete these entries"
                );
            }
            print_json(&summary)?;
            store.close().await;
        }
        Commands::Stats => {
            let store = open(&config, clock).await?;
            print_json(&store.stats().await?)?;
            store.close().await;
        }
        Commands::Migrate => {
            let store = open(&config, clock).await?;
            info!(database_url = %config.database_url, "catalog schema is up to date");
            store.close().await;
        }
        Commands::Schedule { run_now } => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let store = open(&config, clock.clone()).await?;
            let pipeline = Arc::new(build_pipeline(&config, store.clone(), clock.clone()).await?);
            let sweep = ExpirySweep::new(store.clone(), clock);

            if run_now {
                run_sync_and_sweep(&pipeline, &sweep, config.reports_dir.as_ref()).await;
            }

            let Some(mut sched) = maybe_build_scheduler(&config, pipeline, sweep).await? else {
                anyhow::bail!("scheduler is disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
            store.close().await;
        }
    }

    Ok(())
}
