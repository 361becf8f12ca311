//! Ingestion orchestration for the event catalog: source registry, run
//! pipeline, deduplication, expiry sweep, purge, reports and scheduling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use evcat_collectors::{collector_for_source, Collector, CollectorContext, HttpFetcher, HttpFetcherConfig};
use evcat_core::SharedClock;
use evcat_storage::{CatalogStore, SqliteCatalogStore};
use tracing::info;

pub mod config;
pub mod dedupe;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod sweep;

pub use config::{SourceRegistry, SyncConfig};
pub use dedupe::{dedupe, dedupe_with_drops, DroppedDuplicate};
pub use pipeline::{
    filter_upcoming, PipelineOptions, RunStage, RunStatus, RunSummary, SkippedRecord,
    SourceFailure, SyncPipeline,
};
pub use report::{render_brief, write_run_report};
pub use scheduler::{maybe_build_scheduler, run_sync_and_sweep};
pub use sweep::{ExpirySweep, Purge, PurgeSummary, SweepSummary};

pub const CRATE_NAME: &str = "evcat-sync";

/// Filesystem path behind a `sqlite:` URL, if it names a file.
pub fn sqlite_file_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// Open (creating if needed) and migrate the configured SQLite catalog.
pub async fn open_store(config: &SyncConfig, clock: SharedClock) -> Result<SqliteCatalogStore> {
    if let Some(parent) = sqlite_file_path(&config.database_url)
        .as_deref()
        .and_then(|p| p.parent())
        .filter(|p| !p.as_os_str().is_empty())
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    SqliteCatalogStore::open(&config.database_url, clock)
        .await
        .with_context(|| format!("opening catalog store {}", config.database_url))
}

/// One collector per enabled source in `sources.yaml`, in registry order.
pub async fn build_collectors(
    config: &SyncConfig,
    clock: SharedClock,
) -> Result<Vec<Box<dyn Collector>>> {
    let registry = SourceRegistry::load(&config.sources_path()).await?;
    let http = HttpFetcher::new(HttpFetcherConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: config.user_agent.clone(),
        ..Default::default()
    })?;
    let ctx = CollectorContext {
        http: Arc::new(http),
        clock,
        workspace_root: config.workspace_root.clone(),
    };

    registry
        .enabled()
        .map(|source| {
            collector_for_source(source, &ctx)
                .with_context(|| format!("building collector for {}", source.source_id))
        })
        .collect()
}

pub async fn build_pipeline(
    config: &SyncConfig,
    store: Arc<dyn CatalogStore>,
    clock: SharedClock,
) -> Result<SyncPipeline> {
    let collectors = build_collectors(config, clock.clone()).await?;
    info!(sources = collectors.len(), "collectors ready");
    Ok(SyncPipeline::new(
        collectors,
        store,
        clock,
        PipelineOptions {
            run_timeout: config.run_timeout,
            persist_concurrency: config.persist_concurrency,
        },
    ))
}
