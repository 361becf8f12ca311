use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::pipeline::SyncPipeline;
use crate::report::write_run_report;
use crate::sweep::ExpirySweep;

/// Ingestion followed by a sweep, as run by the periodic sync job.
pub async fn run_sync_and_sweep(
    pipeline: &SyncPipeline,
    sweep: &ExpirySweep,
    reports_dir: Option<&PathBuf>,
) {
    let summary = pipeline.run_once().await;
    if let Some(dir) = reports_dir {
        match write_run_report(dir, &summary).await {
            Ok(path) => info!(path = %path.display(), "run report written"),
            Err(err) => warn!(error = %err, "failed to write run report"),
        }
    }
    if let Err(err) = sweep.run().await {
        error!(error = %err, "post-sync expiry sweep failed");
    }
}

/// Build the two periodic jobs when scheduling is enabled. The caller starts
/// and shuts down the returned scheduler.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
    sweep: ExpirySweep,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let reports_dir = config.reports_dir.clone();
    let sync_sweep = sweep.clone();
    let sync_job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        let sweep = sync_sweep.clone();
        let reports_dir = reports_dir.clone();
        Box::pin(async move {
            info!("scheduled sync triggered");
            run_sync_and_sweep(&pipeline, &sweep, reports_dir.as_ref()).await;
        })
    })
    .with_context(|| format!("creating sync job for cron {}", config.sync_cron))?;
    sched.add(sync_job).await.context("adding sync job")?;

    let sweep_job = Job::new_async(config.sweep_cron.as_str(), move |_uuid, _lock| {
        let sweep = sweep.clone();
        Box::pin(async move {
            info!("scheduled sweep triggered");
            if let Err(err) = sweep.run().await {
                error!(error = %err, "scheduled expiry sweep failed");
            }
        })
    })
    .with_context(|| format!("creating sweep job for cron {}", config.sweep_cron))?;
    sched.add(sweep_job).await.context("adding sweep job")?;

    info!(
        sync_cron = %config.sync_cron,
        sweep_cron = %config.sweep_cron,
        "scheduler configured"
    );
    Ok(Some(sched))
}
