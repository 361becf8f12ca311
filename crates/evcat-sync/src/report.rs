use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::pipeline::{RunStatus, RunSummary};

/// Write `<reports_dir>/<run_id>/summary.json` and a short markdown brief next
/// to it. Returns the run's report directory.
pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    fs::write(run_dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;

    Ok(run_dir)
}

pub fn render_brief(summary: &RunSummary) -> String {
    let status = match summary.status {
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
    };
    let mut out = format!(
        "# evcat run {}\n\n- Status: {}\n- Started: {}\n- Finished: {}\n\n\
         | scraped | invalid | after dedup | after filter | inserted | updated | skipped | not persisted |\n\
         |---|---|---|---|---|---|---|---|\n\
         | {} | {} | {} | {} | {} | {} | {} | {} |\n",
        summary.run_id,
        status,
        summary.started_at,
        summary.finished_at,
        summary.scraped,
        summary.invalid,
        summary.after_dedup,
        summary.after_filter,
        summary.inserted,
        summary.updated,
        summary.skipped,
        summary.not_persisted,
    );

    if let Some(fatal) = &summary.fatal_error {
        out.push_str(&format!("\n**Fatal:** {fatal} (stopped while {})\n", summary.stage_reached));
    }
    if !summary.failed_sources.is_empty() {
        out.push_str("\n## Failed sources\n");
        for failure in &summary.failed_sources {
            out.push_str(&format!("- {}: {}\n", failure.source_id, failure.error));
        }
    }
    if !summary.skipped_records.is_empty() {
        out.push_str("\n## Skipped records\n");
        for record in &summary.skipped_records {
            out.push_str(&format!(
                "- {} ({}, {}): {}\n",
                record.title, record.source_id, record.fingerprint, record.error
            ));
        }
    }
    out
}
