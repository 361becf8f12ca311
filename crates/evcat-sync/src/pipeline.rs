//! One ingestion run: collect, validate, dedupe, filter, persist, report.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use evcat_collectors::{Collector, CollectorError};
use evcat_core::{CandidateRecord, EntryDraft, Fingerprint, RawCandidate, SharedClock};
use evcat_storage::{CatalogStore, StoreError, UpsertOutcome};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedupe::dedupe_with_drops;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Collecting,
    Deduplicating,
    Filtering,
    Persisting,
    Reporting,
    Done,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Collecting => "collecting",
            RunStage::Deduplicating => "deduplicating",
            RunStage::Filtering => "filtering",
            RunStage::Persisting => "persisting",
            RunStage::Reporting => "reporting",
            RunStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub error: String,
    pub timed_out: bool,
}

/// A candidate the store refused; the run carried on without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub fingerprint: Fingerprint,
    pub source_id: String,
    pub title: String,
    pub error: String,
}

/// Machine-readable outcome of one run. Always produced, even when the run
/// failed; counts then reflect the stages that completed.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub stage_reached: RunStage,
    pub scraped: usize,
    pub invalid: usize,
    pub after_dedup: usize,
    pub after_filter: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub not_persisted: usize,
    pub failed_sources: Vec<SourceFailure>,
    pub skipped_records: Vec<SkippedRecord>,
    pub fatal_error: Option<String>,
    pub timed_out: bool,
}

impl RunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            status: RunStatus::Completed,
            stage_reached: RunStage::Collecting,
            scraped: 0,
            invalid: 0,
            after_dedup: 0,
            after_filter: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            not_persisted: 0,
            failed_sources: Vec::new(),
            skipped_records: Vec::new(),
            fatal_error: None,
            timed_out: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    fn enter(&mut self, stage: RunStage) {
        debug_assert!(stage >= self.stage_reached, "run stages never move backwards");
        self.stage_reached = stage;
        info!(run_id = %self.run_id, %stage, "run stage");
    }

    fn fail(&mut self, message: String) {
        error!(run_id = %self.run_id, stage = %self.stage_reached, error = %message, "run failed");
        self.status = RunStatus::Failed;
        self.fatal_error = Some(message);
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Wall-clock budget for the whole run, measured from its start.
    pub run_timeout: Option<Duration>,
    /// Maximum upserts in flight at once.
    pub persist_concurrency: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            run_timeout: None,
            persist_concurrency: 8,
        }
    }
}

enum CollectorOutcome {
    Scraped(Vec<RawCandidate>),
    Failed(CollectorError),
    TimedOut,
}

enum PersistOutcome {
    Persisted(UpsertOutcome),
    Skipped(SkippedRecord),
    StoreDown(String),
    NotStarted,
}

pub struct SyncPipeline {
    collectors: Vec<Arc<dyn Collector>>,
    store: Arc<dyn CatalogStore>,
    clock: SharedClock,
    options: PipelineOptions,
}

impl fmt::Debug for SyncPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPipeline")
            .field(
                "collectors",
                &self.collectors.iter().map(|c| c.source_id()).collect::<Vec<_>>(),
            )
            .field("store", &self.store.backend())
            .field("options", &self.options)
            .finish()
    }
}

impl SyncPipeline {
    pub fn new(
        collectors: Vec<Box<dyn Collector>>,
        store: Arc<dyn CatalogStore>,
        clock: SharedClock,
        options: PipelineOptions,
    ) -> Self {
        Self {
            collectors: collectors.into_iter().map(Arc::from).collect(),
            store,
            clock,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.collectors
            .iter()
            .map(|c| c.source_id().to_string())
            .collect()
    }

    pub async fn run_once(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> RunSummary {
        let deadline = self.options.run_timeout.map(|t| Instant::now() + t);
        let mut summary = RunSummary::new(run_id, self.clock.now());
        info!(
            sources = self.collectors.len(),
            store = self.store.backend(),
            "starting ingestion run"
        );

        summary.enter(RunStage::Collecting);
        let raw = self.collect(deadline, &mut summary).await;
        summary.scraped = raw.len();

        let mut valid = Vec::with_capacity(raw.len());
        for candidate in raw {
            match candidate.validate() {
                Ok(record) => valid.push(record),
                Err(err) => {
                    debug!(error = %err, "discarding invalid candidate");
                    summary.invalid += 1;
                }
            }
        }
        if summary.invalid > 0 {
            warn!(invalid = summary.invalid, "invalid candidates discarded");
        }

        summary.enter(RunStage::Deduplicating);
        let (unique, dropped) = dedupe_with_drops(valid);
        summary.after_dedup = unique.len();
        debug!(dropped = dropped.len(), "deduplicated candidates");

        summary.enter(RunStage::Filtering);
        let upcoming = filter_upcoming(unique, self.clock.now());
        summary.after_filter = upcoming.len();

        summary.enter(RunStage::Persisting);
        self.persist(upcoming, deadline, &mut summary).await;

        if summary.is_success() {
            summary.enter(RunStage::Reporting);
        } else {
            info!(stage = %RunStage::Reporting, "reporting partial counts");
        }
        summary.finished_at = self.clock.now();
        info!(
            status = ?summary.status,
            scraped = summary.scraped,
            invalid = summary.invalid,
            after_dedup = summary.after_dedup,
            after_filter = summary.after_filter,
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            not_persisted = summary.not_persisted,
            failed_sources = summary.failed_sources.len(),
            timed_out = summary.timed_out,
            "ingestion run finished"
        );
        if summary.is_success() {
            summary.enter(RunStage::Done);
        }
        summary
    }

    async fn collect(
        &self,
        deadline: Option<Instant>,
        summary: &mut RunSummary,
    ) -> Vec<RawCandidate> {
        let mut tasks = JoinSet::new();
        for (index, collector) in self.collectors.iter().enumerate() {
            let collector = Arc::clone(collector);
            let span = info_span!("collector", source_id = collector.source_id());
            tasks.spawn(
                async move {
                    let outcome = match deadline {
                        Some(deadline) => match timeout_at(deadline, collector.scrape()).await {
                            Ok(result) => result,
                            Err(_) => return (index, CollectorOutcome::TimedOut),
                        },
                        None => collector.scrape().await,
                    };
                    match outcome {
                        Ok(candidates) => (index, CollectorOutcome::Scraped(candidates)),
                        Err(err) => (index, CollectorOutcome::Failed(err)),
                    }
                }
                .instrument(span),
            );
        }

        let mut outcomes: Vec<Option<CollectorOutcome>> =
            (0..self.collectors.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(err) => warn!(error = %err, "collector task did not complete"),
            }
        }

        // Concatenate in configured order regardless of completion order.
        let mut candidates = Vec::new();
        for (collector, outcome) in self.collectors.iter().zip(outcomes) {
            let source_id = collector.source_id().to_string();
            match outcome {
                Some(CollectorOutcome::Scraped(mut scraped)) => {
                    info!(%source_id, count = scraped.len(), "collector finished");
                    candidates.append(&mut scraped);
                }
                Some(CollectorOutcome::Failed(err)) => {
                    warn!(%source_id, error = %err, "collector failed; excluding source");
                    summary.failed_sources.push(SourceFailure {
                        source_id,
                        error: err.to_string(),
                        timed_out: false,
                    });
                }
                Some(CollectorOutcome::TimedOut) => {
                    warn!(%source_id, "collector abandoned at run deadline");
                    summary.timed_out = true;
                    summary.failed_sources.push(SourceFailure {
                        source_id,
                        error: "timed out".to_string(),
                        timed_out: true,
                    });
                }
                None => {
                    summary.failed_sources.push(SourceFailure {
                        source_id,
                        error: "collector task panicked".to_string(),
                        timed_out: false,
                    });
                }
            }
        }
        candidates
    }

    async fn persist(
        &self,
        candidates: Vec<CandidateRecord>,
        deadline: Option<Instant>,
        summary: &mut RunSummary,
    ) {
        // An unreachable store fails the run even when there is nothing to write.
        let ping = match deadline {
            Some(deadline) => timeout_at(deadline, self.store.ping()).await.ok(),
            None => Some(self.store.ping().await),
        };
        match ping {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                summary.not_persisted = candidates.len();
                summary.fail(format!("store unavailable: {err}"));
                return;
            }
            None => {
                warn!(pending = candidates.len(), "run deadline reached while pinging store");
                summary.timed_out = true;
                summary.not_persisted = candidates.len();
                return;
            }
        }
        if candidates.is_empty() {
            return;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(pending = candidates.len(), "run deadline passed before persisting");
            summary.timed_out = true;
            summary.not_persisted = candidates.len();
            return;
        }

        let permits = Arc::new(Semaphore::new(self.options.persist_concurrency.max(1)));
        let store_down = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut unstarted = 0usize;
        let total = candidates.len();

        for (position, candidate) in candidates.into_iter().enumerate() {
            if store_down.load(Ordering::SeqCst) {
                unstarted = total - position;
                break;
            }
            let acquired = match deadline {
                Some(deadline) => timeout_at(deadline, Arc::clone(&permits).acquire_owned())
                    .await
                    .ok(),
                None => Some(Arc::clone(&permits).acquire_owned().await),
            };
            let permit = match acquired {
                Some(Ok(permit)) => permit,
                Some(Err(_)) => {
                    unstarted = total - position;
                    break;
                }
                None => {
                    warn!(pending = total - position, "run deadline reached; dropping unpersisted candidates");
                    summary.timed_out = true;
                    unstarted = total - position;
                    break;
                }
            };

            let store = Arc::clone(&self.store);
            let store_down = Arc::clone(&store_down);
            tasks.spawn(async move {
                let _permit = permit;
                if store_down.load(Ordering::SeqCst) {
                    return PersistOutcome::NotStarted;
                }
                let draft = EntryDraft::from(&candidate);
                match store.upsert(&draft).await {
                    Ok(outcome) => PersistOutcome::Persisted(outcome),
                    Err(err) if err.is_unavailable() => {
                        store_down.store(true, Ordering::SeqCst);
                        PersistOutcome::StoreDown(err.to_string())
                    }
                    Err(err) => PersistOutcome::Skipped(skipped_record(&draft, &err)),
                }
            });
        }

        let mut store_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(PersistOutcome::Persisted(UpsertOutcome::Inserted)) => summary.inserted += 1,
                Ok(PersistOutcome::Persisted(UpsertOutcome::Updated)) => summary.updated += 1,
                Ok(PersistOutcome::Skipped(record)) => {
                    warn!(
                        fingerprint = %record.fingerprint,
                        source_id = %record.source_id,
                        error = %record.error,
                        "upsert failed; skipping record"
                    );
                    summary.skipped += 1;
                    summary.skipped_records.push(record);
                }
                Ok(PersistOutcome::StoreDown(message)) => {
                    summary.not_persisted += 1;
                    store_error.get_or_insert(message);
                }
                Ok(PersistOutcome::NotStarted) => summary.not_persisted += 1,
                Err(err) => {
                    warn!(error = %err, "upsert task did not complete");
                    summary.not_persisted += 1;
                }
            }
        }
        summary.not_persisted += unstarted;

        if let Some(message) = store_error {
            summary.fail(format!("store became unavailable: {message}"));
        }
    }
}

fn skipped_record(draft: &EntryDraft, err: &StoreError) -> SkippedRecord {
    SkippedRecord {
        fingerprint: draft.fingerprint.clone(),
        source_id: draft.source_id.clone(),
        title: draft.title.clone(),
        error: err.to_string(),
    }
}

/// Drop candidates whose event started strictly before `now`.
pub fn filter_upcoming(candidates: Vec<CandidateRecord>, now: DateTime<Utc>) -> Vec<CandidateRecord> {
    candidates.into_iter().filter(|c| !c.is_past(now)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(title: &str, occurs_at: DateTime<Utc>) -> CandidateRecord {
        CandidateRecord {
            source_id: "timeout".to_string(),
            title: title.to_string(),
            occurs_at,
            location: "Sydney".to_string(),
            description: String::new(),
            image_url: String::new(),
            ticket_url: String::new(),
        }
    }

    #[test]
    fn filter_keeps_events_at_or_after_now() {
        let now = Utc
            .with_ymd_and_hms(2026, 5, 1, 12, 0, 0)
            .single()
            .expect("valid date");
        let kept = filter_upcoming(
            vec![
                record("past", now - chrono::Duration::seconds(1)),
                record("now", now),
                record("later", now + chrono::Duration::days(1)),
            ],
            now,
        );
        let titles: Vec<_> = kept.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, ["now", "later"]);
    }

    #[test]
    fn stages_are_ordered() {
        assert!(RunStage::Collecting < RunStage::Deduplicating);
        assert!(RunStage::Persisting < RunStage::Reporting);
        assert!(RunStage::Reporting < RunStage::Done);
        assert_eq!(RunStage::Deduplicating.to_string(), "deduplicating");
    }

    #[test]
    fn summary_serializes_snake_case() {
        let started = Utc
            .with_ymd_and_hms(2026, 5, 1, 12, 0, 0)
            .single()
            .expect("valid date");
        let summary = RunSummary::new(Uuid::nil(), started);
        let json = serde_json::to_value(&summary).expect("json");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["stage_reached"], "collecting");
        assert_eq!(json["after_dedup"], 0);
        assert!(json["fatal_error"].is_null());
    }
}
