//! Catalog maintenance that runs outside ingestion: the expiry sweep and the
//! confirmed retention purge.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use evcat_core::SharedClock;
use evcat_storage::{CatalogStore, PurgeConfirmation, StoreError};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub swept_at: DateTime<Utc>,
    pub flipped: u64,
}

/// Marks elapsed events inactive. Safe to run while ingestion is in progress.
#[derive(Clone)]
pub struct ExpirySweep {
    store: Arc<dyn CatalogStore>,
    clock: SharedClock,
}

impl ExpirySweep {
    pub fn new(store: Arc<dyn CatalogStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub async fn run(&self) -> Result<SweepSummary, StoreError> {
        let swept_at = self.clock.now();
        let flipped = self.store.sweep_expired(swept_at).await?;
        info!(%swept_at, flipped, "expiry sweep finished");
        Ok(SweepSummary { swept_at, flipped })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub cutoff: DateTime<Utc>,
    pub matched: u64,
    pub deleted: u64,
    pub confirmed: bool,
}

/// Deletes entries whose event is older than a retention window. Nothing is
/// deleted unless the caller confirms.
#[derive(Clone)]
pub struct Purge {
    store: Arc<dyn CatalogStore>,
    clock: SharedClock,
}

impl Purge {
    pub fn new(store: Arc<dyn CatalogStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub fn cutoff_for(&self, older_than_days: u32) -> DateTime<Utc> {
        self.clock.now() - Duration::days(i64::from(older_than_days))
    }

    /// Count what a purge with this window would delete.
    pub async fn preview(&self, older_than_days: u32) -> Result<PurgeSummary, StoreError> {
        let cutoff = self.cutoff_for(older_than_days);
        let matched = self.store.count_older_than(cutoff).await?;
        Ok(PurgeSummary {
            cutoff,
            matched,
            deleted: 0,
            confirmed: false,
        })
    }

    pub async fn execute(
        &self,
        older_than_days: u32,
        confirmed: bool,
    ) -> Result<PurgeSummary, StoreError> {
        let preview = self.preview(older_than_days).await?;
        if !confirmed {
            warn!(
                cutoff = %preview.cutoff,
                matched = preview.matched,
                "purge not confirmed; nothing deleted"
            );
            return Ok(preview);
        }

        let token = PurgeConfirmation::confirm(preview.cutoff);
        let deleted = self.store.purge_older_than(preview.cutoff, &token).await?;
        info!(cutoff = %preview.cutoff, deleted, "purged old catalog entries");
        Ok(PurgeSummary {
            deleted,
            confirmed: true,
            ..preview
        })
    }
}
