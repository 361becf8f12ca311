//! Lifecycle store for the event catalog: fingerprint-keyed upserts, expiry
//! sweeps, confirmed purges and aggregate counters.
//!
//! [`CatalogStore`] is the only write path into the catalog. Two backends ship
//! here: [`MemoryCatalogStore`] for tests and dry runs, and
//! [`SqliteCatalogStore`] backed by sqlx.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evcat_core::{CatalogEntry, EntryDraft, Fingerprint};
use serde::Serialize;
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::MemoryCatalogStore;
pub use sqlite::SqliteCatalogStore;

pub const CRATE_NAME: &str = "evcat-storage";

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_LOCATION_CHARS: usize = 300;
pub const MAX_DESCRIPTION_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection-level failure; nothing further can be written.
    #[error("catalog store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid draft {fingerprint}: {reason}")]
    InvalidDraft {
        fingerprint: Fingerprint,
        reason: String,
    },
    #[error("purge of entries before {cutoff} was not confirmed")]
    PurgeNotConfirmed { cutoff: DateTime<Utc> },
    #[error("corrupt catalog row {fingerprint}: {reason}")]
    Corrupt { fingerprint: String, reason: String },
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Read-only aggregate counters over the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub total: u64,
    pub active: u64,
    pub inactive: u64,
    /// Active entries whose event is still ahead of the store clock.
    pub upcoming_active: u64,
    /// Entry counts keyed by the source that introduced them.
    pub by_source: BTreeMap<String, u64>,
}

/// Caller-supplied token that authorizes one destructive purge.
///
/// The token is bound to the exact cutoff it was issued for; presenting it for a
/// different cutoff is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeConfirmation {
    cutoff: DateTime<Utc>,
}

impl PurgeConfirmation {
    pub fn confirm(cutoff: DateTime<Utc>) -> Self {
        Self { cutoff }
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff
    }

    pub fn check(&self, cutoff: DateTime<Utc>) -> Result<(), StoreError> {
        if self.cutoff == cutoff {
            Ok(())
        } else {
            Err(StoreError::PurgeNotConfirmed { cutoff })
        }
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Cheap reachability check; a failure here is fatal to an ingestion run.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert or update the entry for `draft.fingerprint` atomically.
    ///
    /// Concurrent calls for the same fingerprint are applied in some total order.
    async fn upsert(&self, draft: &EntryDraft) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CatalogEntry>, StoreError>;

    /// Flip every active entry with `occurs_at < as_of` to inactive. Returns the
    /// number of entries flipped.
    async fn sweep_expired(&self, as_of: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn count_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete entries with `occurs_at < cutoff`. Never called by ingestion or the
    /// sweep.
    async fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
        confirmation: &PurgeConfirmation,
    ) -> Result<u64, StoreError>;

    async fn stats(&self) -> Result<CatalogStats, StoreError>;

    async fn close(&self);
}

/// Reject payloads the catalog would not accept, before touching storage.
pub fn validate_draft(draft: &EntryDraft) -> Result<(), StoreError> {
    let invalid = |reason: String| StoreError::InvalidDraft {
        fingerprint: draft.fingerprint.clone(),
        reason,
    };

    if draft.fingerprint.is_empty() {
        return Err(invalid("empty fingerprint".to_string()));
    }
    if draft.source_id.trim().is_empty() {
        return Err(invalid("empty source id".to_string()));
    }
    for (name, value, max) in [
        ("title", &draft.title, MAX_TITLE_CHARS),
        ("location", &draft.location, MAX_LOCATION_CHARS),
    ] {
        if value.trim().is_empty() {
            return Err(invalid(format!("empty {name}")));
        }
        if value.chars().count() > max {
            return Err(invalid(format!("{name} exceeds {max} characters")));
        }
    }
    if draft.description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(invalid(format!(
            "description exceeds {MAX_DESCRIPTION_CHARS} characters"
        )));
    }
    for (name, url) in [("image_url", &draft.image_url), ("ticket_url", &draft.ticket_url)] {
        if !url.is_empty() && !is_http_url(url) {
            return Err(invalid(format!("{name} is not an http(s) url: {url}")));
        }
    }
    Ok(())
}

fn is_http_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    ["http://", "https://"]
        .iter()
        .any(|scheme| lower.starts_with(scheme) && lower.len() > scheme.len())
}

#[cfg(test)]
mod tests;
