//! Core event model, fingerprinting, and clock abstraction for evcat.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use md5::{Digest, Md5};
use thiserror::Error;

pub const CRATE_NAME: &str = "evcat-core";

/// Number of digest bytes kept in a [`Fingerprint`] (128 bits).
pub const FINGERPRINT_BYTES: usize = 16;

/// Candidate as emitted by a collector, before validation.
///
/// `occurs_at` is `None` when the collector's date parser could not make sense of
/// the listing's date text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source_id: String,
    pub title: String,
    pub occurs_at: Option<DateTime<Utc>>,
    pub location: String,
    pub description: String,
    pub image_url: String,
    pub ticket_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidCandidateError {
    #[error("candidate {title:?} from {source_id} has no parseable date")]
    MissingOccursAt { source_id: String, title: String },
    #[error("candidate from {source_id} has an empty title")]
    EmptyTitle { source_id: String },
    #[error("candidate {title:?} from {source_id} has an empty location")]
    EmptyLocation { source_id: String, title: String },
}

impl RawCandidate {
    /// Clean text fields and require the fields every catalog entry needs.
    pub fn validate(self) -> Result<CandidateRecord, InvalidCandidateError> {
        let title = clean_text(&self.title);
        if title.is_empty() {
            return Err(InvalidCandidateError::EmptyTitle {
                source_id: self.source_id,
            });
        }
        let Some(occurs_at) = self.occurs_at else {
            return Err(InvalidCandidateError::MissingOccursAt {
                source_id: self.source_id,
                title,
            });
        };
        let location = clean_text(&self.location);
        if location.is_empty() {
            return Err(InvalidCandidateError::EmptyLocation {
                source_id: self.source_id,
                title,
            });
        }

        Ok(CandidateRecord {
            source_id: self.source_id,
            title,
            occurs_at,
            location,
            description: clean_text(&self.description),
            image_url: self.image_url.trim().to_string(),
            ticket_url: self.ticket_url.trim().to_string(),
        })
    }
}

/// Validated, run-scoped candidate. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source_id: String,
    pub title: String,
    pub occurs_at: DateTime<Utc>,
    pub location: String,
    pub description: String,
    pub image_url: String,
    pub ticket_url: String,
}

impl CandidateRecord {
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(&self.title, Some(self.occurs_at), &self.location)
    }

    pub fn is_past(&self, now: DateTime<Utc>) -> bool {
        self.occurs_at < now
    }
}

/// Persisted identity of an event: MD5 over the normalized
/// (title, occurs_at, location) triple, as 32 lowercase hex characters.
///
/// Existing catalogs store this exact value, so the composite layout and the
/// digest must not change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed fingerprint, e.g. one read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, collapse whitespace runs to single spaces, trim.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `YYYY-MM-DD HH:MM:SS` in UTC, with `.ffffff` only for non-zero microseconds.
pub fn normalize_timestamp(occurs_at: Option<DateTime<Utc>>) -> String {
    let Some(ts) = occurs_at else {
        return String::new();
    };
    let mut out = ts.format("%Y-%m-%d %H:%M:%S").to_string();
    let micros = ts.timestamp_subsec_micros();
    if micros != 0 {
        out.push_str(&format!(".{micros:06}"));
    }
    out
}

/// Derive the catalog identity for an event. Never fails; missing parts hash as
/// empty strings.
pub fn fingerprint(title: &str, occurs_at: Option<DateTime<Utc>>, location: &str) -> Fingerprint {
    let composite: String = format!(
        "{}{}{}",
        normalize_text(title),
        normalize_timestamp(occurs_at),
        normalize_text(location)
    )
    .chars()
    .filter(|c| !c.is_whitespace())
    .collect();

    let digest = Md5::digest(composite.as_bytes());
    Fingerprint(hex::encode(digest))
}

/// Collapse whitespace for display while keeping the original case.
pub fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Payload handed to the lifecycle store for one upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub fingerprint: Fingerprint,
    pub source_id: String,
    pub title: String,
    pub occurs_at: DateTime<Utc>,
    pub location: String,
    pub description: String,
    pub image_url: String,
    pub ticket_url: String,
}

impl From<&CandidateRecord> for EntryDraft {
    fn from(candidate: &CandidateRecord) -> Self {
        Self {
            fingerprint: candidate.fingerprint(),
            source_id: candidate.source_id.clone(),
            title: candidate.title.clone(),
            occurs_at: candidate.occurs_at,
            location: candidate.location.clone(),
            description: candidate.description.clone(),
            image_url: candidate.image_url.clone(),
            ticket_url: candidate.ticket_url.clone(),
        }
    }
}

/// Durable, fingerprint-keyed catalog record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub fingerprint: Fingerprint,
    pub title: String,
    pub occurs_at: DateTime<Utc>,
    pub location: String,
    pub description: String,
    pub image_url: String,
    pub ticket_url: String,
    pub active: bool,
    /// Source that introduced the entry; never overwritten.
    pub first_source_id: String,
    pub last_source_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub sightings: u64,
}

impl CatalogEntry {
    /// Entry as created by the first sighting of `draft`.
    pub fn first_sighting(draft: &EntryDraft, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint: draft.fingerprint.clone(),
            title: draft.title.clone(),
            occurs_at: draft.occurs_at,
            location: draft.location.clone(),
            description: draft.description.clone(),
            image_url: draft.image_url.clone(),
            ticket_url: draft.ticket_url.clone(),
            active: true,
            first_source_id: draft.source_id.clone(),
            last_source_id: draft.source_id.clone(),
            first_seen_at: now,
            last_seen_at: now,
            sightings: 1,
        }
    }

    /// Apply a later sighting: payload is latest-wins, `first_source_id` and
    /// `first_seen_at` stay put, `last_seen_at` never moves backwards, and an
    /// inactive entry only comes back for a future-dated sighting.
    pub fn apply_sighting(&mut self, draft: &EntryDraft, now: DateTime<Utc>) {
        self.title = draft.title.clone();
        self.occurs_at = draft.occurs_at;
        self.location = draft.location.clone();
        self.description = draft.description.clone();
        self.image_url = draft.image_url.clone();
        self.ticket_url = draft.ticket_url.clone();
        self.last_source_id = draft.source_id.clone();
        if draft.occurs_at >= now {
            self.active = true;
        }
        self.last_seen_at = self.last_seen_at.max(now);
        self.sightings += 1;
    }

    /// Flip to inactive as the expiry sweep does.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.active = false;
        self.last_seen_at = self.last_seen_at.max(now);
    }
}

/// Source of "now" for every time-dependent decision in the pipeline.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock with millisecond resolution.
#[derive(Debug)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
