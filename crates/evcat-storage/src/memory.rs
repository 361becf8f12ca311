use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evcat_core::{CatalogEntry, EntryDraft, Fingerprint, SharedClock};
use tokio::sync::Mutex;

use crate::{
    validate_draft, CatalogStats, CatalogStore, PurgeConfirmation, StoreError, UpsertOutcome,
};

/// In-process catalog. A single mutex over the map serializes every write, which
/// trivially gives the per-fingerprint ordering the pipeline relies on.
#[derive(Debug)]
pub struct MemoryCatalogStore {
    entries: Mutex<HashMap<Fingerprint, CatalogEntry>>,
    clock: SharedClock,
    closed: AtomicBool,
}

impl MemoryCatalogStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_open()
    }

    async fn upsert(&self, draft: &EntryDraft) -> Result<UpsertOutcome, StoreError> {
        self.ensure_open()?;
        validate_draft(draft)?;

        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        match entries.get_mut(&draft.fingerprint) {
            Some(entry) => {
                entry.apply_sighting(draft, now);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                entries.insert(
                    draft.fingerprint.clone(),
                    CatalogEntry::first_sighting(draft, now),
                );
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CatalogEntry>, StoreError> {
        self.ensure_open()?;
        Ok(self.entries.lock().await.get(fingerprint).cloned())
    }

    async fn sweep_expired(&self, as_of: DateTime<Utc>) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        let mut flipped = 0;
        for entry in entries.values_mut() {
            if entry.active && entry.occurs_at < as_of {
                entry.expire(now);
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn count_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let entries = self.entries.lock().await;
        Ok(entries.values().filter(|e| e.occurs_at < cutoff).count() as u64)
    }

    async fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
        confirmation: &PurgeConfirmation,
    ) -> Result<u64, StoreError> {
        self.ensure_open()?;
        confirmation.check(cutoff)?;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.occurs_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }

    async fn stats(&self) -> Result<CatalogStats, StoreError> {
        self.ensure_open()?;
        let entries = self.entries.lock().await;
        let now = self.clock.now();

        let mut by_source: BTreeMap<String, u64> = BTreeMap::new();
        let mut active = 0;
        let mut upcoming_active = 0;
        for entry in entries.values() {
            *by_source.entry(entry.first_source_id.clone()).or_default() += 1;
            if entry.active {
                active += 1;
                if entry.occurs_at >= now {
                    upcoming_active += 1;
                }
            }
        }
        let total = entries.len() as u64;

        Ok(CatalogStats {
            total,
            active,
            inactive: total - active,
            upcoming_active,
            by_source,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
