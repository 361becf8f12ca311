//! Within-run deduplication by content fingerprint.

use std::collections::HashSet;

use evcat_core::{CandidateRecord, Fingerprint};
use serde::Serialize;
use tracing::debug;

/// A candidate dropped because an earlier one had the same fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedDuplicate {
    pub fingerprint: Fingerprint,
    pub source_id: String,
    pub title: String,
}

/// Keep the first candidate per fingerprint, preserving input order.
pub fn dedupe(candidates: Vec<CandidateRecord>) -> Vec<CandidateRecord> {
    dedupe_with_drops(candidates).0
}

/// Like [`dedupe`], also returning what was dropped.
pub fn dedupe_with_drops(
    candidates: Vec<CandidateRecord>,
) -> (Vec<CandidateRecord>, Vec<DroppedDuplicate>) {
    let mut seen = HashSet::with_capacity(candidates.len());
    let mut kept = Vec::with_capacity(candidates.len());
    let mut dropped = Vec::new();

    for candidate in candidates {
        let fingerprint = candidate.fingerprint();
        if seen.insert(fingerprint.clone()) {
            kept.push(candidate);
        } else {
            debug!(
                %fingerprint,
                source_id = %candidate.source_id,
                title = %candidate.title,
                "dropping duplicate candidate"
            );
            dropped.push(DroppedDuplicate {
                fingerprint,
                source_id: candidate.source_id,
                title: candidate.title,
            });
        }
    }
    (kept, dropped)
}
