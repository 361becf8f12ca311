//! Behavioural suite run against every `CatalogStore` backend.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use evcat_core::{fingerprint, Clock, EntryDraft, FixedClock, SharedClock};

use crate::{
    CatalogStore, MemoryCatalogStore, PurgeConfirmation, SqliteCatalogStore, StoreError,
    UpsertOutcome,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
}

fn draft(title: &str, occurs_at: DateTime<Utc>, source_id: &str) -> EntryDraft {
    let location = "Art Gallery of NSW";
    EntryDraft {
        fingerprint: fingerprint(title, Some(occurs_at), location),
        source_id: source_id.to_string(),
        title: title.to_string(),
        occurs_at,
        location: location.to_string(),
        description: format!("{title} description"),
        image_url: "https://example.com/image.jpg".to_string(),
        ticket_url: "https://example.com/tickets".to_string(),
    }
}

async fn memory(clock: SharedClock) -> MemoryCatalogStore {
    MemoryCatalogStore::new(clock)
}

async fn sqlite(clock: SharedClock) -> SqliteCatalogStore {
    SqliteCatalogStore::open_in_memory(clock)
        .await
        .expect("in-memory sqlite store")
}

async fn upsert_twice_reports_updated<S: CatalogStore>(store: S, _clock: Arc<FixedClock>) {
    let d = draft("Art After Dark", t0() + Duration::days(3), "whatson");
    assert_eq!(store.upsert(&d).await.unwrap(), UpsertOutcome::Inserted);
    assert_eq!(store.upsert(&d).await.unwrap(), UpsertOutcome::Updated);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.active, 1);

    let entry = store.get(&d.fingerprint).await.unwrap().unwrap();
    assert!(entry.active);
    assert_eq!(entry.sightings, 2);
    assert_eq!(entry.last_seen_at, t0());
}

async fn sweep_flips_only_elapsed_entries<S: CatalogStore>(store: S, clock: Arc<FixedClock>) {
    let past = draft("Jazz Night", t0() - Duration::hours(1), "timeout");
    let future = draft("Tech Meetup", t0() + Duration::hours(1), "eventbrite");
    clock.set(t0() - Duration::hours(2));
    store.upsert(&past).await.unwrap();
    store.upsert(&future).await.unwrap();

    clock.set(t0());
    assert_eq!(store.sweep_expired(t0()).await.unwrap(), 1);
    assert_eq!(store.sweep_expired(t0()).await.unwrap(), 0);

    let expired = store.get(&past.fingerprint).await.unwrap().unwrap();
    assert!(!expired.active);
    assert_eq!(expired.last_seen_at, t0());
    let upcoming = store.get(&future.fingerprint).await.unwrap().unwrap();
    assert!(upcoming.active);
    assert_eq!(upcoming.last_seen_at, t0() - Duration::hours(2));
}

async fn later_sightings_keep_first_source<S: CatalogStore>(store: S, _clock: Arc<FixedClock>) {
    let first = draft("Art After Dark", t0() + Duration::days(3), "whatson");
    let mut second = first.clone();
    second.source_id = "timeout".to_string();
    second.description = "Late-night tours, now with live music".to_string();

    store.upsert(&first).await.unwrap();
    store.upsert(&second).await.unwrap();

    let entry = store.get(&first.fingerprint).await.unwrap().unwrap();
    assert_eq!(entry.first_source_id, "whatson");
    assert_eq!(entry.last_source_id, "timeout");
    assert_eq!(entry.description, "Late-night tours, now with live music");

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.by_source.get("whatson"), Some(&1));
    assert_eq!(stats.by_source.get("timeout"), None);
}

async fn last_seen_never_moves_backwards<S: CatalogStore>(store: S, clock: Arc<FixedClock>) {
    let d = draft("Harbour Lights", t0() + Duration::days(10), "timeout");
    store.upsert(&d).await.unwrap();

    clock.set(t0() - Duration::minutes(5));
    store.upsert(&d).await.unwrap();
    store.sweep_expired(t0() + Duration::days(11)).await.unwrap();

    let entry = store.get(&d.fingerprint).await.unwrap().unwrap();
    assert_eq!(entry.last_seen_at, t0());
}

async fn inactive_entry_revives_only_for_future_sighting<S: CatalogStore>(
    store: S,
    clock: Arc<FixedClock>,
) {
    let d = draft("Food & Wine Festival", t0() + Duration::days(1), "eventbrite");
    store.upsert(&d).await.unwrap();

    clock.set(t0() + Duration::days(2));
    assert_eq!(store.sweep_expired(clock.now()).await.unwrap(), 1);

    assert_eq!(store.upsert(&d).await.unwrap(), UpsertOutcome::Updated);
    let entry = store.get(&d.fingerprint).await.unwrap().unwrap();
    assert!(!entry.active);

    clock.set(t0());
    store.upsert(&d).await.unwrap();
    let entry = store.get(&d.fingerprint).await.unwrap().unwrap();
    assert!(entry.active);
    assert_eq!(entry.sightings, 3);
}

async fn purge_requires_matching_confirmation<S: CatalogStore>(store: S, _clock: Arc<FixedClock>) {
    let old = draft("Old Show", t0() - Duration::days(120), "timeout");
    let recent = draft("Recent Show", t0() - Duration::days(10), "timeout");
    store.upsert(&old).await.unwrap();
    store.upsert(&recent).await.unwrap();

    let cutoff = t0() - Duration::days(90);
    assert_eq!(store.count_older_than(cutoff).await.unwrap(), 1);

    let wrong = PurgeConfirmation::confirm(cutoff - Duration::days(1));
    let err = store.purge_older_than(cutoff, &wrong).await.unwrap_err();
    assert!(matches!(err, StoreError::PurgeNotConfirmed { .. }));
    assert_eq!(store.stats().await.unwrap().total, 2);

    let ok = PurgeConfirmation::confirm(cutoff);
    assert_eq!(store.purge_older_than(cutoff, &ok).await.unwrap(), 1);
    assert!(store.get(&old.fingerprint).await.unwrap().is_none());
    assert!(store.get(&recent.fingerprint).await.unwrap().is_some());
}

async fn stats_count_upcoming_and_sources<S: CatalogStore>(store: S, clock: Arc<FixedClock>) {
    clock.set(t0() - Duration::days(5));
    store
        .upsert(&draft("Past Gig", t0() - Duration::days(1), "timeout"))
        .await
        .unwrap();
    store
        .upsert(&draft("Tech Meetup", t0() + Duration::days(7), "eventbrite"))
        .await
        .unwrap();
    store
        .upsert(&draft("Food & Wine", t0() + Duration::days(20), "eventbrite"))
        .await
        .unwrap();

    clock.set(t0());
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.active, 3);
    assert_eq!(stats.inactive, 0);
    assert_eq!(stats.upcoming_active, 2);
    assert_eq!(stats.by_source.get("eventbrite"), Some(&2));
    assert_eq!(stats.by_source.get("timeout"), Some(&1));

    store.sweep_expired(t0()).await.unwrap();
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.active, 2);
    assert_eq!(stats.inactive, 1);
}

async fn malformed_draft_is_rejected<S: CatalogStore>(store: S, _clock: Arc<FixedClock>) {
    let mut d = draft("Art After Dark", t0() + Duration::days(3), "whatson");
    d.ticket_url = "ftp://tickets.example".to_string();
    let err = store.upsert(&d).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidDraft { .. }));
    assert!(!err.is_unavailable());
    assert_eq!(store.stats().await.unwrap().total, 0);
}

async fn concurrent_upserts_on_one_fingerprint_all_land<S: CatalogStore + 'static>(
    store: S,
    _clock: Arc<FixedClock>,
) {
    let store = Arc::new(store);
    let d = draft("Vivid Sydney", t0() + Duration::days(30), "whatson");

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        let mut d = d.clone();
        d.source_id = format!("source-{}", i % 4);
        handles.push(tokio::spawn(async move { store.upsert(&d).await }));
    }

    let mut inserted = 0;
    let mut updated = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            UpsertOutcome::Inserted => inserted += 1,
            UpsertOutcome::Updated => updated += 1,
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(updated, 15);

    let entry = store.get(&d.fingerprint).await.unwrap().unwrap();
    assert_eq!(entry.sightings, 16);
    assert_eq!(store.stats().await.unwrap().total, 1);
}

async fn sweeps_and_upserts_interleave_without_lost_writes<S: CatalogStore + 'static>(
    store: S,
    clock: Arc<FixedClock>,
) {
    let store = Arc::new(store);
    let past = draft("Matinee", t0() - Duration::hours(1), "timeout");
    let future = draft("Evening Show", t0() + Duration::days(1), "eventbrite");
    store.upsert(&past).await.unwrap();
    store.upsert(&future).await.unwrap();

    let rounds: i64 = 8;
    let upserts_per_round: u64 = 4;
    let mut flipped = 0;
    let mut previous_seen = t0();
    for round in 0..rounds {
        let now = t0() + Duration::minutes(round);
        clock.set(now);

        let mut handles = Vec::new();
        for i in 0..upserts_per_round {
            for d in [&past, &future] {
                let store = Arc::clone(&store);
                let d = d.clone();
                handles.push(tokio::spawn(async move {
                    store.upsert(&d).await.map(|_| 0)
                }));
            }
            if i % 2 == 0 {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move { store.sweep_expired(now).await }));
            }
        }
        for handle in handles {
            flipped += handle.await.unwrap().unwrap();
        }

        let expired = store.get(&past.fingerprint).await.unwrap().unwrap();
        assert!(!expired.active, "round {round}");
        assert_eq!(expired.last_seen_at, now);
        assert!(expired.last_seen_at >= previous_seen);
        previous_seen = expired.last_seen_at;

        let upcoming = store.get(&future.fingerprint).await.unwrap().unwrap();
        assert!(upcoming.active, "round {round}");
        assert_eq!(upcoming.last_seen_at, now);
    }

    // Only the first sweep to run finds the elapsed entry still active.
    assert_eq!(flipped, 1);
    let expected = 1 + rounds as u64 * upserts_per_round;
    for d in [&past, &future] {
        let entry = store.get(&d.fingerprint).await.unwrap().unwrap();
        assert_eq!(entry.sightings, expected);
    }
}

async fn closed_store_is_unavailable<S: CatalogStore>(store: S, _clock: Arc<FixedClock>) {
    store.ping().await.unwrap();
    store.close().await;
    assert!(store.ping().await.unwrap_err().is_unavailable());
    let d = draft("Art After Dark", t0() + Duration::days(3), "whatson");
    assert!(store.upsert(&d).await.unwrap_err().is_unavailable());
}

macro_rules! backend_suite {
    ($backend:ident) => {
        mod $backend {
            use super::*;

            async fn setup() -> (impl CatalogStore + 'static, Arc<FixedClock>) {
                let clock = Arc::new(FixedClock::new(t0()));
                let store = super::$backend(clock.clone()).await;
                (store, clock)
            }

            #[tokio::test]
            async fn upsert_twice_reports_updated() {
                let (store, clock) = setup().await;
                super::upsert_twice_reports_updated(store, clock).await;
            }

            #[tokio::test]
            async fn sweep_flips_only_elapsed_entries() {
                let (store, clock) = setup().await;
                super::sweep_flips_only_elapsed_entries(store, clock).await;
            }

            #[tokio::test]
            async fn later_sightings_keep_first_source() {
                let (store, clock) = setup().await;
                super::later_sightings_keep_first_source(store, clock).await;
            }

            #[tokio::test]
            async fn last_seen_never_moves_backwards() {
                let (store, clock) = setup().await;
                super::last_seen_never_moves_backwards(store, clock).await;
            }

            #[tokio::test]
            async fn inactive_entry_revives_only_for_future_sighting() {
                let (store, clock) = setup().await;
                super::inactive_entry_revives_only_for_future_sighting(store, clock).await;
            }

            #[tokio::test]
            async fn purge_requires_matching_confirmation() {
                let (store, clock) = setup().await;
                super::purge_requires_matching_confirmation(store, clock).await;
            }

            #[tokio::test]
            async fn stats_count_upcoming_and_sources() {
                let (store, clock) = setup().await;
                super::stats_count_upcoming_and_sources(store, clock).await;
            }

            #[tokio::test]
            async fn malformed_draft_is_rejected() {
                let (store, clock) = setup().await;
                super::malformed_draft_is_rejected(store, clock).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn concurrent_upserts_on_one_fingerprint_all_land() {
                let (store, clock) = setup().await;
                super::concurrent_upserts_on_one_fingerprint_all_land(store, clock).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn sweeps_and_upserts_interleave_without_lost_writes() {
                let (store, clock) = setup().await;
                super::sweeps_and_upserts_interleave_without_lost_writes(store, clock).await;
            }

            #[tokio::test]
            async fn closed_store_is_unavailable() {
                let (store, clock) = setup().await;
                super::closed_store_is_unavailable(store, clock).await;
            }
        }
    };
}

backend_suite!(memory);
backend_suite!(sqlite);

#[tokio::test]
async fn sqlite_file_store_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("catalog.db").display());
    let clock = Arc::new(FixedClock::new(t0()));

    let d = draft("Art After Dark", t0() + Duration::days(3), "whatson");
    let store = SqliteCatalogStore::open(&url, clock.clone()).await.unwrap();
    assert_eq!(store.upsert(&d).await.unwrap(), UpsertOutcome::Inserted);
    store.close().await;

    let reopened = SqliteCatalogStore::open(&url, clock).await.unwrap();
    assert_eq!(reopened.upsert(&d).await.unwrap(), UpsertOutcome::Updated);
    let entry = reopened.get(&d.fingerprint).await.unwrap().unwrap();
    assert_eq!(entry.occurs_at, d.occurs_at);
    assert_eq!(entry.first_seen_at, t0());
    assert_eq!(entry.sightings, 2);
}

#[tokio::test]
async fn sqlite_connect_to_unreachable_path_is_unavailable() {
    let clock: SharedClock = Arc::new(FixedClock::new(t0()));
    let err = SqliteCatalogStore::connect("sqlite:///nonexistent-dir/evcat/catalog.db", clock)
        .await
        .unwrap_err();
    assert!(err.is_unavailable());
}
