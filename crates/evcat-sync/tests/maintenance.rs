use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use evcat_core::{fingerprint, EntryDraft, FixedClock};
use evcat_storage::{CatalogStore, MemoryCatalogStore, SqliteCatalogStore, UpsertOutcome};
use evcat_sync::{ExpirySweep, Purge};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0)
        .single()
        .expect("valid date")
}

fn draft(title: &str, occurs_at: DateTime<Utc>) -> EntryDraft {
    EntryDraft {
        fingerprint: fingerprint(title, Some(occurs_at), "Enmore Theatre"),
        source_id: "timeout".to_string(),
        title: title.to_string(),
        occurs_at,
        location: "Enmore Theatre".to_string(),
        description: String::new(),
        image_url: String::new(),
        ticket_url: String::new(),
    }
}

#[tokio::test]
async fn sweep_flips_only_elapsed_entries_and_is_idempotent() {
    let clock = Arc::new(FixedClock::new(now() - Duration::hours(2)));
    let store = Arc::new(MemoryCatalogStore::new(clock.clone()));
    let earlier = draft("Matinee", now() - Duration::hours(1));
    let later = draft("Evening Show", now() + Duration::hours(1));
    store.upsert(&earlier).await.expect("upsert");
    store.upsert(&later).await.expect("upsert");

    clock.set(now());
    let sweep = ExpirySweep::new(store.clone(), clock.clone());
    let first = sweep.run().await.expect("sweep");
    assert_eq!(first.flipped, 1);
    assert_eq!(first.swept_at, now());

    let second = sweep.run().await.expect("sweep");
    assert_eq!(second.flipped, 0);

    let expired = store.get(&earlier.fingerprint).await.expect("get").expect("entry");
    assert!(!expired.active);
    assert_eq!(expired.last_seen_at, now());
    let upcoming = store.get(&later.fingerprint).await.expect("get").expect("entry");
    assert!(upcoming.active);
}

#[tokio::test]
async fn stale_sighting_does_not_revive_swept_entry() {
    let clock = Arc::new(FixedClock::new(now() - Duration::days(1)));
    let store = Arc::new(MemoryCatalogStore::new(clock.clone()));
    let show = draft("Late Show", now() - Duration::hours(3));
    store.upsert(&show).await.expect("upsert");

    clock.set(now());
    ExpirySweep::new(store.clone(), clock.clone())
        .run()
        .await
        .expect("sweep");

    assert_eq!(
        store.upsert(&show).await.expect("upsert"),
        UpsertOutcome::Updated
    );
    let entry = store.get(&show.fingerprint).await.expect("get").expect("entry");
    assert!(!entry.active);
}

#[tokio::test]
async fn purge_requires_confirmation() {
    let clock = Arc::new(FixedClock::new(now()));
    let store = Arc::new(
        SqliteCatalogStore::open_in_memory(clock.clone())
            .await
            .expect("sqlite"),
    );
    store
        .upsert(&draft("Old Festival", now() - Duration::days(120)))
        .await
        .expect("upsert");
    store
        .upsert(&draft("Recent Gig", now() - Duration::days(10)))
        .await
        .expect("upsert");
    store
        .upsert(&draft("Next Gig", now() + Duration::days(10)))
        .await
        .expect("upsert");

    let purge = Purge::new(store.clone(), clock.clone());
    let preview = purge.preview(90).await.expect("preview");
    assert_eq!(preview.matched, 1);
    assert_eq!(preview.cutoff, now() - Duration::days(90));

    let declined = purge.execute(90, false).await.expect("execute");
    assert!(!declined.confirmed);
    assert_eq!(declined.deleted, 0);
    assert_eq!(store.stats().await.expect("stats").total, 3);

    let confirmed = purge.execute(90, true).await.expect("execute");
    assert!(confirmed.confirmed);
    assert_eq!((confirmed.matched, confirmed.deleted), (1, 1));
    assert_eq!(store.stats().await.expect("stats").total, 2);
}
