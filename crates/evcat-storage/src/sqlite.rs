use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evcat_core::{CatalogEntry, EntryDraft, Fingerprint, SharedClock};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use tracing::{debug, info};

use crate::{
    validate_draft, CatalogStats, CatalogStore, PurgeConfirmation, StoreError, UpsertOutcome,
};

const UPSERT_SQL: &str = "
INSERT INTO catalog_entries (
    fingerprint, title, occurs_at, location, description, image_url, ticket_url,
    active, first_source_id, last_source_id, first_seen_at, last_seen_at, sightings
) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, 1)
ON CONFLICT (fingerprint) DO UPDATE SET
    title          = excluded.title,
    occurs_at      = excluded.occurs_at,
    location       = excluded.location,
    description    = excluded.description,
    image_url      = excluded.image_url,
    ticket_url     = excluded.ticket_url,
    last_source_id = excluded.last_source_id,
    active         = CASE WHEN excluded.occurs_at >= excluded.last_seen_at
                          THEN 1 ELSE catalog_entries.active END,
    last_seen_at   = MAX(catalog_entries.last_seen_at, excluded.last_seen_at),
    sightings      = catalog_entries.sightings + 1
RETURNING sightings
";

const SELECT_ENTRY_SQL: &str = "
SELECT fingerprint, title, occurs_at, location, description, image_url, ticket_url,
       active, first_source_id, last_source_id, first_seen_at, last_seen_at, sightings
FROM catalog_entries
WHERE fingerprint = ?
";

/// Catalog persisted in SQLite. Every mutation is a single statement, so SQLite's
/// writer lock provides the per-fingerprint ordering.
#[derive(Debug, Clone)]
pub struct SqliteCatalogStore {
    pool: SqlitePool,
    clock: SharedClock,
}

impl SqliteCatalogStore {
    /// Connect without running migrations.
    pub async fn connect(database_url: &str, clock: SharedClock) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::Unavailable(format!("invalid database url {database_url}: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("connecting to {database_url}: {e}")))?;

        info!(database_url, "connected to catalog store");
        Ok(Self { pool, clock })
    }

    /// Connect and bring the schema up to date.
    pub async fn open(database_url: &str, clock: SharedClock) -> Result<Self, StoreError> {
        let store = Self::connect(database_url, clock).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn open_in_memory(clock: SharedClock) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("opening in-memory catalog: {e}")))?;

        let store = Self { pool, clock };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("catalog migrations applied");
        Ok(())
    }
}

fn millis_to_utc(millis: i64, fingerprint: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        fingerprint: fingerprint.to_string(),
        reason: format!("timestamp out of range: {millis}"),
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<CatalogEntry, StoreError> {
    let fingerprint: String = row.try_get("fingerprint")?;
    let occurs_at = millis_to_utc(row.try_get("occurs_at")?, &fingerprint)?;
    let first_seen_at = millis_to_utc(row.try_get("first_seen_at")?, &fingerprint)?;
    let last_seen_at = millis_to_utc(row.try_get("last_seen_at")?, &fingerprint)?;
    let active: i64 = row.try_get("active")?;
    let sightings: i64 = row.try_get("sightings")?;

    Ok(CatalogEntry {
        title: row.try_get("title")?,
        occurs_at,
        location: row.try_get("location")?,
        description: row.try_get("description")?,
        image_url: row.try_get("image_url")?,
        ticket_url: row.try_get("ticket_url")?,
        active: active != 0,
        first_source_id: row.try_get("first_source_id")?,
        last_source_id: row.try_get("last_source_id")?,
        first_seen_at,
        last_seen_at,
        sightings: sightings.max(0) as u64,
        fingerprint: Fingerprint::from_hex(fingerprint),
    })
}

fn count(value: i64) -> u64 {
    value.max(0) as u64
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn upsert(&self, draft: &EntryDraft) -> Result<UpsertOutcome, StoreError> {
        validate_draft(draft)?;
        let now = self.clock.now().timestamp_millis();

        let row = sqlx::query(UPSERT_SQL)
            .bind(draft.fingerprint.as_str())
            .bind(draft.title.as_str())
            .bind(draft.occurs_at.timestamp_millis())
            .bind(draft.location.as_str())
            .bind(draft.description.as_str())
            .bind(draft.image_url.as_str())
            .bind(draft.ticket_url.as_str())
            .bind(draft.source_id.as_str())
            .bind(draft.source_id.as_str())
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        let sightings: i64 = row.try_get("sightings")?;
        Ok(if sightings <= 1 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CatalogEntry>, StoreError> {
        let row = sqlx::query(SELECT_ENTRY_SQL)
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn sweep_expired(&self, as_of: DateTime<Utc>) -> Result<u64, StoreError> {
        let now = self.clock.now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE catalog_entries
             SET active = 0, last_seen_at = MAX(last_seen_at, ?)
             WHERE active = 1 AND occurs_at < ?",
        )
        .bind(now)
        .bind(as_of.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM catalog_entries WHERE occurs_at < ?")
            .bind(cutoff.timestamp_millis())
            .fetch_one(&self.pool)
            .await?;
        Ok(count(row.try_get("n")?))
    }

    async fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
        confirmation: &PurgeConfirmation,
    ) -> Result<u64, StoreError> {
        confirmation.check(cutoff)?;
        let result = sqlx::query("DELETE FROM catalog_entries WHERE occurs_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<CatalogStats, StoreError> {
        let now = self.clock.now().timestamp_millis();
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(active), 0) AS active,
                    COALESCE(SUM(CASE WHEN active = 1 AND occurs_at >= ? THEN 1 ELSE 0 END), 0)
                        AS upcoming_active
             FROM catalog_entries",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            "SELECT first_source_id, COUNT(*) AS n
             FROM catalog_entries
             GROUP BY first_source_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_source = BTreeMap::new();
        for row in &rows {
            let source: String = row.try_get("first_source_id")?;
            by_source.insert(source, count(row.try_get("n")?));
        }

        let total = count(totals.try_get("total")?);
        let active = count(totals.try_get("active")?);
        Ok(CatalogStats {
            total,
            active,
            inactive: total.saturating_sub(active),
            upcoming_active: count(totals.try_get("upcoming_active")?),
            by_source,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("catalog store closed");
    }
}
