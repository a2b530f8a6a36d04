//! SQLite-backed dedup state: scanned listings and job completion history.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flipscan_core::{CandidateListing, JobHistoryRecord, ListingMetadata, ReferencePrice};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteQueryResult};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, error};

use crate::{retry_transient, BackoffPolicy, RetryError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opening store {url}: {source}")]
    Open {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("`{statement}` still contended after {attempts} attempts")]
    Contention {
        statement: &'static str,
        attempts: usize,
    },
    #[error("`{statement}` failed: {source}")]
    Statement {
        statement: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// SQLITE_BUSY / SQLITE_LOCKED (including extended codes) or a saturated pool.
pub fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let busy_code = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, 5 | 6))
                .unwrap_or(false);
            busy_code || db.message().contains("database is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// SQLite's own busy handler; kept short so the retry policy does the waiting.
    pub busy_timeout: Duration,
    pub retry: BackoffPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(50),
            retry: BackoffPolicy::store_contention(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupStore {
    pool: SqlitePool,
    retry: BackoffPolicy,
}

impl DedupStore {
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        Self::open_with(database_url, StoreOptions::default()).await
    }

    pub async fn open_with(database_url: &str, options: StoreOptions) -> Result<Self, StoreError> {
        let open_err = |source| StoreError::Open {
            url: database_url.to_string(),
            source,
        };
        let connect = SqliteConnectOptions::from_str(database_url)
            .map_err(open_err)?
            .create_if_missing(true)
            .busy_timeout(options.busy_timeout);

        // One connection: a single writer, and in-memory databases live per connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect)
            .await
            .map_err(open_err)?;

        let store = Self {
            pool,
            retry: options.retry,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.write("create result", || {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS result (
                    site TEXT NOT NULL,
                    external_id TEXT NOT NULL,
                    keyword TEXT NOT NULL,
                    region TEXT NOT NULL DEFAULT '',
                    title TEXT NOT NULL DEFAULT '',
                    price INTEGER NOT NULL,
                    url TEXT NOT NULL DEFAULT '',
                    discovered_at INTEGER NOT NULL,
                    matches INTEGER NOT NULL DEFAULT 0,
                    email TEXT,
                    picture_url TEXT,
                    labels TEXT NOT NULL DEFAULT '[]',
                    confidence REAL,
                    PRIMARY KEY (site, external_id)
                )
                "#,
            )
            .execute(pool)
        })
        .await?;

        self.write("index result", || {
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_result_keyword ON result(site, keyword, discovered_at)",
            )
            .execute(pool)
        })
        .await?;

        self.write("create jobHistory", || {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS jobHistory (
                    site TEXT NOT NULL,
                    keyword TEXT NOT NULL,
                    completed_at INTEGER NOT NULL,
                    PRIMARY KEY (site, keyword)
                )
                "#,
            )
            .execute(pool)
        })
        .await?;

        Ok(())
    }

    async fn write<F, Fut>(&self, statement: &'static str, op: F) -> Result<u64, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<SqliteQueryResult, sqlx::Error>>,
    {
        match retry_transient(&self.retry, statement, is_contention, op).await {
            Ok(result) => Ok(result.rows_affected()),
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(statement, attempts, error = %last, "store write abandoned under contention");
                Err(StoreError::Contention {
                    statement,
                    attempts,
                })
            }
            Err(RetryError::Fatal(source)) => {
                error!(statement, error = %source, "store write failed");
                Err(StoreError::Statement { statement, source })
            }
        }
    }

    fn read_err(statement: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
        move |source| {
            error!(statement, error = %source, "store read failed");
            StoreError::Statement { statement, source }
        }
    }

    /// Insert or replace; the latest write for a `(site, external_id)` wins.
    pub async fn upsert_listing(&self, listing: &CandidateListing) -> Result<(), StoreError> {
        let pool = &self.pool;
        let labels = serde_json::to_string(&listing.metadata.labels)
            .unwrap_or_else(|_| "[]".to_string());
        let labels = labels.as_str();
        let site = listing.site.as_str();
        let external_id = listing.external_id.as_str();
        let keyword = listing.keyword.as_str();
        let region = listing.region.as_str();
        let title = listing.title.as_str();
        let url = listing.url.as_str();
        let email = listing.metadata.email.as_deref();
        let picture_url = listing.metadata.picture_url.as_deref();
        let price = listing.price;
        let discovered_at = listing.discovered_at.timestamp();
        let matches = listing.matches;
        let confidence = listing.metadata.confidence;

        self.write("upsert listing", || {
            sqlx::query(
                r#"
                INSERT INTO result (
                    site, external_id, keyword, region, title, price, url,
                    discovered_at, matches, email, picture_url, labels, confidence
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(site, external_id) DO UPDATE SET
                    keyword = excluded.keyword,
                    region = excluded.region,
                    title = excluded.title,
                    price = excluded.price,
                    url = excluded.url,
                    discovered_at = excluded.discovered_at,
                    matches = excluded.matches,
                    email = excluded.email,
                    picture_url = excluded.picture_url,
                    labels = excluded.labels,
                    confidence = excluded.confidence
                "#,
            )
            .bind(site)
            .bind(external_id)
            .bind(keyword)
            .bind(region)
            .bind(title)
            .bind(price)
            .bind(url)
            .bind(discovered_at)
            .bind(matches)
            .bind(email)
            .bind(picture_url)
            .bind(labels)
            .bind(confidence)
            .execute(pool)
        })
        .await?;
        debug!(site, external_id, matches, "listing upserted");
        Ok(())
    }

    pub async fn listing_exists(&self, site: &str, external_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM result WHERE site = ? AND external_id = ? LIMIT 1")
            .bind(site)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::read_err("listing exists"))?;
        Ok(row.is_some())
    }

    pub async fn get_listing(
        &self,
        site: &str,
        external_id: &str,
    ) -> Result<Option<CandidateListing>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT site, external_id, keyword, region, title, price, url, discovered_at,
                   matches, email, picture_url, labels, confidence
              FROM result
             WHERE site = ? AND external_id = ?
            "#,
        )
        .bind(site)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::read_err("get listing"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let decode = Self::read_err("decode listing");
        let listing = (|| -> Result<CandidateListing, sqlx::Error> {
            let labels: String = row.try_get("labels")?;
            Ok(CandidateListing {
                site: row.try_get("site")?,
                external_id: row.try_get("external_id")?,
                keyword: row.try_get("keyword")?,
                region: row.try_get("region")?,
                title: row.try_get("title")?,
                price: row.try_get("price")?,
                url: row.try_get("url")?,
                discovered_at: from_epoch(row.try_get("discovered_at")?),
                matches: row.try_get("matches")?,
                metadata: ListingMetadata {
                    email: row.try_get("email")?,
                    picture_url: row.try_get("picture_url")?,
                    labels: serde_json::from_str(&labels).unwrap_or_default(),
                    confidence: row.try_get("confidence")?,
                },
            })
        })()
        .map_err(decode)?;
        Ok(Some(listing))
    }

    pub async fn record_job_completion(&self, site: &str, keyword: &str) -> Result<(), StoreError> {
        self.record_job_completion_at(site, keyword, Utc::now()).await
    }

    pub async fn record_job_completion_at(
        &self,
        site: &str,
        keyword: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let pool = &self.pool;
        let completed_at = completed_at.timestamp();
        self.write("record job completion", || {
            sqlx::query(
                r#"
                INSERT INTO jobHistory (site, keyword, completed_at) VALUES (?, ?, ?)
                ON CONFLICT(site, keyword) DO UPDATE SET completed_at = excluded.completed_at
                "#,
            )
            .bind(site)
            .bind(keyword)
            .bind(completed_at)
            .execute(pool)
        })
        .await?;
        Ok(())
    }

    pub async fn job_history(
        &self,
        site: &str,
        keyword: &str,
    ) -> Result<Option<JobHistoryRecord>, StoreError> {
        let row = sqlx::query("SELECT completed_at FROM jobHistory WHERE site = ? AND keyword = ?")
            .bind(site)
            .bind(keyword)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::read_err("job history"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let completed_at: i64 = row
            .try_get("completed_at")
            .map_err(Self::read_err("decode job history"))?;
        Ok(Some(JobHistoryRecord {
            site: site.to_string(),
            keyword: keyword.to_string(),
            completed_at: from_epoch(completed_at),
        }))
    }

    /// True iff the last completion is at or after `now - window`.
    pub async fn is_job_recent(
        &self,
        site: &str,
        keyword: &str,
        window: chrono::Duration,
    ) -> Result<bool, StoreError> {
        self.is_job_recent_at(site, keyword, window, Utc::now()).await
    }

    pub async fn is_job_recent_at(
        &self,
        site: &str,
        keyword: &str,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let threshold = (now - window).timestamp();
        Ok(self
            .job_history(site, keyword)
            .await?
            .is_some_and(|record| record.completed_at.timestamp() >= threshold))
    }

    /// Keeps one audit row per reference site, keyword and day.
    pub async fn record_reference_price(
        &self,
        site: &str,
        keyword: &str,
        price: ReferencePrice,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let listing = CandidateListing {
            site: site.to_string(),
            external_id: format!("{keyword}-{}", observed_at.format("%Y-%m-%d")),
            keyword: keyword.to_string(),
            region: String::new(),
            title: keyword.to_string(),
            price: i64::from(price.value()),
            url: String::new(),
            discovered_at: observed_at,
            matches: false,
            metadata: ListingMetadata::default(),
        };
        self.upsert_listing(&listing).await
    }

    pub async fn recent_reference_price(
        &self,
        site: &str,
        keyword: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ReferencePrice>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT price FROM result
             WHERE site = ? AND keyword = ? AND discovered_at >= ?
             ORDER BY discovered_at DESC
             LIMIT 1
            "#,
        )
        .bind(site)
        .bind(keyword)
        .bind(since.timestamp())
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::read_err("recent reference price"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let price: i64 = row
            .try_get("price")
            .map_err(Self::read_err("decode reference price"))?;
        Ok(ReferencePrice::new(price))
    }

    pub async fn prune_listings_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let pool = &self.pool;
        let cutoff = cutoff.timestamp();
        self.write("prune listings", || {
            sqlx::query("DELETE FROM result WHERE discovered_at < ?")
                .bind(cutoff)
                .execute(pool)
        })
        .await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn from_epoch(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn listing(external_id: &str, price: i64, title: &str) -> CandidateListing {
        CandidateListing {
            site: "craigslist.org".into(),
            external_id: external_id.into(),
            keyword: "lamp".into(),
            region: "sfbay".into(),
            title: title.into(),
            price,
            url: format!("https://sfbay.craigslist.org/fuo/{external_id}.html"),
            discovered_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap(),
            matches: false,
            metadata: ListingMetadata::default(),
        }
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_with_latest_values() {
        let store = DedupStore::in_memory().await.unwrap();
        store.upsert_listing(&listing("771", 40, "Lamp")).await.unwrap();

        let mut updated = listing("771", 35, "Vintage lamp");
        updated.matches = true;
        updated.metadata = ListingMetadata {
            email: Some("seller@example.com".into()),
            picture_url: Some("https://images.example.com/771.jpg".into()),
            labels: vec!["Lamp".into(), "Furniture".into()],
            confidence: Some(97.2),
        };
        store.upsert_listing(&updated).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM result")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let stored = store.get_listing("craigslist.org", "771").await.unwrap().unwrap();
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn listing_exists_is_scoped_by_site() {
        let store = DedupStore::in_memory().await.unwrap();
        store.upsert_listing(&listing("771", 40, "Lamp")).await.unwrap();

        assert!(store.listing_exists("craigslist.org", "771").await.unwrap());
        assert!(!store.listing_exists("craigslist.org", "772").await.unwrap());
        assert!(!store.listing_exists("offerup.com", "771").await.unwrap());
    }

    #[tokio::test]
    async fn job_recency_follows_window() {
        let store = DedupStore::in_memory().await.unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let two_hours_ago = now - chrono::Duration::hours(2);

        assert!(!store
            .is_job_recent_at("craigslist.org", "lamp", chrono::Duration::hours(3), now)
            .await
            .unwrap());

        store
            .record_job_completion_at("craigslist.org", "lamp", two_hours_ago)
            .await
            .unwrap();

        assert!(store
            .is_job_recent_at("craigslist.org", "lamp", chrono::Duration::hours(3), now)
            .await
            .unwrap());
        assert!(store
            .is_job_recent_at("craigslist.org", "lamp", chrono::Duration::hours(2), now)
            .await
            .unwrap());
        assert!(!store
            .is_job_recent_at("craigslist.org", "lamp", chrono::Duration::seconds(3600), now)
            .await
            .unwrap());
        assert!(!store
            .is_job_recent_at("craigslist.org", "chair", chrono::Duration::hours(3), now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn job_completion_is_one_row_per_site_and_keyword() {
        let store = DedupStore::in_memory().await.unwrap();
        let first = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let second = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap();
        store.record_job_completion_at("craigslist.org", "lamp", first).await.unwrap();
        store.record_job_completion_at("craigslist.org", "lamp", second).await.unwrap();

        let record = store.job_history("craigslist.org", "lamp").await.unwrap().unwrap();
        assert_eq!(record.completed_at, second);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobHistory")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn reference_price_is_reused_inside_window() {
        let store = DedupStore::in_memory().await.unwrap();
        let observed = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        store
            .record_reference_price("checkaflip.com", "lamp", ReferencePrice::new(90).unwrap(), observed)
            .await
            .unwrap();

        let hit = store
            .recent_reference_price("checkaflip.com", "lamp", observed - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(hit, ReferencePrice::new(90));

        let miss = store
            .recent_reference_price("checkaflip.com", "lamp", observed + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(miss, None);
        assert!(store.listing_exists("checkaflip.com", "lamp-2026-03-01").await.unwrap());
    }

    #[tokio::test]
    async fn prune_removes_only_old_rows() {
        let store = DedupStore::in_memory().await.unwrap();
        let mut old = listing("1", 10, "Old");
        old.discovered_at = Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).single().unwrap();
        store.upsert_listing(&old).await.unwrap();
        store.upsert_listing(&listing("2", 10, "New")).await.unwrap();

        let cutoff = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        assert_eq!(store.prune_listings_older_than(cutoff).await.unwrap(), 1);
        assert!(!store.listing_exists("craigslist.org", "1").await.unwrap());
        assert!(store.listing_exists("craigslist.org", "2").await.unwrap());
    }

    #[tokio::test]
    async fn locked_database_is_retried_then_reported_as_contention() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("state.sqlite").display());
        let store = DedupStore::open_with(
            &url,
            StoreOptions {
                busy_timeout: Duration::ZERO,
                retry: BackoffPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
            },
        )
        .await
        .unwrap();

        let other = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::from_str(&url)
                    .unwrap()
                    .busy_timeout(Duration::ZERO),
            )
            .await
            .unwrap();
        let mut holder = other.acquire().await.unwrap();
        sqlx::query("BEGIN EXCLUSIVE").execute(&mut *holder).await.unwrap();

        let err = store.upsert_listing(&listing("771", 40, "Lamp")).await.unwrap_err();
        assert!(matches!(err, StoreError::Contention { attempts: 3, .. }), "{err}");

        sqlx::query("COMMIT").execute(&mut *holder).await.unwrap();
        store.upsert_listing(&listing("771", 40, "Lamp")).await.unwrap();
        assert!(store.listing_exists("craigslist.org", "771").await.unwrap());
    }
}
