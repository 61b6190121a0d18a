use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::{info, warn};

use crawld_core::{QueueStats, UpsertAttrs, UrlRecord, UrlStatus};

/// Durable persistence of URL records: one SQLite file per site.
#[derive(Clone)]
pub struct QueueStore {
    pool: SqlitePool,
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<UrlRecord> {
    let status_str: String = row.try_get("status")?;
    Ok(UrlRecord {
        url: row.try_get("url")?,
        host: row.try_get("host")?,
        status: UrlStatus::parse(&status_str)
            .ok_or_else(|| anyhow::anyhow!("unknown status {status_str}"))?,
        priority: row.try_get("priority")?,
        depth: row.try_get::<i64, _>("depth")? as u32,
        first_seen: row.try_get("first_seen")?,
        last_crawl: row.try_get("last_crawl")?,
        next_crawl: row.try_get("next_crawl")?,
        retry_after: row.try_get("retry_after")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        content_hash: row.try_get("content_hash")?,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        http_status: row
            .try_get::<Option<i64>, _>("http_status")?
            .map(|v| v as u16),
        failure_reason: row.try_get("failure_reason")?,
        canonical_of: row.try_get("canonical_of")?,
        owner: row.try_get("owner")?,
        claimed_at: row.try_get("claimed_at")?,
    })
}

impl QueueStore {
    /// Opens (creating if absent) the durable queue file for one site.
    pub async fn open(db_path: &str) -> Result<Self> {
        Self::with_pool_size(db_path, 16).await
    }

    pub async fn with_pool_size(db_path: &str, max_connections: u32) -> Result<Self> {
        let url = format!("sqlite://{db_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;
        info!(db_path, max_connections, "opened queue store");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
            .execute(&self.pool)
            .await?;
        info!("queue store migrations complete");
        Ok(())
    }

    /// Inserts a new pending record or merges attrs into an existing one.
    /// Never lowers priority; never regresses status from visited to pending.
    pub async fn upsert(&self, url: &str, host: &str, attrs: UpsertAttrs) -> Result<()> {
        let now = Utc::now();
        let priority = attrs.priority.unwrap_or(0);
        let depth = attrs.depth.unwrap_or(0) as i64;
        let canonical_of = attrs.canonical_of.clone();

        sqlx::query(
            r#"INSERT INTO crawl_queue (url, host, status, priority, depth, first_seen, canonical_of)
               VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)
               ON CONFLICT(url) DO UPDATE SET
                   priority = MAX(crawl_queue.priority, excluded.priority),
                   depth = MIN(crawl_queue.depth, excluded.depth),
                   canonical_of = COALESCE(excluded.canonical_of, crawl_queue.canonical_of)"#,
        )
        .bind(url)
        .bind(host)
        .bind(priority)
        .bind(depth)
        .bind(now)
        .bind(canonical_of)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically selects and claims one ready record, ranked by
    /// `priority DESC, next_crawl ASC, first_seen ASC`.
    pub async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<UrlRecord>> {
        let row = sqlx::query(
            r#"UPDATE crawl_queue
               SET status = 'in_flight', owner = ?1, claimed_at = ?2
               WHERE url = (
                   SELECT url FROM crawl_queue
                   WHERE (
                       (status = 'pending' AND (retry_after IS NULL OR retry_after <= ?2))
                       OR (status = 'visited' AND next_crawl <= ?2)
                   )
                   AND (next_crawl IS NULL OR next_crawl <= ?2)
                   ORDER BY priority DESC, next_crawl ASC, first_seen ASC
                   LIMIT 1
               )
               RETURNING *"#,
        )
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_record(&r)?)),
            None => Ok(None),
        }
    }

    /// Like `claim_next`, but skips candidates whose host is in
    /// `excluded_hosts` — used by the scheduler to avoid handing out a
    /// record for a host another worker is already serving, without
    /// blocking on that host's politeness wait.
    pub async fn claim_next_excluding(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        excluded_hosts: &[String],
    ) -> Result<Option<UrlRecord>> {
        if excluded_hosts.is_empty() {
            return self.claim_next(worker_id, now).await;
        }

        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            r#"UPDATE crawl_queue SET status = 'in_flight', owner = "#,
        );
        builder.push_bind(worker_id);
        builder.push(", claimed_at = ");
        builder.push_bind(now);
        builder.push(
            r#" WHERE url = (
                   SELECT url FROM crawl_queue
                   WHERE (
                       (status = 'pending' AND (retry_after IS NULL OR retry_after <= "#,
        );
        builder.push_bind(now);
        builder.push(r#"))
                       OR (status = 'visited' AND next_crawl <= "#);
        builder.push_bind(now);
        builder.push(
            r#")
                   )
                   AND (next_crawl IS NULL OR next_crawl <= "#,
        );
        builder.push_bind(now);
        builder.push(
            r#")
                   AND host NOT IN ("#,
        );
        {
            let mut separated = builder.separated(", ");
            for host in excluded_hosts {
                separated.push_bind(host);
            }
        }
        builder.push(
            r#")
                   ORDER BY priority DESC, next_crawl ASC, first_seen ASC
                   LIMIT 1
               )
               RETURNING *"#,
        );

        let row = builder.build().fetch_optional(&self.pool).await?;
        match row {
            Some(r) => Ok(Some(row_to_record(&r)?)),
            None => Ok(None),
        }
    }

    /// Marks a record visited after a successful fetch, clearing retry state.
    /// `canonical_of` is only written when `Some` — a rediscovered same-host
    /// canonical link is annotated, but a record with no canonical opinion
    /// this visit keeps whatever was recorded on a previous one.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete_success(
        &self,
        url: &str,
        content_hash: Option<&str>,
        http_status: u16,
        etag: Option<&str>,
        last_modified: Option<&str>,
        canonical_of: Option<&str>,
        next_crawl: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"UPDATE crawl_queue SET
                   status = 'visited',
                   content_hash = COALESCE(?1, content_hash),
                   http_status = ?2,
                   etag = ?3,
                   last_modified = ?4,
                   last_crawl = ?5,
                   next_crawl = ?6,
                   canonical_of = COALESCE(?7, canonical_of),
                   retry_after = NULL,
                   retry_count = 0,
                   failure_reason = NULL,
                   owner = NULL,
                   claimed_at = NULL
               WHERE url = ?8"#,
        )
        .bind(content_hash)
        .bind(http_status as i64)
        .bind(etag)
        .bind(last_modified)
        .bind(now)
        .bind(next_crawl)
        .bind(canonical_of)
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Increments retry_count; transitions to failed once max_retries is reached,
    /// otherwise returns the record to pending with the given retry_after.
    pub async fn complete_transient_failure(
        &self,
        url: &str,
        reason: &str,
        retry_after: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<()> {
        let now = Utc::now();
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT retry_count FROM crawl_queue WHERE url = ?1")
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        let current = row.map(|(c,)| c).unwrap_or(0);
        let next_count = current + 1;

        if next_count as u32 >= max_retries {
            sqlx::query(
                r#"UPDATE crawl_queue SET
                       status = 'failed', retry_count = ?1, failure_reason = ?2,
                       last_crawl = ?3, owner = NULL, claimed_at = NULL
                   WHERE url = ?4"#,
            )
            .bind(next_count)
            .bind(reason)
            .bind(now)
            .bind(url)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"UPDATE crawl_queue SET
                       status = 'pending', retry_count = ?1, retry_after = ?2, failure_reason = ?3,
                       last_crawl = ?4, owner = NULL, claimed_at = NULL
                   WHERE url = ?5"#,
            )
            .bind(next_count)
            .bind(retry_after)
            .bind(reason)
            .bind(now)
            .bind(url)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Transitions a record to `failed` or `excluded` for a non-retryable reason.
    pub async fn complete_permanent_failure(
        &self,
        url: &str,
        reason: &str,
        excluded: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let status = if excluded { "excluded" } else { "failed" };
        sqlx::query(
            r#"UPDATE crawl_queue SET
                   status = ?1, failure_reason = ?2, last_crawl = ?3, owner = NULL, claimed_at = NULL
               WHERE url = ?4"#,
        )
        .bind(status)
        .bind(reason)
        .bind(now)
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns an in-flight record to pending untouched — no retry increment,
    /// no failure reason. Used when a claimed unit of work is cancelled by
    /// shutdown before it reaches a success or failure outcome.
    pub async fn release_to_pending(&self, url: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE crawl_queue SET status = 'pending', owner = NULL, claimed_at = NULL
               WHERE url = ?1 AND status = 'in_flight'"#,
        )
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sets the next due time for an already-visited record.
    pub async fn schedule_revisit(&self, url: &str, next_crawl: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE crawl_queue SET next_crawl = ?1 WHERE url = ?2 AND status = 'visited'")
            .bind(next_crawl)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut by_status = HashMap::new();
        let status_rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM crawl_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        for (status, count) in status_rows {
            by_status.insert(status, count);
        }

        let mut by_priority = HashMap::new();
        let priority_rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT priority, COUNT(*) FROM crawl_queue GROUP BY priority")
                .fetch_all(&self.pool)
                .await?;
        for (priority, count) in priority_rows {
            by_priority.insert(priority, count);
        }

        Ok(QueueStats {
            by_status,
            by_priority,
        })
    }

    /// Returns `in_flight` records whose `claimed_at` is older than `threshold`
    /// back to `pending`. Run once at startup before any worker claims work.
    pub async fn reclaim_stale(&self, threshold: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE crawl_queue
               SET status = 'pending', owner = NULL, claimed_at = NULL
               WHERE status = 'in_flight' AND claimed_at < ?1"#,
        )
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        let affected = result.rows_affected();
        if affected > 0 {
            warn!(affected, "reclaimed stale in_flight records");
        }
        Ok(affected)
    }

    pub async fn get(&self, url: &str) -> Result<Option<UrlRecord>> {
        let row = sqlx::query("SELECT * FROM crawl_queue WHERE url = ?1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(row_to_record(&r)?)),
            None => Ok(None),
        }
    }

    pub async fn check_connectivity(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> QueueStore {
        let store = QueueStore::with_pool_size(":memory:", 1).await.unwrap();
        store.run_migrations().await.unwrap();
        store
    }

    #[tokio::test]
    async fn upsert_then_claim() {
        let store = memory_store().await;
        store
            .upsert(
                "https://example.test/",
                "example.test",
                UpsertAttrs {
                    priority: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let now = Utc::now();
        let claimed = store.claim_next("worker-1", now).await.unwrap().unwrap();
        assert_eq!(claimed.url, "https://example.test/");
        assert_eq!(claimed.status, UrlStatus::InFlight);
        assert_eq!(claimed.owner.as_deref(), Some("worker-1"));

        // record is now in_flight, a second claim must not see it (I8)
        assert!(store.claim_next("worker-2", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_never_lowers_priority() {
        let store = memory_store().await;
        store
            .upsert(
                "https://example.test/",
                "example.test",
                UpsertAttrs {
                    priority: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .upsert(
                "https://example.test/",
                "example.test",
                UpsertAttrs {
                    priority: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let rec = store.get("https://example.test/").await.unwrap().unwrap();
        assert_eq!(rec.priority, 5);
    }

    #[tokio::test]
    async fn transient_failure_exhausts_retries_to_failed() {
        let store = memory_store().await;
        store
            .upsert("https://example.test/", "example.test", UpsertAttrs::default())
            .await
            .unwrap();
        let now = Utc::now();
        store.claim_next("worker-1", now).await.unwrap();

        for _ in 0..2 {
            store
                .complete_transient_failure("https://example.test/", "timeout", now, 3)
                .await
                .unwrap();
        }
        let rec = store.get("https://example.test/").await.unwrap().unwrap();
        assert_eq!(rec.status, UrlStatus::Pending);
        assert_eq!(rec.retry_count, 2);

        store
            .complete_transient_failure("https://example.test/", "timeout", now, 3)
            .await
            .unwrap();
        let rec = store.get("https://example.test/").await.unwrap().unwrap();
        assert_eq!(rec.status, UrlStatus::Failed);
        assert_eq!(rec.retry_count, 3);
    }

    #[tokio::test]
    async fn claim_next_excluding_skips_blocked_hosts() {
        let store = memory_store().await;
        store
            .upsert("https://a.test/", "a.test", UpsertAttrs::default())
            .await
            .unwrap();
        store
            .upsert("https://b.test/", "b.test", UpsertAttrs::default())
            .await
            .unwrap();
        let now = Utc::now();
        let excluded = vec!["a.test".to_string()];
        let claimed = store
            .claim_next_excluding("worker-1", now, &excluded)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.host, "b.test");
    }

    #[tokio::test]
    async fn release_to_pending_does_not_increment_retries() {
        let store = memory_store().await;
        store
            .upsert("https://example.test/", "example.test", UpsertAttrs::default())
            .await
            .unwrap();
        store.claim_next("worker-1", Utc::now()).await.unwrap();
        store
            .release_to_pending("https://example.test/")
            .await
            .unwrap();
        let rec = store.get("https://example.test/").await.unwrap().unwrap();
        assert_eq!(rec.status, UrlStatus::Pending);
        assert_eq!(rec.retry_count, 0);
        assert!(rec.owner.is_none());
    }

    #[tokio::test]
    async fn reclaim_stale_returns_to_pending() {
        let store = memory_store().await;
        store
            .upsert("https://example.test/", "example.test", UpsertAttrs::default())
            .await
            .unwrap();
        let claimed_at = Utc::now() - chrono::Duration::hours(2);
        store.claim_next("worker-1", claimed_at).await.unwrap();

        let threshold = Utc::now() - chrono::Duration::minutes(30);
        let n = store.reclaim_stale(threshold).await.unwrap();
        assert_eq!(n, 1);
        let rec = store.get("https://example.test/").await.unwrap().unwrap();
        assert_eq!(rec.status, UrlStatus::Pending);
        assert!(rec.owner.is_none());
    }
}
