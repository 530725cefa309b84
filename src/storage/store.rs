//! Store implementation

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{QueryBuilder, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use super::schema::SCHEMA;
use crate::config::{Config, DatabaseConfig};
use crate::error::StoreError;
use crate::types::{DiscoveredLink, MetricSnapshot, SessionState, StageTimings};

/// Transient-failure retry budget for store operations. Past this the
/// session treats persistence as lost and fails.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Word-frequency rows inserted per statement.
const WORD_CHUNK: usize = 1000;

/// A page ready for persistence, flattened from a worker result.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub url: String,
    pub final_url: String,
    pub depth: u32,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub title: Option<String>,
    pub text_length: u64,
    pub total_words: u64,
    pub unique_words: u64,
    pub body_bytes: u64,
    pub timings: StageTimings,
}

/// A row from `crawl_sessions`, for listings.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub name: String,
    pub state: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub pages_crawled: i64,
    pub pages_failed: i64,
    pub pages_skipped: i64,
    pub total_words: i64,
    pub total_bytes: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
}

/// Counter totals written into the terminal session row.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionTotals {
    pub pages_crawled: u64,
    pub pages_failed: u64,
    pub pages_skipped: u64,
    pub total_words: u64,
    pub total_bytes: u64,
    pub error_count: u64,
}

/// PostgreSQL store shared by the session, queue, and recovery.
pub struct CrawlStore {
    pool: PgPool,
}

impl CrawlStore {
    /// Connect a pool using the configured credentials.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .connect(&config.url())
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create all tables and indexes. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("schema bootstrap complete");
        Ok(())
    }

    /// Insert the session row at crawl start.
    pub async fn create_session(
        &self,
        id: Uuid,
        name: &str,
        seeds: &[String],
        config: &Config,
    ) -> Result<(), StoreError> {
        let mut configuration = serde_json::to_value(config)?;
        if let Some(db) = configuration.get_mut("database").and_then(|v| v.as_object_mut()) {
            db.insert("password".to_string(), serde_json::Value::String("***".to_string()));
        }
        self.with_retries(|| async {
            sqlx::query(
                "INSERT INTO crawl_sessions (id, name, seed_urls, configuration, state) \
                 VALUES ($1, $2, $3, $4, 'running') \
                 ON CONFLICT (id) DO UPDATE SET state = 'running', completed_at = NULL",
            )
            .bind(id)
            .bind(name)
            .bind(seeds)
            .bind(&configuration)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Persist one page with its word frequencies and outbound links in a
    /// single transaction. With `mark_queue_done`, the matching `url_queue`
    /// row moves to DONE inside the same transaction.
    pub async fn record_page(
        &self,
        session_id: Uuid,
        page: &PageRecord,
        words: &HashMap<String, u64>,
        links: &[DiscoveredLink],
        mark_queue_done: bool,
    ) -> Result<(), StoreError> {
        self.with_retries(|| async {
            let started = std::time::Instant::now();
            let mut tx = self.pool.begin().await?;

            // Word and link rows go in first so the page row, written last,
            // can carry a measured persist time

            // Re-crawl of the same URL replaces its word rows
            sqlx::query("DELETE FROM word_frequencies WHERE session_id = $1 AND url = $2")
                .bind(session_id)
                .bind(&page.url)
                .execute(&mut *tx)
                .await?;

            let word_rows: Vec<(&String, &u64)> = words.iter().collect();
            for chunk in word_rows.chunks(WORD_CHUNK) {
                let mut builder = QueryBuilder::new(
                    "INSERT INTO word_frequencies (session_id, url, word, frequency) ",
                );
                builder.push_values(chunk.iter().copied(), |mut b, (word, count)| {
                    b.push_bind(session_id)
                        .push_bind(&page.url)
                        .push_bind(word.as_str())
                        .push_bind(*count as i64);
                });
                builder.build().execute(&mut *tx).await?;
            }

            if !links.is_empty() {
                let mut builder =
                    QueryBuilder::new("INSERT INTO links (session_id, source_url, dest_url, kind) ");
                builder.push_values(links, |mut b, link| {
                    b.push_bind(session_id)
                        .push_bind(&page.url)
                        .push_bind(&link.url)
                        .push_bind(link.kind.as_str());
                });
                builder.push(" ON CONFLICT DO NOTHING");
                builder.build().execute(&mut *tx).await?;
            }

            let persist_ms = started.elapsed().as_secs_f64() * 1000.0;
            sqlx::query(
                r#"
                INSERT INTO pages
                    (session_id, url, final_url, depth, status_code, content_type, title,
                     text_length, total_words, unique_words, body_bytes,
                     fetch_ms, extract_ms, analyze_ms, persist_ms, total_ms)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT (session_id, url) DO UPDATE SET
                    final_url = EXCLUDED.final_url,
                    status_code = EXCLUDED.status_code,
                    content_type = EXCLUDED.content_type,
                    title = EXCLUDED.title,
                    text_length = EXCLUDED.text_length,
                    total_words = EXCLUDED.total_words,
                    unique_words = EXCLUDED.unique_words,
                    body_bytes = EXCLUDED.body_bytes,
                    persist_ms = EXCLUDED.persist_ms,
                    crawled_at = now()
                "#,
            )
            .bind(session_id)
            .bind(&page.url)
            .bind(&page.final_url)
            .bind(page.depth as i32)
            .bind(page.status_code.map(|s| s as i32))
            .bind(&page.content_type)
            .bind(&page.title)
            .bind(page.text_length as i64)
            .bind(page.total_words as i64)
            .bind(page.unique_words as i64)
            .bind(page.body_bytes as i64)
            .bind(page.timings.fetch_ms())
            .bind(page.timings.extract_ms())
            .bind(page.timings.analyze_ms())
            .bind(persist_ms)
            .bind(page.timings.total_ms())
            .execute(&mut *tx)
            .await?;

            if mark_queue_done {
                sqlx::query(
                    "UPDATE url_queue SET status = 'DONE', leased_until = NULL \
                     WHERE session_id = $1 AND url = $2 AND status = 'IN_FLIGHT'",
                )
                .bind(session_id)
                .bind(&page.url)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Append one error event.
    pub async fn record_error_event(
        &self,
        session_id: Uuid,
        url: &str,
        depth: u32,
        kind: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        self.with_retries(|| async {
            sqlx::query(
                "INSERT INTO error_events (session_id, url, depth, error_kind, message) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(session_id)
            .bind(url)
            .bind(depth as i32)
            .bind(kind)
            .bind(message)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Append one metric snapshot.
    pub async fn record_metric(
        &self,
        session_id: Uuid,
        snapshot: &MetricSnapshot,
    ) -> Result<(), StoreError> {
        self.with_retries(|| async {
            sqlx::query(
                "INSERT INTO session_metrics_timeseries \
                 (session_id, recorded_at, pages_crawled, bytes_processed, errors, \
                  pages_per_sec, bytes_per_sec, in_flight, queue_pending) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(session_id)
            .bind(snapshot.recorded_at)
            .bind(snapshot.pages_crawled as i64)
            .bind(snapshot.bytes_processed as i64)
            .bind(snapshot.errors as i64)
            .bind(snapshot.pages_per_sec)
            .bind(snapshot.bytes_per_sec)
            .bind(snapshot.in_flight as i64)
            .bind(snapshot.queue_pending as i64)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Stamp the terminal state and final counters. Called exactly once per
    /// session on the way out.
    pub async fn close_session(
        &self,
        session_id: Uuid,
        state: SessionState,
        totals: SessionTotals,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_retries(|| async {
            sqlx::query(
                "UPDATE crawl_sessions SET \
                 state = $2, completed_at = now(), pages_crawled = $3, pages_failed = $4, \
                 pages_skipped = $5, total_words = $6, total_bytes = $7, error_count = $8, \
                 last_error = $9 \
                 WHERE id = $1",
            )
            .bind(session_id)
            .bind(state.as_str())
            .bind(totals.pages_crawled as i64)
            .bind(totals.pages_failed as i64)
            .bind(totals.pages_skipped as i64)
            .bind(totals.total_words as i64)
            .bind(totals.total_bytes as i64)
            .bind(totals.error_count as i64)
            .bind(last_error)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Recent sessions, newest first.
    pub async fn list_sessions(&self, limit: i64) -> Result<Vec<SessionRow>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT id, name, state, started_at, completed_at, pages_crawled, pages_failed, \
             pages_skipped, total_words, total_bytes, error_count, last_error \
             FROM crawl_sessions ORDER BY started_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Number of pages persisted for a session.
    pub async fn page_count(&self, session_id: Uuid) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT count(*) AS n FROM pages WHERE session_id = $1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Run `op`, retrying transient connection-level failures. Anything
    /// surviving the budget becomes [`StoreError::Exhausted`], which the
    /// session treats as fatal.
    async fn with_retries<F, Fut>(&self, op: F) -> Result<(), StoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(StoreError::Database(err)) if attempt < RETRY_ATTEMPTS && is_transient(&err) => {
                    attempt += 1;
                    warn!(attempt, error = %err, "transient database error, retrying");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(StoreError::Database(err)) if is_transient(&err) => {
                    return Err(StoreError::Exhausted {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Connection-level failures worth retrying; constraint violations and
/// syntax errors are not.
fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }
}
