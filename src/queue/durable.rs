//! Durable queue backend
//!
//! Rows in the `url_queue` table, keyed by (session_id, url). Enqueue is an
//! idempotent upsert; lease is a single `FOR UPDATE SKIP LOCKED` statement
//! so concurrent leasers — in this process or another — can never take the
//! same row twice. An IN_FLIGHT row carries a `leased_until` deadline; if
//! the owner dies, recovery returns it to PENDING once the lease expires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use super::{
    Completion, Enqueued, EnqueueRequest, QueueCounts, QueuedUrl, UrlQueue, STATUS_DONE,
    STATUS_FAILED, STATUS_IN_FLIGHT, STATUS_PENDING, STATUS_SKIPPED,
};
use crate::error::QueueError;

/// How often a blocked lease re-polls the table.
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// PostgreSQL-backed queue for one session.
pub struct DurableQueue {
    pool: PgPool,
    session_id: Uuid,
    lease_duration: Duration,
    max_depth: u32,
    /// Hard cap on total rows for the session, a sanity bound well above the
    /// page budget
    max_rows: u64,
    closed: AtomicBool,
}

impl DurableQueue {
    pub fn new(
        pool: PgPool,
        session_id: Uuid,
        lease_duration: Duration,
        max_depth: u32,
        max_pages: u64,
    ) -> Self {
        Self {
            pool,
            session_id,
            lease_duration,
            max_depth,
            max_rows: max_pages.saturating_mul(10).max(1000),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// One skip-locked lease attempt. The subquery picks the best candidate
    /// per the ordering contract; locked rows are skipped so concurrent
    /// leasers fan out across distinct rows.
    async fn try_lease(&self) -> Result<Option<QueuedUrl>, QueueError> {
        let lease_secs = self.lease_duration.as_secs_f64();
        let row = sqlx::query(
            r#"
            UPDATE url_queue SET
                status = 'IN_FLIGHT',
                leased_until = now() + make_interval(secs => $2)
            WHERE (session_id, url) IN (
                SELECT session_id, url FROM url_queue
                WHERE session_id = $1
                  AND status = 'PENDING'
                  AND (not_before IS NULL OR not_before <= now())
                ORDER BY priority DESC, depth ASC, discovered_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING url, parent_url, depth, priority, attempts, discovered_at
            "#,
        )
        .bind(self.session_id)
        .bind(lease_secs)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| QueuedUrl {
            url: row.get::<String, _>("url"),
            parent_url: row.get::<Option<String>, _>("parent_url"),
            depth: row.get::<i32, _>("depth") as u32,
            priority: row.get::<i32, _>("priority"),
            attempts: row.get::<i32, _>("attempts") as u32,
            discovered_at: row.get::<DateTime<Utc>, _>("discovered_at"),
        }))
    }

    async fn row_count(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM url_queue WHERE session_id = $1")
            .bind(self.session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl UrlQueue for DurableQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Enqueued, QueueError> {
        if self.closed.load(Ordering::Relaxed) {
            return Ok(Enqueued::LimitReached);
        }
        if request.depth > self.max_depth {
            return Ok(Enqueued::DepthExceeded);
        }
        if self.row_count().await? >= self.max_rows {
            return Ok(Enqueued::LimitReached);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO url_queue
                (session_id, url, parent_url, depth, priority, status, attempts, discovered_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, now())
            ON CONFLICT (session_id, url) DO NOTHING
            "#,
        )
        .bind(self.session_id)
        .bind(&request.url)
        .bind(&request.parent_url)
        .bind(request.depth as i32)
        .bind(request.priority)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(Enqueued::Duplicate)
        } else {
            Ok(Enqueued::Accepted)
        }
    }

    async fn lease(&self, timeout: Duration) -> Result<Option<QueuedUrl>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leased) = self.try_lease().await? {
                return Ok(Some(leased));
            }
            if self.closed.load(Ordering::Relaxed) {
                return Ok(None);
            }
            if tokio::time::Instant::now() + LEASE_POLL_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(LEASE_POLL_INTERVAL).await;
        }
    }

    async fn complete(&self, url: &str, completion: Completion) -> Result<(), QueueError> {
        // Every transition is guarded by status = 'IN_FLIGHT', making
        // completion idempotent: if record_page already marked the row DONE
        // inside its transaction, this affects zero rows.
        match completion {
            Completion::Done => {
                sqlx::query(
                    "UPDATE url_queue SET status = $3, leased_until = NULL \
                     WHERE session_id = $1 AND url = $2 AND status = 'IN_FLIGHT'",
                )
                .bind(self.session_id)
                .bind(url)
                .bind(STATUS_DONE)
                .execute(&self.pool)
                .await?;
            }
            Completion::Failed { error } => {
                sqlx::query(
                    "UPDATE url_queue SET status = $3, last_error = $4, leased_until = NULL \
                     WHERE session_id = $1 AND url = $2 AND status = 'IN_FLIGHT'",
                )
                .bind(self.session_id)
                .bind(url)
                .bind(STATUS_FAILED)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
            Completion::Skipped { reason } => {
                sqlx::query(
                    "UPDATE url_queue SET status = $3, last_error = $4, leased_until = NULL \
                     WHERE session_id = $1 AND url = $2 AND status = 'IN_FLIGHT'",
                )
                .bind(self.session_id)
                .bind(url)
                .bind(STATUS_SKIPPED)
                .bind(reason)
                .execute(&self.pool)
                .await?;
            }
            Completion::Retry { error, backoff } => {
                sqlx::query(
                    "UPDATE url_queue SET status = 'PENDING', attempts = attempts + 1, \
                     last_error = $3, leased_until = NULL, \
                     not_before = now() + make_interval(secs => $4) \
                     WHERE session_id = $1 AND url = $2 AND status = 'IN_FLIGHT'",
                )
                .bind(self.session_id)
                .bind(url)
                .bind(error)
                .bind(backoff.as_secs_f64())
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn release(&self, url: &str) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE url_queue SET status = 'PENDING', attempts = attempts + 1, \
             leased_until = NULL \
             WHERE session_id = $1 AND url = $2 AND status = 'IN_FLIGHT'",
        )
        .bind(self.session_id)
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query(
            "SELECT status, count(*) AS n FROM url_queue WHERE session_id = $1 GROUP BY status",
        )
        .bind(self.session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n = row.get::<i64, _>("n") as u64;
            match status.as_str() {
                STATUS_PENDING => counts.pending += n,
                STATUS_IN_FLIGHT => counts.in_flight += n,
                _ => counts.terminal += n,
            }
        }
        Ok(counts)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

// Exercising this backend needs a live PostgreSQL; see tests/durable_queue.rs
// (ignored unless DATABASE_URL is set).
