//! Queue recovery
//!
//! Periodic maintenance of the durable queue: IN_FLIGHT rows whose lease
//! expired go back to PENDING (or to FAILED once the retry budget is gone),
//! terminal rows past the retention window are purged, and a health snapshot
//! is logged. Idempotent, and also run once at session start to absorb
//! orphans from a prior process crash.

use std::time::Duration;

use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::QueueError;

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Expired leases returned to PENDING
    pub reclaimed: u64,
    /// Expired leases moved to FAILED (retry budget exhausted)
    pub exhausted: u64,
    /// Terminal rows deleted by retention cleanup
    pub purged: u64,
    /// (status, count) pairs after the pass
    pub status_counts: Vec<(String, u64)>,
    /// Age of the oldest PENDING row, if any
    pub oldest_pending: Option<Duration>,
    /// Age of the oldest IN_FLIGHT row, if any
    pub oldest_in_flight: Option<Duration>,
}

/// Recovery task for one session's durable queue.
pub struct QueueRecovery {
    pool: PgPool,
    session_id: Uuid,
    max_retries: u32,
    retention: Duration,
}

impl QueueRecovery {
    pub fn new(pool: PgPool, session_id: Uuid, max_retries: u32, retention: Duration) -> Self {
        Self {
            pool,
            session_id,
            max_retries,
            retention,
        }
    }

    /// One full pass: reclaim, purge, snapshot.
    pub async fn run_once(&self) -> Result<RecoveryReport, QueueError> {
        let mut report = RecoveryReport::default();

        // Expired leases past the retry budget fail outright. Run before the
        // reclaim so a row is judged against its post-increment attempts.
        let exhausted = sqlx::query(
            "UPDATE url_queue SET status = 'FAILED', attempts = attempts + 1, \
             last_error = 'lease expired', leased_until = NULL \
             WHERE session_id = $1 AND status = 'IN_FLIGHT' \
               AND leased_until IS NOT NULL AND leased_until < now() \
               AND attempts + 1 > $2",
        )
        .bind(self.session_id)
        .bind(self.max_retries as i32)
        .execute(&self.pool)
        .await?;
        report.exhausted = exhausted.rows_affected();

        let reclaimed = sqlx::query(
            "UPDATE url_queue SET status = 'PENDING', attempts = attempts + 1, \
             leased_until = NULL \
             WHERE session_id = $1 AND status = 'IN_FLIGHT' \
               AND leased_until IS NOT NULL AND leased_until < now()",
        )
        .bind(self.session_id)
        .execute(&self.pool)
        .await?;
        report.reclaimed = reclaimed.rows_affected();

        let purged = sqlx::query(
            "DELETE FROM url_queue \
             WHERE session_id = $1 AND status IN ('DONE','FAILED','SKIPPED') \
               AND discovered_at < now() - make_interval(secs => $2)",
        )
        .bind(self.session_id)
        .bind(self.retention.as_secs_f64())
        .execute(&self.pool)
        .await?;
        report.purged = purged.rows_affected();

        let rows = sqlx::query(
            "SELECT status, count(*) AS n, \
                    extract(epoch FROM now() - min(discovered_at))::float8 AS oldest_secs \
             FROM url_queue WHERE session_id = $1 GROUP BY status",
        )
        .bind(self.session_id)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let status: String = row.get("status");
            let n = row.get::<i64, _>("n") as u64;
            let oldest = row
                .get::<Option<f64>, _>("oldest_secs")
                .filter(|s| *s > 0.0)
                .map(Duration::from_secs_f64);
            match status.as_str() {
                "PENDING" => report.oldest_pending = oldest,
                "IN_FLIGHT" => report.oldest_in_flight = oldest,
                _ => {}
            }
            report.status_counts.push((status, n));
        }
        report.status_counts.sort();

        if report.reclaimed > 0 || report.exhausted > 0 {
            warn!(
                session = %self.session_id,
                reclaimed = report.reclaimed,
                exhausted = report.exhausted,
                "recovered expired leases"
            );
        }
        info!(
            session = %self.session_id,
            purged = report.purged,
            status_counts = ?report.status_counts,
            oldest_pending_secs = report.oldest_pending.map(|d| d.as_secs()),
            oldest_in_flight_secs = report.oldest_in_flight.map(|d| d.as_secs()),
            "queue health"
        );

        Ok(report)
    }

    /// Run passes every `interval` until cancelled.
    pub async fn run_periodic(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick duplicates the startup pass; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        warn!(session = %self.session_id, error = %err, "recovery pass failed");
                    }
                }
            }
        }
    }
}

// Behavior against a live queue is covered by the ignored tests in
// tests/durable_queue.rs.
