//! Session counters
//!
//! Atomic counters updated from the session loop and sampled by the metrics
//! task. Snapshots are not linearizable with persistence; readers may see
//! counters a beat behind the tables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;

use crate::types::MetricSnapshot;

/// Monotonic counters for one crawl session.
#[derive(Debug)]
pub struct SessionCounters {
    pages_crawled: AtomicU64,
    pages_failed: AtomicU64,
    pages_skipped: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    bytes: AtomicU64,
    words: AtomicU64,
    in_flight: AtomicU64,
    started: Instant,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self {
            pages_crawled: AtomicU64::new(0),
            pages_failed: AtomicU64::new(0),
            pages_skipped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            words: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn page_crawled(&self, words: u64, bytes: u64) {
        self.pages_crawled.fetch_add(1, Ordering::Relaxed);
        self.words.fetch_add(words, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn page_failed(&self) {
        self.pages_failed.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_skipped(&self) {
        self.pages_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_scheduled(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn pages_crawled(&self) -> u64 {
        self.pages_crawled.load(Ordering::Relaxed)
    }

    pub fn pages_failed(&self) -> u64 {
        self.pages_failed.load(Ordering::Relaxed)
    }

    pub fn pages_skipped(&self) -> u64 {
        self.pages_skipped.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn total_words(&self) -> u64 {
        self.words.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot with throughput rates since session start.
    pub fn snapshot(&self, queue_pending: u64) -> MetricSnapshot {
        let elapsed = self.started.elapsed().as_secs_f64().max(f64::EPSILON);
        let pages = self.pages_crawled();
        let bytes = self.total_bytes();
        MetricSnapshot {
            recorded_at: Utc::now(),
            pages_crawled: pages,
            bytes_processed: bytes,
            errors: self.errors(),
            pages_per_sec: pages as f64 / elapsed,
            bytes_per_sec: bytes as f64 / elapsed,
            in_flight: self.in_flight(),
            queue_pending,
        }
    }
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let c = SessionCounters::new();
        c.page_crawled(10, 2048);
        c.page_crawled(5, 1024);
        c.page_failed();
        c.page_skipped();
        c.retry_scheduled();

        assert_eq!(c.pages_crawled(), 2);
        assert_eq!(c.pages_failed(), 1);
        assert_eq!(c.pages_skipped(), 1);
        assert_eq!(c.errors(), 2);
        assert_eq!(c.total_words(), 15);
        assert_eq!(c.total_bytes(), 3072);
    }

    #[test]
    fn test_in_flight_gauge() {
        let c = SessionCounters::new();
        c.task_started();
        c.task_started();
        c.task_finished();
        assert_eq!(c.in_flight(), 1);
    }

    #[test]
    fn test_snapshot_rates() {
        let c = SessionCounters::new();
        c.page_crawled(100, 50_000);
        let snap = c.snapshot(42);
        assert_eq!(snap.pages_crawled, 1);
        assert_eq!(snap.queue_pending, 42);
        assert!(snap.pages_per_sec > 0.0);
    }
}
