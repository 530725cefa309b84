//! URL queue
//!
//! Priority-ordered FIFO of pending URLs with leasing. Two backends satisfy
//! the same contract: an in-process structure that loses unfinished work on
//! shutdown, and a PostgreSQL-backed queue whose leases survive crashes and
//! are reclaimed by recovery.
//!
//! Ordering: higher priority first, then lower depth, then earlier
//! discovery. Leasing transitions PENDING → IN_FLIGHT; completion moves an
//! item to DONE/FAILED/SKIPPED or back to PENDING for a retry.

pub mod durable;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;

pub use durable::DurableQueue;
pub use memory::MemoryQueue;

/// Status strings stored by the durable backend.
pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_IN_FLIGHT: &str = "IN_FLIGHT";
pub const STATUS_DONE: &str = "DONE";
pub const STATUS_FAILED: &str = "FAILED";
pub const STATUS_SKIPPED: &str = "SKIPPED";

/// A URL accepted into the queue, as handed to a leasing worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUrl {
    pub url: String,
    pub parent_url: Option<String>,
    pub depth: u32,
    pub priority: i32,
    pub attempts: u32,
    pub discovered_at: DateTime<Utc>,
}

/// What to enqueue. `discovered_at` is stamped by the queue.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub url: String,
    pub parent_url: Option<String>,
    pub depth: u32,
    pub priority: i32,
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// (session, url) already present in any state
    Duplicate,
    /// depth exceeds the session's limit
    DepthExceeded,
    /// queue is full or closed
    LimitReached,
}

/// Terminal transition for a leased URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Done,
    Failed { error: String },
    Skipped { reason: String },
    /// Retryable failure with budget left: back to PENDING with attempts
    /// incremented and the given backoff before the next lease.
    Retry { error: String, backoff: Duration },
}

/// Queue population by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub terminal: u64,
}

/// The queue contract shared by both backends.
#[async_trait]
pub trait UrlQueue: Send + Sync {
    /// Add a URL. Idempotent per (session, url).
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Enqueued, QueueError>;

    /// Take the best PENDING URL, marking it IN_FLIGHT. Blocks up to
    /// `timeout`; `None` means nothing became available (or the queue
    /// closed).
    async fn lease(&self, timeout: Duration) -> Result<Option<QueuedUrl>, QueueError>;

    /// Resolve an IN_FLIGHT URL. A no-op if the URL is not currently leased,
    /// which makes completion idempotent when persistence already advanced
    /// the row in its own transaction.
    async fn complete(&self, url: &str, completion: Completion) -> Result<(), QueueError>;

    /// Return an IN_FLIGHT URL to PENDING, incrementing attempts. Used when
    /// a worker is torn down mid-lease.
    async fn release(&self, url: &str) -> Result<(), QueueError>;

    /// Population counts.
    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Reject further enqueues and wake all blocked leasers.
    async fn close(&self);
}

/// Ordering key shared by both backends: priority DESC, depth ASC,
/// discovery ASC.
pub(crate) fn compare_entries(
    a: (i32, u32, DateTime<Utc>),
    b: (i32, u32, DateTime<Utc>),
) -> std::cmp::Ordering {
    b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_key() {
        use std::cmp::Ordering;
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);

        // Higher priority first
        assert_eq!(compare_entries((5, 0, t0), (1, 0, t0)), Ordering::Less);
        // Same priority: shallower first
        assert_eq!(compare_entries((1, 1, t0), (1, 2, t0)), Ordering::Less);
        // Same priority+depth: earlier discovery first
        assert_eq!(compare_entries((1, 1, t0), (1, 1, t1)), Ordering::Less);
    }
}
