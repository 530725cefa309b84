//! In-memory queue backend
//!
//! A binary heap ordered by the queue contract plus a companion map from
//! URL to entry state for dedup and status lookup. One coarse lock guards
//! both; every operation under it is O(log n) and dwarfed by the I/O around
//! it. The process holds the only copy, so there is no lease expiry — on
//! shutdown, unfinished work is gone.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::{compare_entries, Completion, Enqueued, EnqueueRequest, QueueCounts, QueuedUrl, UrlQueue};
use crate::error::QueueError;

/// Heap entry. The heap may hold stale entries for URLs whose state moved
/// on; the entry map is the authority and stale pops are discarded.
#[derive(Debug, Clone)]
struct HeapEntry {
    priority: i32,
    depth: u32,
    discovered_at: DateTime<Utc>,
    /// Bumped on every re-queue so a stale heap entry can be recognized
    generation: u64,
    url: String,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert the contract ordering so the
        // entry that should lease first is the maximum.
        compare_entries(
            (self.priority, self.depth, self.discovered_at),
            (other.priority, other.depth, other.discovered_at),
        )
        .reverse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Pending,
    InFlight,
    Terminal,
}

#[derive(Debug)]
struct Entry {
    status: EntryStatus,
    parent_url: Option<String>,
    depth: u32,
    priority: i32,
    attempts: u32,
    discovered_at: DateTime<Utc>,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<HeapEntry>,
    entries: HashMap<String, Entry>,
    pending: u64,
    in_flight: u64,
    terminal: u64,
    closed: bool,
}

/// In-process queue backend.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    max_size: usize,
    max_depth: u32,
}

impl MemoryQueue {
    pub fn new(max_size: usize, max_depth: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            max_size,
            max_depth,
        }
    }
}

#[async_trait]
impl UrlQueue for MemoryQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Enqueued, QueueError> {
        if request.depth > self.max_depth {
            return Ok(Enqueued::DepthExceeded);
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(Enqueued::LimitReached);
        }
        if inner.entries.contains_key(&request.url) {
            return Ok(Enqueued::Duplicate);
        }
        if inner.pending as usize >= self.max_size {
            debug!(url = %request.url, "queue full, rejecting");
            return Ok(Enqueued::LimitReached);
        }

        let discovered_at = Utc::now();
        inner.entries.insert(
            request.url.clone(),
            Entry {
                status: EntryStatus::Pending,
                parent_url: request.parent_url,
                depth: request.depth,
                priority: request.priority,
                attempts: 0,
                discovered_at,
                generation: 0,
            },
        );
        inner.heap.push(HeapEntry {
            priority: request.priority,
            depth: request.depth,
            discovered_at,
            generation: 0,
            url: request.url,
        });
        inner.pending += 1;
        drop(inner);

        self.notify.notify_waiters();
        Ok(Enqueued::Accepted)
    }

    async fn lease(&self, timeout: Duration) -> Result<Option<QueuedUrl>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);

            {
                let mut inner = self.inner.lock();

                // Pop until a live pending entry surfaces
                while let Some(top) = inner.heap.pop() {
                    let Some(entry) = inner.entries.get_mut(&top.url) else {
                        continue;
                    };
                    if entry.status != EntryStatus::Pending || entry.generation != top.generation {
                        continue;
                    }
                    entry.status = EntryStatus::InFlight;
                    let leased = QueuedUrl {
                        url: top.url.clone(),
                        parent_url: entry.parent_url.clone(),
                        depth: entry.depth,
                        priority: entry.priority,
                        attempts: entry.attempts,
                        discovered_at: entry.discovered_at,
                    };
                    inner.pending -= 1;
                    inner.in_flight += 1;
                    return Ok(Some(leased));
                }

                if inner.closed {
                    return Ok(None);
                }
                // Register for wakeups before releasing the lock so an
                // enqueue racing with us cannot be missed.
                notified.as_mut().enable();
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn complete(&self, url: &str, completion: Completion) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(url) else {
            return Err(QueueError::UnknownUrl(url.to_string()));
        };
        if entry.status != EntryStatus::InFlight {
            // Idempotent: already resolved elsewhere
            return Ok(());
        }

        match completion {
            Completion::Retry { .. } => {
                // The in-memory backend has no timer wheel; backoff is
                // approximated by dropping the retry's priority so fresher
                // work leases first.
                entry.status = EntryStatus::Pending;
                entry.attempts += 1;
                entry.priority -= 1;
                entry.generation += 1;
                let heap_entry = HeapEntry {
                    priority: entry.priority,
                    depth: entry.depth,
                    discovered_at: entry.discovered_at,
                    generation: entry.generation,
                    url: url.to_string(),
                };
                inner.heap.push(heap_entry);
                inner.in_flight -= 1;
                inner.pending += 1;
                drop(inner);
                self.notify.notify_waiters();
            }
            Completion::Done | Completion::Failed { .. } | Completion::Skipped { .. } => {
                entry.status = EntryStatus::Terminal;
                inner.in_flight -= 1;
                inner.terminal += 1;
            }
        }
        Ok(())
    }

    async fn release(&self, url: &str) -> Result<(), QueueError> {
        self.complete(
            url,
            Completion::Retry {
                error: "released".to_string(),
                backoff: Duration::ZERO,
            },
        )
        .await
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let inner = self.inner.lock();
        Ok(QueueCounts {
            pending: inner.pending,
            in_flight: inner.in_flight,
            terminal: inner.terminal,
        })
    }

    async fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(url: &str, depth: u32, priority: i32) -> EnqueueRequest {
        EnqueueRequest {
            url: url.to_string(),
            parent_url: None,
            depth,
            priority,
        }
    }

    fn queue() -> MemoryQueue {
        MemoryQueue::new(1000, 5)
    }

    #[tokio::test]
    async fn test_enqueue_outcomes() {
        let q = queue();
        assert_eq!(q.enqueue(request("http://h/a", 0, 0)).await.unwrap(), Enqueued::Accepted);
        assert_eq!(q.enqueue(request("http://h/a", 0, 0)).await.unwrap(), Enqueued::Duplicate);
        assert_eq!(
            q.enqueue(request("http://h/deep", 6, 0)).await.unwrap(),
            Enqueued::DepthExceeded
        );

        let tiny = MemoryQueue::new(1, 5);
        tiny.enqueue(request("http://h/1", 0, 0)).await.unwrap();
        assert_eq!(
            tiny.enqueue(request("http://h/2", 0, 0)).await.unwrap(),
            Enqueued::LimitReached
        );
    }

    #[tokio::test]
    async fn test_lease_ordering() {
        let q = queue();
        // Inserted out of order on purpose
        q.enqueue(request("http://h/low", 2, 0)).await.unwrap();
        q.enqueue(request("http://h/deep-high", 3, 5)).await.unwrap();
        q.enqueue(request("http://h/shallow-high", 1, 5)).await.unwrap();
        q.enqueue(request("http://h/mid", 1, 2)).await.unwrap();

        let order: Vec<String> = {
            let mut v = Vec::new();
            while let Some(u) = q.lease(Duration::from_millis(10)).await.unwrap() {
                v.push(u.url);
            }
            v
        };
        assert_eq!(
            order,
            vec![
                "http://h/shallow-high",
                "http://h/deep-high",
                "http://h/mid",
                "http://h/low",
            ]
        );
    }

    #[tokio::test]
    async fn test_fifo_within_same_priority_and_depth() {
        let q = queue();
        for i in 0..5 {
            q.enqueue(request(&format!("http://h/{}", i), 1, 0)).await.unwrap();
        }
        for i in 0..5 {
            let leased = q.lease(Duration::from_millis(10)).await.unwrap().unwrap();
            assert_eq!(leased.url, format!("http://h/{}", i));
        }
    }

    #[tokio::test]
    async fn test_lease_times_out_when_empty() {
        let q = queue();
        let started = std::time::Instant::now();
        let leased = q.lease(Duration::from_millis(50)).await.unwrap();
        assert!(leased.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_lease_wakes_on_enqueue() {
        let q = Arc::new(queue());
        let q2 = Arc::clone(&q);
        let leaser = tokio::spawn(async move { q2.lease(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(request("http://h/late", 0, 0)).await.unwrap();

        let leased = leaser.await.unwrap().unwrap().unwrap();
        assert_eq!(leased.url, "http://h/late");
    }

    #[tokio::test]
    async fn test_complete_transitions_and_counts() {
        let q = queue();
        q.enqueue(request("http://h/a", 0, 0)).await.unwrap();
        q.enqueue(request("http://h/b", 0, 0)).await.unwrap();

        let a = q.lease(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(
            q.counts().await.unwrap(),
            QueueCounts { pending: 1, in_flight: 1, terminal: 0 }
        );

        q.complete(&a.url, Completion::Done).await.unwrap();
        assert_eq!(
            q.counts().await.unwrap(),
            QueueCounts { pending: 1, in_flight: 0, terminal: 1 }
        );

        // Completing again is a no-op, not an error
        q.complete(&a.url, Completion::Done).await.unwrap();
        assert_eq!(q.counts().await.unwrap().terminal, 1);
    }

    #[tokio::test]
    async fn test_retry_requeues_with_lower_priority() {
        let q = queue();
        q.enqueue(request("http://h/flaky", 0, 5)).await.unwrap();
        q.enqueue(request("http://h/other", 0, 5)).await.unwrap();

        let flaky = q.lease(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(flaky.url, "http://h/flaky");
        assert_eq!(flaky.attempts, 0);
        q.complete(
            &flaky.url,
            Completion::Retry { error: "503".into(), backoff: Duration::from_secs(1) },
        )
        .await
        .unwrap();

        // The retry lost a priority point, so "other" leases first now
        let next = q.lease(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(next.url, "http://h/other");
        let retried = q.lease(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(retried.url, "http://h/flaky");
        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn test_release_returns_to_pending() {
        let q = queue();
        q.enqueue(request("http://h/a", 0, 0)).await.unwrap();
        let a = q.lease(Duration::from_millis(10)).await.unwrap().unwrap();
        q.release(&a.url).await.unwrap();

        let counts = q.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.in_flight, 0);

        let again = q.lease(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.url, "http://h/a");
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_close_unblocks_leasers_and_rejects_enqueues() {
        let q = Arc::new(queue());
        let q2 = Arc::clone(&q);
        let leaser = tokio::spawn(async move { q2.lease(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close().await;

        assert!(leaser.await.unwrap().unwrap().is_none());
        assert_eq!(
            q.enqueue(request("http://h/late", 0, 0)).await.unwrap(),
            Enqueued::LimitReached
        );
    }

    #[tokio::test]
    async fn test_no_double_delivery_under_contention() {
        let q = Arc::new(MemoryQueue::new(10_000, 3));
        for i in 0..200 {
            q.enqueue(request(&format!("http://h/{}", i), 0, 0)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(u) = q.lease(Duration::from_millis(5)).await.unwrap() {
                    seen.push(u.url.clone());
                    q.complete(&u.url, Completion::Done).await.unwrap();
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200, "each URL leased exactly once");
    }
}
