//! Per-host rate limiting
//!
//! Each host has a `next_available_at` slot behind its own async mutex.
//! `acquire` waits until the slot opens, then books the next one. Waiters on
//! the same host are served in arrival order because `tokio::sync::Mutex`
//! queues them fairly. Dropping an `acquire` future before it completes
//! (cancellation) never advances the slot, so a cancelled caller does not
//! burn the host's budget.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

struct HostSlot {
    /// Earliest instant the next request to this host may start
    gate: tokio::sync::Mutex<Instant>,
    /// Minimum interval between requests to this host
    interval: Mutex<Duration>,
}

/// Per-host minimum-interval gate with fair dispatch.
pub struct RateLimiter {
    hosts: DashMap<String, Arc<HostSlot>>,
    default_interval: Duration,
}

impl RateLimiter {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            hosts: DashMap::new(),
            default_interval,
        }
    }

    fn slot(&self, host: &str) -> Arc<HostSlot> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostSlot {
                    gate: tokio::sync::Mutex::new(Instant::now()),
                    interval: Mutex::new(self.default_interval),
                })
            })
            .clone()
    }

    /// Raise `host`'s interval (robots crawl-delay). The global delay is a
    /// floor; a smaller crawl-delay never speeds a host up.
    pub fn raise_interval(&self, host: &str, interval: Duration) {
        if interval <= self.default_interval {
            return;
        }
        let slot = self.slot(host);
        let mut current = slot.interval.lock();
        if interval > *current {
            *current = interval;
        }
    }

    /// Current interval for `host`.
    pub fn interval(&self, host: &str) -> Duration {
        self.hosts
            .get(host)
            .map(|s| *s.interval.lock())
            .unwrap_or(self.default_interval)
    }

    /// Wait until a request to `host` is permitted, then book the slot.
    pub async fn acquire(&self, host: &str) {
        let slot = self.slot(host);
        let mut next_at = slot.gate.lock().await;

        let now = Instant::now();
        if *next_at > now {
            tokio::time::sleep_until(*next_at).await;
        }
        // The slot is only advanced after the wait completes; cancellation
        // above leaves it untouched.
        let interval = *slot.interval.lock();
        *next_at = Instant::now() + interval;
    }

    /// Number of hosts tracked.
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        let started = StdInstant::now();
        limiter.acquire("example.com").await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_minimum_interval_enforced() {
        let limiter = RateLimiter::new(Duration::from_millis(80));
        let started = StdInstant::now();
        limiter.acquire("example.com").await;
        limiter.acquire("example.com").await;
        limiter.acquire("example.com").await;
        // Two intervals between three acquisitions
        assert!(started.elapsed() >= Duration::from_millis(160));
    }

    #[tokio::test]
    async fn test_hosts_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        let started = StdInstant::now();
        limiter.acquire("a.com").await;
        limiter.acquire("b.com").await;
        limiter.acquire("c.com").await;
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_crawl_delay_only_raises() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        limiter.raise_interval("slow.com", Duration::from_secs(2));
        assert_eq!(limiter.interval("slow.com"), Duration::from_secs(2));

        // Lower than the floor: ignored
        limiter.raise_interval("slow.com", Duration::from_millis(100));
        assert_eq!(limiter.interval("slow.com"), Duration::from_secs(2));

        limiter.raise_interval("fast.com", Duration::from_millis(100));
        assert_eq!(limiter.interval("fast.com"), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_cancelled_acquire_does_not_advance_slot() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(100)));
        limiter.acquire("example.com").await;

        // Start a second acquire and drop it mid-wait
        {
            let l = Arc::clone(&limiter);
            let fut = tokio::spawn(async move { l.acquire("example.com").await });
            tokio::time::sleep(Duration::from_millis(10)).await;
            fut.abort();
            let _ = fut.await;
        }

        // The aborted waiter must not have consumed the upcoming slot: the
        // next acquire completes after one interval from the first, not two.
        let started = StdInstant::now();
        limiter.acquire("example.com").await;
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_fairness_under_contention() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(20)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let l = Arc::clone(&limiter);
            let o = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                l.acquire("example.com").await;
                o.lock().push(i);
            }));
            // Stagger arrivals so arrival order is well-defined
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}
