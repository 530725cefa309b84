//! Crawl session orchestrator
//!
//! Owns one crawl run end to end: seeds the queue, leases URLs to the worker
//! pool, persists results, re-enqueues discovered links, and decides when the
//! crawl is over. Workers never touch the queue, the store, or the counters;
//! everything they learn arrives here through the result channel, and a page
//! is persisted before any link discovered on it becomes leasable.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::metrics::SessionCounters;
use super::recovery::QueueRecovery;
use crate::config::{Config, QueueBackend};
use crate::crawl::analyze::WordAnalyzer;
use crate::crawl::dedup::VisitedFilter;
use crate::crawl::extract::ContentExtractor;
use crate::crawl::fetch::PageFetcher;
use crate::crawl::normalize::UrlNormalizer;
use crate::crawl::pool::WorkerPool;
use crate::crawl::ratelimit::RateLimiter;
use crate::crawl::robots::RobotsPolicy;
use crate::crawl::worker::{CrawlTask, WorkerContext};
use crate::error::{CrawlErrorKind, StoreError};
use crate::queue::{
    Completion, DurableQueue, Enqueued, EnqueueRequest, MemoryQueue, QueuedUrl, UrlQueue,
};
use crate::storage::{CrawlStore, PageRecord, SessionTotals};
use crate::types::{PageResult, SessionState};

/// Lease timeout inside the main loop; short so termination and results are
/// re-checked promptly.
const LEASE_TIMEOUT: Duration = Duration::from_millis(500);
/// Retry backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Final accounting for a finished session.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub session_id: Uuid,
    pub state: SessionState,
    pub pages_crawled: u64,
    pub pages_failed: u64,
    pub pages_skipped: u64,
    pub total_words: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
}

/// Mutable loop state, separate from the engine's shared handles.
struct LoopState {
    in_flight: HashSet<String>,
    last_error: Option<String>,
}

/// One crawl session.
pub struct CrawlEngine {
    session_id: Uuid,
    name: String,
    config: Arc<Config>,
    store: Arc<CrawlStore>,
    queue: Arc<dyn UrlQueue>,
    counters: Arc<SessionCounters>,
    cancel: CancellationToken,
    durable: bool,
}

impl CrawlEngine {
    /// Connect the store, bootstrap the schema, and build the configured
    /// queue backend. `session_id` may be a prior run's id to resume a
    /// durable queue after a crash.
    pub async fn new(config: Config, name: &str, session_id: Option<Uuid>) -> Result<Self> {
        let config = Arc::new(config);
        let store = Arc::new(
            CrawlStore::connect(&config.database)
                .await
                .context("connecting to database")?,
        );
        store.ensure_schema().await.context("schema bootstrap")?;

        let session_id = session_id.unwrap_or_else(Uuid::new_v4);
        let durable = config.queue.backend == QueueBackend::Durable;
        let queue: Arc<dyn UrlQueue> = if durable {
            Arc::new(DurableQueue::new(
                store.pool().clone(),
                session_id,
                config.queue.lease(),
                config.crawler.max_depth,
                config.crawler.max_pages,
            ))
        } else {
            Arc::new(MemoryQueue::new(
                config.queue.max_size,
                config.crawler.max_depth,
            ))
        };

        Ok(Self {
            session_id,
            name: name.to_string(),
            config,
            store,
            queue,
            counters: Arc::new(SessionCounters::new()),
            cancel: CancellationToken::new(),
            durable,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Token that cancels the session cooperatively (ctrl-c handler).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the crawl to completion.
    pub async fn run(self, seeds: Vec<String>) -> Result<CrawlSummary> {
        let started = Instant::now();
        let normalizer = Arc::new(if seeds_need_private_hosts(&seeds) {
            UrlNormalizer::new(&self.config.filters.strip_query_params).allow_private_hosts()
        } else {
            UrlNormalizer::new(&self.config.filters.strip_query_params)
        });

        let seed_urls = self.normalize_seeds(&normalizer, &seeds)?;
        self.store
            .create_session(
                self.session_id,
                &self.name,
                &seeds,
                &self.config,
            )
            .await
            .context("creating session row")?;

        info!(
            session = %self.session_id,
            name = %self.name,
            seeds = seed_urls.len(),
            workers = self.config.crawler.concurrent_workers,
            backend = ?self.config.queue.backend,
            "crawl session starting"
        );

        // Recovery: absorb orphans from a prior crash, then keep running in
        // the background against the durable queue
        let maintenance_cancel = self.cancel.child_token();
        let mut background = Vec::new();
        if self.durable {
            let recovery = Arc::new(QueueRecovery::new(
                self.store.pool().clone(),
                self.session_id,
                self.config.crawler.max_retries,
                self.config.queue.retention(),
            ));
            recovery
                .run_once()
                .await
                .context("startup recovery pass")?;
            let interval = Duration::from_secs(self.config.queue.recovery_interval.max(1));
            let cancel = maintenance_cancel.clone();
            let recovery_task = Arc::clone(&recovery);
            background.push(tokio::spawn(async move {
                recovery_task.run_periodic(interval, cancel).await;
            }));
        }

        // Metrics snapshots
        {
            let store = Arc::clone(&self.store);
            let counters = Arc::clone(&self.counters);
            let queue = Arc::clone(&self.queue);
            let session_id = self.session_id;
            let cancel = maintenance_cancel.clone();
            let every = Duration::from_secs(self.config.crawler.metrics_interval.max(1));
            background.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            let pending = queue
                                .counts()
                                .await
                                .map(|c| c.pending)
                                .unwrap_or_default();
                            let snapshot = counters.snapshot(pending);
                            info!(
                                session = %session_id,
                                pages = snapshot.pages_crawled,
                                errors = snapshot.errors,
                                pages_per_sec = snapshot.pages_per_sec,
                                in_flight = snapshot.in_flight,
                                queue_pending = snapshot.queue_pending,
                                "progress"
                            );
                            if let Err(err) = store.record_metric(session_id, &snapshot).await {
                                warn!(error = %err, "metric snapshot not recorded");
                            }
                        }
                    }
                }
            }));
        }

        // Shared worker handles
        let fetcher = Arc::new(
            PageFetcher::new(&self.config.crawler, self.config.content.max_page_size)
                .context("building HTTP client")?,
        );
        let dedup = Arc::new(VisitedFilter::new(
            (self.config.crawler.max_pages as usize).saturating_mul(20).max(4096),
        ));
        let ctx = Arc::new(WorkerContext {
            robots: Arc::new(RobotsPolicy::new(
                fetcher.client(),
                &self.config.crawler.user_agent,
            )),
            extractor: Arc::new(ContentExtractor::new(&self.config.content)),
            analyzer: Arc::new(WordAnalyzer::new(&self.config.content)),
            limiter: Arc::new(RateLimiter::new(self.config.crawler.rate_limit())),
            normalizer: Arc::clone(&normalizer),
            dedup: Arc::clone(&dedup),
            fetcher,
            config: Arc::clone(&self.config),
            cancel: self.cancel.clone(),
        });
        let (mut pool, mut results) =
            WorkerPool::start(self.config.crawler.concurrent_workers, ctx);

        // Seeds enter at depth 0 with the configured seed priority
        for seed in &seed_urls {
            dedup.insert(seed.as_str());
            let outcome = self
                .queue
                .enqueue(EnqueueRequest {
                    url: seed.as_str().to_string(),
                    parent_url: None,
                    depth: 0,
                    priority: self.config.queue.seed_priority,
                })
                .await?;
            debug!(seed = %seed, ?outcome, "seed enqueued");
        }

        let mut state = LoopState {
            in_flight: HashSet::new(),
            last_error: None,
        };
        let terminal = self.drive(&mut pool, &mut results, &mut state).await;

        // Graceful teardown: stop feeding workers, collect what's in flight,
        // persist stragglers, release anything still leased
        self.cancel.cancel();
        let grace = self.config.crawler.timeout() + Duration::from_secs(5);
        pool.stop(grace).await;
        while let Some(result) = results.recv().await {
            if let Err(err) = self.handle_result(result, &mut state).await {
                warn!(error = %err, "result dropped during shutdown");
            }
        }
        for url in state.in_flight.drain() {
            if let Err(err) = self.queue.release(&url).await {
                warn!(url = %url, error = %err, "lease not released");
            }
        }
        self.queue.close().await;
        maintenance_cancel.cancel();
        for task in background {
            let _ = task.await;
        }

        let totals = SessionTotals {
            pages_crawled: self.counters.pages_crawled(),
            pages_failed: self.counters.pages_failed(),
            pages_skipped: self.counters.pages_skipped(),
            total_words: self.counters.total_words(),
            total_bytes: self.counters.total_bytes(),
            error_count: self.counters.errors(),
        };
        self.store
            .close_session(self.session_id, terminal, totals, state.last_error.as_deref())
            .await
            .context("closing session row")?;

        let summary = CrawlSummary {
            session_id: self.session_id,
            state: terminal,
            pages_crawled: totals.pages_crawled,
            pages_failed: totals.pages_failed,
            pages_skipped: totals.pages_skipped,
            total_words: totals.total_words,
            total_bytes: totals.total_bytes,
            elapsed: started.elapsed(),
        };
        info!(
            session = %self.session_id,
            state = terminal.as_str(),
            pages = summary.pages_crawled,
            failed = summary.pages_failed,
            skipped = summary.pages_skipped,
            words = summary.total_words,
            elapsed_secs = summary.elapsed.as_secs(),
            "crawl session finished"
        );
        Ok(summary)
    }

    /// The main loop. Returns the terminal state.
    async fn drive(
        &self,
        pool: &mut WorkerPool,
        results: &mut mpsc::Receiver<PageResult>,
        state: &mut LoopState,
    ) -> SessionState {
        loop {
            if self.cancel.is_cancelled() {
                return SessionState::Cancelled;
            }

            // Stop leasing once persisted plus in-flight pages reach the
            // budget; keeps the persisted count at the limit, not past it
            let committed = self.counters.pages_crawled() + state.in_flight.len() as u64;
            if committed >= self.config.crawler.max_pages {
                if state.in_flight.is_empty() {
                    info!("page limit reached");
                    return SessionState::Completed;
                }
                match tokio::time::timeout(LEASE_TIMEOUT, results.recv()).await {
                    Ok(Some(result)) => {
                        if let Err(err) = self.handle_result(result, state).await {
                            return self.fatal(err, state);
                        }
                    }
                    Ok(None) => return SessionState::Completed,
                    Err(_) => {}
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return SessionState::Cancelled;
                }
                maybe = results.recv() => {
                    match maybe {
                        Some(result) => {
                            if let Err(err) = self.handle_result(result, state).await {
                                return self.fatal(err, state);
                            }
                        }
                        None => return SessionState::Completed,
                    }
                }
                // A lease future dropped mid-query can leave an IN_FLIGHT
                // orphan in the durable backend; recovery reclaims it after
                // the lease expires.
                leased = self.queue.lease(LEASE_TIMEOUT) => {
                    match leased {
                        Ok(Some(queued)) => {
                            if let Err(err) = self.dispatch(queued, pool, results, state).await {
                                return self.fatal(err, state);
                            }
                        }
                        Ok(None) => {
                            if state.in_flight.is_empty() {
                                match self.queue.counts().await {
                                    Ok(counts) if counts.pending == 0 => {
                                        return SessionState::Completed;
                                    }
                                    Ok(_) => {}
                                    Err(err) => {
                                        error!(error = %err, "queue counts failed");
                                        state.last_error = Some(err.to_string());
                                        return SessionState::Failed;
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "queue lease failed");
                            state.last_error = Some(err.to_string());
                            return SessionState::Failed;
                        }
                    }
                }
            }
        }
    }

    fn fatal(&self, err: StoreError, state: &mut LoopState) -> SessionState {
        error!(error = %err, "fatal persistence failure, session failing");
        state.last_error = Some(err.to_string());
        SessionState::Failed
    }

    /// Hand a leased URL to the pool, draining results while the task
    /// channel is full so producers and consumers cannot deadlock.
    async fn dispatch(
        &self,
        queued: QueuedUrl,
        pool: &WorkerPool,
        results: &mut mpsc::Receiver<PageResult>,
        state: &mut LoopState,
    ) -> Result<(), StoreError> {
        let url = match Url::parse(&queued.url) {
            Ok(url) => url,
            Err(err) => {
                // Queued URLs are normalized, so this is defensive
                warn!(url = %queued.url, error = %err, "unparseable queued URL");
                let _ = self
                    .queue
                    .complete(
                        &queued.url,
                        Completion::Failed {
                            error: format!("INVALID_URL: {}", err),
                        },
                    )
                    .await;
                self.counters.page_failed();
                return Ok(());
            }
        };

        state.in_flight.insert(queued.url.clone());
        self.counters.task_started();
        let mut pending = Some(CrawlTask { url, queued });

        while let Some(task) = pending.take() {
            tokio::select! {
                permit = pool.tasks().reserve() => {
                    match permit {
                        Ok(permit) => permit.send(task),
                        Err(_) => {
                            // Pool already stopped; put the lease back
                            state.in_flight.remove(&task.queued.url);
                            self.counters.task_finished();
                            let _ = self.queue.release(&task.queued.url).await;
                            return Ok(());
                        }
                    }
                }
                maybe = results.recv() => {
                    if let Some(result) = maybe {
                        self.handle_result(result, state).await?;
                    }
                    pending = Some(task);
                }
            }
        }
        Ok(())
    }

    /// Fold one worker result into the stores and the queue. `Err` means a
    /// fatal persistence failure.
    async fn handle_result(
        &self,
        result: PageResult,
        state: &mut LoopState,
    ) -> Result<(), StoreError> {
        state.in_flight.remove(&result.url);
        self.counters.task_finished();

        match &result.error {
            None => self.handle_success(result, state).await,
            Some(_) => self.handle_failure(result, state).await,
        }
    }

    async fn handle_success(
        &self,
        result: PageResult,
        state: &mut LoopState,
    ) -> Result<(), StoreError> {
        // Results racing past the page budget are not persisted; the row is
        // skipped so the budget holds exactly
        if self.counters.pages_crawled() >= self.config.crawler.max_pages {
            let _ = self
                .queue
                .complete(
                    &result.url,
                    Completion::Skipped {
                        reason: "page limit reached".to_string(),
                    },
                )
                .await;
            self.counters.page_skipped();
            return Ok(());
        }

        let record = PageRecord {
            url: result.url.clone(),
            final_url: result.final_url.clone(),
            depth: result.depth,
            status_code: result.http_status,
            content_type: result.content_type.clone(),
            title: result.title.clone(),
            text_length: result.text_len,
            total_words: result.total_words,
            unique_words: result.unique_words,
            body_bytes: result.body_bytes,
            timings: result.timings,
        };

        match self
            .store
            .record_page(
                self.session_id,
                &record,
                &result.word_frequencies,
                &result.links,
                self.durable,
            )
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                // Lost one page, not the session
                warn!(url = %result.url, error = %err, "page not persisted");
                state.last_error = Some(err.to_string());
                let _ = self
                    .queue
                    .complete(
                        &result.url,
                        Completion::Failed {
                            error: format!("PERSISTENCE_ERROR: {}", err),
                        },
                    )
                    .await;
                self.counters.page_failed();
                return Ok(());
            }
        }

        // Queue completion; a no-op for the durable backend, whose row moved
        // to DONE inside the record_page transaction
        if let Err(err) = self.queue.complete(&result.url, Completion::Done).await {
            warn!(url = %result.url, error = %err, "queue completion failed");
        }
        self.counters
            .page_crawled(result.total_words, result.body_bytes);

        // Links only become leasable after their page committed
        let child_depth = result.depth + 1;
        let child_priority = (result.priority - 1).max(0);
        for link in &result.links {
            let outcome = self
                .queue
                .enqueue(EnqueueRequest {
                    url: link.url.clone(),
                    parent_url: Some(result.url.clone()),
                    depth: child_depth,
                    priority: child_priority,
                })
                .await;
            match outcome {
                Ok(Enqueued::Accepted) => {}
                Ok(other) => debug!(url = %link.url, ?other, "link not enqueued"),
                Err(err) => warn!(url = %link.url, error = %err, "link enqueue failed"),
            }
        }

        Ok(())
    }

    async fn handle_failure(
        &self,
        result: PageResult,
        state: &mut LoopState,
    ) -> Result<(), StoreError> {
        let error = result.error.as_ref().expect("failure path");
        state.last_error = Some(error.to_string());

        if let Err(err) = self
            .store
            .record_error_event(
                self.session_id,
                &result.url,
                result.depth,
                error.kind.as_str(),
                &error.message,
            )
            .await
        {
            if err.is_fatal() {
                return Err(err);
            }
            warn!(error = %err, "error event not recorded");
        }

        if error.kind == CrawlErrorKind::Cancelled {
            // The worker never ran this URL; hand the lease back
            if let Err(err) = self.queue.release(&result.url).await {
                warn!(url = %result.url, error = %err, "release failed");
            }
            return Ok(());
        }

        let completion = if error.retryable() && result.attempts < self.config.crawler.max_retries {
            self.counters.retry_scheduled();
            Completion::Retry {
                error: error.to_string(),
                backoff: retry_backoff(self.config.crawler.rate_limit(), result.attempts),
            }
        } else if error.kind.is_skip() {
            self.counters.page_skipped();
            Completion::Skipped {
                reason: error.to_string(),
            }
        } else {
            self.counters.page_failed();
            Completion::Failed {
                error: error.to_string(),
            }
        };

        debug!(url = %result.url, kind = error.kind.as_str(), ?completion, "page failed");
        if let Err(err) = self.queue.complete(&result.url, completion).await {
            warn!(url = %result.url, error = %err, "queue completion failed");
        }
        Ok(())
    }

    fn normalize_seeds(&self, normalizer: &UrlNormalizer, seeds: &[String]) -> Result<Vec<Url>> {
        let mut seed_urls = Vec::new();
        for seed in seeds {
            match normalizer.normalize(seed, None) {
                Ok(url) => seed_urls.push(url),
                Err(err) => warn!(seed = %seed, error = %err, "seed rejected"),
            }
        }
        if seed_urls.is_empty() {
            anyhow::bail!("no valid seed URLs");
        }
        Ok(seed_urls)
    }
}

/// Exponential retry backoff: `rate_limit_delay * 2^attempts`, capped.
fn retry_backoff(base: Duration, attempts: u32) -> Duration {
    let secs = base.as_secs_f64().max(0.1) * 2f64.powi(attempts.min(16) as i32);
    Duration::from_secs_f64(secs.min(MAX_BACKOFF.as_secs_f64()))
}

/// Loopback seeds imply a test/local crawl; relax the private-host denial so
/// they normalize.
fn seeds_need_private_hosts(seeds: &[String]) -> bool {
    seeds
        .iter()
        .any(|s| s.contains("127.0.0.1") || s.contains("localhost") || s.contains("[::1]"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_schedule() {
        let base = Duration::from_secs(1);
        assert_eq!(retry_backoff(base, 0), Duration::from_secs(1));
        assert_eq!(retry_backoff(base, 1), Duration::from_secs(2));
        assert_eq!(retry_backoff(base, 2), Duration::from_secs(4));
        assert_eq!(retry_backoff(base, 10), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_backoff_floor_for_zero_delay() {
        // A zero rate limit must still back off a little
        let backoff = retry_backoff(Duration::ZERO, 0);
        assert!(backoff >= Duration::from_millis(100));
    }

    #[test]
    fn test_private_host_detection() {
        assert!(seeds_need_private_hosts(&["http://127.0.0.1:8080/a".into()]));
        assert!(seeds_need_private_hosts(&["http://localhost/a".into()]));
        assert!(!seeds_need_private_hosts(&["https://example.com/".into()]));
    }
}
