//! Worker pool
//!
//! Owns N worker tasks plus the bounded `tasks` and `results` channels
//! between them and the session. `submit` blocks when the task channel is
//! full, which is the natural backpressure against a producer outpacing the
//! workers. A worker that dies while the pool is RUNNING is replaced; during
//! DRAINING it is not.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::worker::{CrawlTask, Worker, WorkerContext};
use crate::types::PageResult;

/// Pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Initialized = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

struct SharedState(AtomicU8);

impl SharedState {
    fn get(&self) -> PoolState {
        match self.0.load(Ordering::Acquire) {
            0 => PoolState::Initialized,
            1 => PoolState::Running,
            2 => PoolState::Draining,
            _ => PoolState::Stopped,
        }
    }

    fn set(&self, state: PoolState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Fixed-size pool of crawl workers.
pub struct WorkerPool {
    tasks_tx: Option<mpsc::Sender<CrawlTask>>,
    supervisors: Vec<JoinHandle<()>>,
    state: Arc<SharedState>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers. Returns the pool and the results channel the
    /// session consumes. The results bound leaves room for every worker to
    /// park a result even while the session is blocked submitting.
    pub fn start(size: usize, ctx: Arc<WorkerContext>) -> (Self, mpsc::Receiver<PageResult>) {
        let size = size.max(1);
        let (tasks_tx, tasks_rx) = mpsc::channel::<CrawlTask>(size * 2);
        let (results_tx, results_rx) = mpsc::channel::<PageResult>(size * 4);
        let tasks_rx = Arc::new(tokio::sync::Mutex::new(tasks_rx));
        let state = Arc::new(SharedState(AtomicU8::new(PoolState::Running as u8)));

        let mut supervisors = Vec::with_capacity(size);
        for id in 0..size {
            supervisors.push(Self::supervise(
                id,
                Arc::clone(&ctx),
                Arc::clone(&tasks_rx),
                results_tx.clone(),
                Arc::clone(&state),
            ));
        }

        info!(workers = size, "worker pool started");
        (
            Self {
                tasks_tx: Some(tasks_tx),
                supervisors,
                state,
                size,
            },
            results_rx,
        )
    }

    /// Spawn one worker slot and keep it alive: a panicked worker is
    /// respawned while the pool is RUNNING and left down once DRAINING.
    fn supervise(
        id: usize,
        ctx: Arc<WorkerContext>,
        tasks_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<CrawlTask>>>,
        results_tx: mpsc::Sender<PageResult>,
        state: Arc<SharedState>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let worker = Worker::new(id, Arc::clone(&ctx));
                let rx = Arc::clone(&tasks_rx);
                let tx = results_tx.clone();
                let run = tokio::spawn(Self::worker_loop(worker, rx, tx));

                match run.await {
                    Ok(()) => break,
                    Err(err) => {
                        if state.get() == PoolState::Running {
                            warn!(worker = id, error = %err, "worker died, respawning");
                            continue;
                        }
                        debug!(worker = id, "worker died while draining, not replaced");
                        break;
                    }
                }
            }
        })
    }

    /// Pull tasks until the channel closes. Exits cleanly; `process` never
    /// errors for a bad URL.
    async fn worker_loop(
        worker: Worker,
        tasks_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<CrawlTask>>>,
        results_tx: mpsc::Sender<PageResult>,
    ) {
        loop {
            // Hold the receiver lock only for the dequeue itself
            let task = { tasks_rx.lock().await.recv().await };
            let Some(task) = task else { break };

            let result = worker.process(task).await;
            if results_tx.send(result).await.is_err() {
                // Session dropped the receiver; nothing left to report to
                break;
            }
        }
        debug!(worker = worker.id(), "worker loop finished");
    }

    pub fn state(&self) -> PoolState {
        self.state.get()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sender for task submission. Blocks (backpressure) when full.
    pub fn tasks(&self) -> &mpsc::Sender<CrawlTask> {
        self.tasks_tx
            .as_ref()
            .expect("pool accepts tasks until stop() is called")
    }

    /// Submit one task, waiting for channel capacity.
    pub async fn submit(&self, task: CrawlTask) -> Result<(), mpsc::error::SendError<CrawlTask>> {
        self.tasks().send(task).await
    }

    /// Graceful stop: close the task channel, then wait up to `deadline` for
    /// workers to drain in-flight tasks. Workers still running at the
    /// deadline are aborted; their leases are recovered elsewhere.
    pub async fn stop(&mut self, deadline: Duration) {
        self.state.set(PoolState::Draining);
        self.tasks_tx.take();

        let mut handles = std::mem::take(&mut self.supervisors);
        let drain = async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!("worker pool drain deadline hit, aborting remaining workers");
            for handle in &handles {
                handle.abort();
            }
        }

        self.state.set(PoolState::Stopped);
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crawl::{
        analyze::WordAnalyzer, dedup::VisitedFilter, extract::ContentExtractor,
        fetch::PageFetcher, normalize::UrlNormalizer, ratelimit::RateLimiter,
        robots::RobotsPolicy,
    };
    use crate::queue::QueuedUrl;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    fn context() -> Arc<WorkerContext> {
        let config = Arc::new(Config::default());
        let fetcher =
            Arc::new(PageFetcher::new(&config.crawler, config.content.max_page_size).unwrap());
        Arc::new(WorkerContext {
            robots: Arc::new(RobotsPolicy::new(fetcher.client(), "test")),
            extractor: Arc::new(ContentExtractor::new(&config.content)),
            analyzer: Arc::new(WordAnalyzer::new(&config.content)),
            limiter: Arc::new(RateLimiter::new(Duration::from_millis(1))),
            normalizer: Arc::new(UrlNormalizer::new(&[]).allow_private_hosts()),
            dedup: Arc::new(VisitedFilter::new(1000)),
            fetcher,
            config,
            cancel: CancellationToken::new(),
        })
    }

    fn task(url: &str) -> CrawlTask {
        CrawlTask {
            url: Url::parse(url).unwrap(),
            queued: QueuedUrl {
                url: url.to_string(),
                parent_url: None,
                depth: 0,
                priority: 0,
                attempts: 0,
                discovered_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn test_pool_lifecycle() {
        let (mut pool, _results) = WorkerPool::start(2, context());
        assert_eq!(pool.state(), PoolState::Running);
        assert_eq!(pool.size(), 2);

        pool.stop(Duration::from_secs(5)).await;
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[tokio::test]
    async fn test_results_flow_through() {
        // Unreachable port: every task produces an errored result quickly
        let (mut pool, mut results) = WorkerPool::start(2, context());
        for i in 0..4 {
            pool.submit(task(&format!("http://127.0.0.1:9/{}", i)))
                .await
                .unwrap();
        }

        let mut received = 0;
        while received < 4 {
            let result = tokio::time::timeout(Duration::from_secs(60), results.recv())
                .await
                .expect("results within deadline")
                .expect("channel open");
            assert!(result.error.is_some());
            received += 1;
        }

        pool.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_stop_closes_results_channel() {
        let (mut pool, mut results) = WorkerPool::start(2, context());
        pool.stop(Duration::from_secs(5)).await;
        // All worker-held senders dropped with the workers
        assert!(results.recv().await.is_none());
    }
}
