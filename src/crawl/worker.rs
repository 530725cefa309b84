//! Per-URL worker pipeline
//!
//! Runs one leased URL through robots check → rate limit → fetch → extract →
//! analyze → link filtering, timing each stage, and emits a [`PageResult`].
//! Every failure is folded into the result; nothing a single URL does can
//! take the worker down. Workers touch no shared mutable state beyond the
//! channels and the per-host rate-limit slots.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::analyze::WordAnalyzer;
use super::dedup::VisitedFilter;
use super::extract::ContentExtractor;
use super::fetch::PageFetcher;
use super::normalize::UrlNormalizer;
use super::ratelimit::RateLimiter;
use super::robots::RobotsPolicy;
use crate::config::Config;
use crate::error::{CrawlErrorKind, PageError};
use crate::queue::QueuedUrl;
use crate::types::{DiscoveredLink, LinkKind, PageResult, StageTimings};

/// One unit of work handed to the pool.
#[derive(Debug, Clone)]
pub struct CrawlTask {
    /// Parsed form of the queued (already normalized) URL
    pub url: Url,
    pub queued: QueuedUrl,
}

/// Handles shared by every worker, all read-only or internally synchronized.
pub struct WorkerContext {
    pub fetcher: Arc<PageFetcher>,
    pub extractor: Arc<ContentExtractor>,
    pub analyzer: Arc<WordAnalyzer>,
    pub robots: Arc<RobotsPolicy>,
    pub limiter: Arc<RateLimiter>,
    pub normalizer: Arc<UrlNormalizer>,
    pub dedup: Arc<VisitedFilter>,
    pub config: Arc<Config>,
    pub cancel: CancellationToken,
}

impl WorkerContext {
    /// Whether `host` passes the allowed/blocked domain lists. A host
    /// matches a domain entry exactly or as a subdomain of it.
    fn host_permitted(&self, host: &str) -> bool {
        let matches = |domain: &String| {
            let domain = domain.to_lowercase();
            host == domain || host.ends_with(&format!(".{}", domain))
        };
        if self.config.filters.blocked_domains.iter().any(matches) {
            return false;
        }
        if self.config.filters.allowed_domains.is_empty() {
            return true;
        }
        self.config.filters.allowed_domains.iter().any(matches)
    }
}

/// A single crawl worker.
pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        Self { id, ctx }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Process one URL to a result. Never returns an error.
    pub async fn process(&self, task: CrawlTask) -> PageResult {
        let started = Instant::now();
        let mut timings = StageTimings::default();
        let queued = &task.queued;
        let fail = |error: PageError, mut timings: StageTimings| {
            timings.total = started.elapsed();
            PageResult::failed(
                queued.url.clone(),
                queued.parent_url.clone(),
                queued.depth,
                queued.priority,
                queued.attempts,
                error,
                timings,
            )
        };

        let host = match task.url.host_str() {
            Some(h) => h.to_string(),
            None => {
                return fail(
                    PageError::new(CrawlErrorKind::InvalidUrl, "URL has no host"),
                    timings,
                )
            }
        };

        // Robots gate: denied URLs never reach the transport
        if !self.ctx.robots.allowed(&task.url).await {
            debug!(worker = self.id, url = %task.url, "denied by robots.txt");
            return fail(
                PageError::new(CrawlErrorKind::DisallowedByRobots, "denied by robots.txt"),
                timings,
            );
        }
        if let Some(delay) = self.ctx.robots.crawl_delay(&task.url) {
            self.ctx.limiter.raise_interval(&host, delay);
        }

        // Politeness gate, abandoned without burning the host's slot if the
        // session cancels while we wait
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => {
                return fail(PageError::new(CrawlErrorKind::Cancelled, "cancelled"), timings);
            }
            _ = self.ctx.limiter.acquire(&host) => {}
        }

        let fetch_started = Instant::now();
        let fetched = match self.ctx.fetcher.fetch(&task.url).await {
            Ok(f) => f,
            Err(error) => {
                timings.fetch = fetch_started.elapsed();
                return fail(error, timings);
            }
        };
        timings.fetch = fetched.elapsed;

        if !self.ctx.extractor.allows_content_type(&fetched.content_type) {
            return fail(
                PageError::new(
                    CrawlErrorKind::DisallowedContentType,
                    format!("content type '{}' not allowed", fetched.content_type),
                ),
                timings,
            );
        }

        // CPU-bound parse and tokenization run off the async threads
        let extractor = Arc::clone(&self.ctx.extractor);
        let analyzer = Arc::clone(&self.ctx.analyzer);
        let min_text_length = self.ctx.config.content.min_text_length;
        let body = fetched.body;
        let base = fetched.final_url.clone();
        let parsed = tokio::task::spawn_blocking(move || {
            let extract_started = Instant::now();
            let page = extractor.extract(&body, &base);
            let extract_elapsed = extract_started.elapsed();

            let analyze_started = Instant::now();
            let analysis = if page.text.len() >= min_text_length {
                analyzer.analyze(&page.text)
            } else {
                Default::default()
            };
            (page, analysis, extract_elapsed, analyze_started.elapsed())
        })
        .await;

        let (page, analysis, extract_elapsed, analyze_elapsed) = match parsed {
            Ok(p) => p,
            Err(err) => {
                return fail(
                    PageError::new(CrawlErrorKind::ParseError, format!("parse task failed: {}", err)),
                    timings,
                );
            }
        };
        timings.extract = extract_elapsed;
        timings.analyze = analyze_elapsed;

        let links = self.filter_links(&page.links, &fetched.final_url, queued.depth);
        timings.total = started.elapsed();

        debug!(
            worker = self.id,
            url = %task.url,
            status = fetched.status,
            words = analysis.total_words,
            links = links.len(),
            ms = timings.total_ms() as u64,
            "processed"
        );

        PageResult {
            url: queued.url.clone(),
            final_url: fetched.final_url.to_string(),
            parent_url: queued.parent_url.clone(),
            depth: queued.depth,
            priority: queued.priority,
            attempts: queued.attempts,
            http_status: Some(fetched.status),
            content_type: Some(fetched.content_type),
            body_bytes: fetched.body_bytes,
            title: page.title,
            text_len: page.text.len() as u64,
            total_words: analysis.total_words,
            unique_words: analysis.unique_words,
            word_frequencies: analysis.frequencies,
            links,
            timings,
            error: None,
        }
    }

    /// Normalize and filter the raw links from a page: domain policy, depth
    /// bound, and session-wide dedup. Order is preserved.
    fn filter_links(&self, raw: &[Url], source: &Url, depth: u32) -> Vec<DiscoveredLink> {
        if depth >= self.ctx.config.crawler.max_depth {
            // Children would land past the depth limit; don't surface them
            return Vec::new();
        }

        let source_host = source.host_str().unwrap_or_default().to_lowercase();
        let mut links = Vec::new();

        for candidate in raw {
            let Ok(normalized) = self.ctx.normalizer.normalize(candidate.as_str(), Some(source))
            else {
                continue;
            };
            let host = normalized.host_str().unwrap_or_default().to_lowercase();
            if !self.ctx.host_permitted(&host) {
                continue;
            }
            if normalized.as_str() == source.as_str() {
                continue;
            }
            if !self.ctx.dedup.insert(normalized.as_str()) {
                continue;
            }
            let kind = if host == source_host {
                LinkKind::Internal
            } else {
                LinkKind::External
            };
            links.push(DiscoveredLink {
                url: normalized.into(),
                kind,
            });
        }

        links
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve fixed responses: robots.txt plus one page body, repeatedly.
    async fn serve(robots: &'static str, page: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let body = if request.starts_with("GET /robots.txt") {
                        robots
                    } else {
                        page
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn context(config: Config) -> Arc<WorkerContext> {
        let config = Arc::new(config);
        let fetcher = Arc::new(
            PageFetcher::new(&config.crawler, config.content.max_page_size).unwrap(),
        );
        Arc::new(WorkerContext {
            robots: Arc::new(RobotsPolicy::new(fetcher.client(), &config.crawler.user_agent)),
            extractor: Arc::new(ContentExtractor::new(&config.content)),
            analyzer: Arc::new(WordAnalyzer::new(&config.content)),
            limiter: Arc::new(RateLimiter::new(Duration::from_millis(1))),
            normalizer: Arc::new(UrlNormalizer::new(&[]).allow_private_hosts()),
            dedup: Arc::new(VisitedFilter::new(10_000)),
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
                priority: 10,
                attempts: 0,
                discovered_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn test_single_page_pipeline() {
        let base = serve("", "<html><body>hello hello world</body></html>").await;
        let mut config = Config::default();
        config.content.min_text_length = 1;
        let worker = Worker::new(0, context(config));

        let result = worker.process(task(&format!("{}/a", base))).await;
        assert!(result.is_success(), "error: {:?}", result.error);
        assert_eq!(result.http_status, Some(200));
        assert_eq!(result.word_frequencies.get("hello"), Some(&2));
        assert_eq!(result.word_frequencies.get("world"), Some(&1));
        assert_eq!(result.total_words, 3);
        assert_eq!(result.unique_words, 2);
        assert!(result.links.is_empty());
        assert!(result.timings.fetch > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_robots_denial_skips_without_fetch() {
        let base = serve("User-agent: *\nDisallow: /admin/\n", "<html>secret</html>").await;
        let worker = Worker::new(0, context(Config::default()));

        let result = worker.process(task(&format!("{}/admin/users", base))).await;
        let error = result.error.expect("should be denied");
        assert_eq!(error.kind, CrawlErrorKind::DisallowedByRobots);
        assert_eq!(result.http_status, None, "no page request issued");
    }

    #[tokio::test]
    async fn test_links_discovered_and_classified() {
        let base = serve(
            "",
            r#"<html><body>content words here for the page
                <a href="/next">next</a>
                <a href="https://elsewhere.org/x">away</a>
            </body></html>"#,
        )
        .await;
        let mut config = Config::default();
        config.content.min_text_length = 1;
        let worker = Worker::new(0, context(config));

        let result = worker.process(task(&format!("{}/start", base))).await;
        assert!(result.is_success());
        assert_eq!(result.links.len(), 2);
        assert_eq!(result.links[0].kind, LinkKind::Internal);
        assert!(result.links[0].url.ends_with("/next"));
        assert_eq!(result.links[1].kind, LinkKind::External);
    }

    #[tokio::test]
    async fn test_links_suppressed_at_max_depth() {
        let base = serve(
            "",
            r#"<html><body>deep page <a href="/deeper">deeper</a></body></html>"#,
        )
        .await;
        let mut config = Config::default();
        config.crawler.max_depth = 2;
        config.content.min_text_length = 1;
        let worker = Worker::new(0, context(config));

        let mut t = task(&format!("{}/leaf", base));
        t.queued.depth = 2;
        let result = worker.process(t).await;
        assert!(result.is_success());
        assert!(result.links.is_empty(), "depth-limit pages surface no links");
    }

    #[tokio::test]
    async fn test_duplicate_links_dropped_across_pages() {
        let base = serve(
            "",
            r#"<html><body>words <a href="/shared">s</a></body></html>"#,
        )
        .await;
        let mut config = Config::default();
        config.content.min_text_length = 1;
        let ctx = context(config);
        let worker = Worker::new(0, Arc::clone(&ctx));

        let first = worker.process(task(&format!("{}/p1", base))).await;
        assert_eq!(first.links.len(), 1);
        let second = worker.process(task(&format!("{}/p2", base))).await;
        assert!(second.links.is_empty(), "second discovery deduplicated");
    }

    #[tokio::test]
    async fn test_blocked_domain_filtered() {
        let base = serve(
            "",
            r#"<html><body>words <a href="https://blocked.example/x">b</a>
               <a href="https://ok.example/y">ok</a></body></html>"#,
        )
        .await;
        let mut config = Config::default();
        config.content.min_text_length = 1;
        config.filters.blocked_domains = vec!["blocked.example".to_string()];
        let worker = Worker::new(0, context(config));

        let result = worker.process(task(&format!("{}/p", base))).await;
        assert_eq!(result.links.len(), 1);
        assert!(result.links[0].url.contains("ok.example"));
    }

    #[tokio::test]
    async fn test_cancelled_worker_reports_cancelled() {
        let base = serve("", "<html>x</html>").await;
        let ctx = context(Config::default());
        ctx.cancel.cancel();
        // A long rate-limit interval forces the worker to the politeness
        // gate, where cancellation is observed
        ctx.limiter.raise_interval("127.0.0.1", Duration::from_secs(60));
        ctx.limiter.acquire("127.0.0.1").await;
        let worker = Worker::new(0, ctx);

        let result = worker.process(task(&format!("{}/x", base))).await;
        assert_eq!(result.error.unwrap().kind, CrawlErrorKind::Cancelled);
    }
}
