//! Crawl pipeline
//!
//! Everything between a leased URL and its result: canonicalization, the
//! robots gate, per-host politeness, fetching, extraction, word analysis,
//! and the worker pool that runs URLs through the stages concurrently.

pub mod analyze;
pub mod dedup;
pub mod extract;
pub mod fetch;
pub mod normalize;
pub mod pool;
pub mod ratelimit;
pub mod robots;
pub mod worker;

pub use analyze::{WordAnalysis, WordAnalyzer};
pub use dedup::VisitedFilter;
pub use extract::{ContentExtractor, ExtractedPage};
pub use fetch::{FetchedPage, PageFetcher};
pub use normalize::{NormalizeError, UrlNormalizer};
pub use pool::{PoolState, WorkerPool};
pub use ratelimit::RateLimiter;
pub use robots::{RobotRules, RobotsPolicy};
pub use worker::{CrawlTask, Worker, WorkerContext};
