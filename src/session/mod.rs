//! Session lifecycle
//!
//! A session owns one crawl run: its identity, configuration, queue, worker
//! pool, counters, and termination. The engine drives the main loop,
//! metrics samples the counters, and recovery keeps the durable queue
//! honest across crashes.

pub mod engine;
pub mod metrics;
pub mod recovery;

pub use engine::{CrawlEngine, CrawlSummary};
pub use metrics::SessionCounters;
pub use recovery::{QueueRecovery, RecoveryReport};
