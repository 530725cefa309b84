//! Shared result and metric records

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PageError;

/// Session identifier. One crawl run owns exactly one.
pub type SessionId = Uuid;

/// Terminal (or running) state of a crawl session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Per-stage timing breakdown for one URL.
///
/// The persist stage is stamped by the session after the store transaction
/// commits; the rest are measured by the worker.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub fetch: Duration,
    pub extract: Duration,
    pub analyze: Duration,
    pub persist: Duration,
    pub total: Duration,
}

impl StageTimings {
    pub fn fetch_ms(&self) -> f64 {
        self.fetch.as_secs_f64() * 1000.0
    }

    pub fn extract_ms(&self) -> f64 {
        self.extract.as_secs_f64() * 1000.0
    }

    pub fn analyze_ms(&self) -> f64 {
        self.analyze.as_secs_f64() * 1000.0
    }

    pub fn persist_ms(&self) -> f64 {
        self.persist.as_secs_f64() * 1000.0
    }

    pub fn total_ms(&self) -> f64 {
        self.total.as_secs_f64() * 1000.0
    }
}

/// A link discovered on a page, already normalized and filtered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredLink {
    pub url: String,
    pub kind: LinkKind,
}

/// Whether a link points at the same host as its source page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Internal,
    External,
}

impl LinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
        }
    }
}

/// What a worker emits for every URL it processes, success or not.
///
/// On failure `error` is set and the content fields are empty; the session
/// decides retry/fail/skip from the error kind and the attempt count.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub url: String,
    pub final_url: String,
    pub parent_url: Option<String>,
    pub depth: u32,
    /// Priority this URL was leased with; discovered links inherit one less
    pub priority: i32,
    pub attempts: u32,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    pub body_bytes: u64,
    pub title: Option<String>,
    pub text_len: u64,
    pub total_words: u64,
    pub unique_words: u64,
    pub word_frequencies: HashMap<String, u64>,
    pub links: Vec<DiscoveredLink>,
    pub timings: StageTimings,
    pub error: Option<PageError>,
}

impl PageResult {
    /// An empty result carrying only an error, for URLs that never produced
    /// content.
    pub fn failed(
        url: String,
        parent_url: Option<String>,
        depth: u32,
        priority: i32,
        attempts: u32,
        error: PageError,
        timings: StageTimings,
    ) -> Self {
        Self {
            final_url: url.clone(),
            url,
            parent_url,
            depth,
            priority,
            attempts,
            http_status: error.http_status,
            content_type: None,
            body_bytes: 0,
            title: None,
            text_len: 0,
            total_words: 0,
            unique_words: 0,
            word_frequencies: HashMap::new(),
            links: Vec::new(),
            timings,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Periodic snapshot of session throughput, appended to the metrics
/// timeseries. Readers may see counters slightly behind persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub recorded_at: DateTime<Utc>,
    pub pages_crawled: u64,
    pub bytes_processed: u64,
    pub errors: u64,
    pub pages_per_sec: f64,
    pub bytes_per_sec: f64,
    pub in_flight: u64,
    pub queue_pending: u64,
}
