//! Error taxonomy for the crawl pipeline
//!
//! Every failure a worker can hit maps to a [`CrawlErrorKind`]. Workers never
//! propagate errors across the result channel as `Err` values; they fold them
//! into the page result so that one bad URL cannot take a worker down. The
//! kind decides whether the URL is retried, failed, or skipped.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a per-URL failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrawlErrorKind {
    /// URL failed validation or normalization
    InvalidUrl,
    /// robots.txt disallows this path for our user agent
    DisallowedByRobots,
    /// Response content type not in the allow-list
    DisallowedContentType,
    /// Response body exceeded the configured size cap
    BodyTooLarge,
    /// HTTP 4xx other than 408/429
    HttpClientError,
    /// HTTP 5xx
    HttpServerError,
    /// Request or read timed out
    NetworkTimeout,
    /// Connection reset or closed mid-transfer
    NetworkReset,
    /// Name resolution failed
    DnsFailure,
    /// HTML could not be parsed; page persists with empty content
    ParseError,
    /// Database write failed past the store's own retry budget
    PersistenceError,
    /// The crawl was cancelled while this URL was in flight
    Cancelled,
}

impl CrawlErrorKind {
    /// Stable string form used in `last_error` and `error_events` rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "INVALID_URL",
            Self::DisallowedByRobots => "DISALLOWED_BY_ROBOTS",
            Self::DisallowedContentType => "DISALLOWED_CONTENT_TYPE",
            Self::BodyTooLarge => "BODY_TOO_LARGE",
            Self::HttpClientError => "HTTP_CLIENT_ERROR",
            Self::HttpServerError => "HTTP_SERVER_ERROR",
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::NetworkReset => "NETWORK_RESET",
            Self::DnsFailure => "DNS_FAILURE",
            Self::ParseError => "PARSE_ERROR",
            Self::PersistenceError => "PERSISTENCE_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether the URL should end as SKIPPED rather than FAILED.
    ///
    /// Skips are policy decisions (robots, content type, size), not faults.
    pub fn is_skip(self) -> bool {
        matches!(
            self,
            Self::DisallowedByRobots | Self::DisallowedContentType | Self::BodyTooLarge
        )
    }
}

/// The error attached to a failed page result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageError {
    pub kind: CrawlErrorKind,
    pub message: String,
    /// HTTP status, when the failure came from a response
    pub http_status: Option<u16>,
}

impl PageError {
    pub fn new(kind: CrawlErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
        }
    }

    pub fn with_status(kind: CrawlErrorKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: Some(status),
        }
    }

    /// Whether a retry of this URL may succeed.
    ///
    /// 408 and 429 are the only client errors worth retrying; server errors
    /// and transport failures always are.
    pub fn retryable(&self) -> bool {
        match self.kind {
            CrawlErrorKind::HttpClientError => {
                matches!(self.http_status, Some(408) | Some(429))
            }
            CrawlErrorKind::HttpServerError
            | CrawlErrorKind::NetworkTimeout
            | CrawlErrorKind::NetworkReset
            | CrawlErrorKind::DnsFailure
            | CrawlErrorKind::PersistenceError => true,
            _ => false,
        }
    }

    /// Classify a transport-level reqwest error.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            CrawlErrorKind::NetworkTimeout
        } else if err.is_connect() {
            // reqwest does not distinguish resolution from connection refusal;
            // treat "could not reach the host at all" as DNS-level failure and
            // everything after a connection as a reset.
            CrawlErrorKind::DnsFailure
        } else {
            CrawlErrorKind::NetworkReset
        };
        Self::new(kind, err.to_string())
    }

    /// Classify a non-2xx HTTP status.
    pub fn from_status(status: u16) -> Self {
        let kind = if status >= 500 {
            CrawlErrorKind::HttpServerError
        } else {
            CrawlErrorKind::HttpClientError
        };
        Self::with_status(kind, status, format!("HTTP {}", status))
    }
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Errors from the queue layer.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("unknown URL in queue operation: {0}")]
    UnknownUrl(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database unavailable after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        source: sqlx::Error,
    },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// Persistence failures past the retry budget are fatal to the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
