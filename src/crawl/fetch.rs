//! HTTP fetching
//!
//! Thin wrapper around a shared `reqwest` client: one connection pool for the
//! whole session, per-request timeouts, bounded redirects, and a hard body
//! size cap enforced while streaming so an oversized response is abandoned
//! early instead of buffered.

use std::time::{Duration, Instant};

use url::Url;

use crate::config::CrawlerConfig;
use crate::error::{CrawlErrorKind, PageError};

/// A successfully fetched page body.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after redirects
    pub final_url: Url,
    pub status: u16,
    pub content_type: String,
    pub body: String,
    pub body_bytes: u64,
    pub elapsed: Duration,
}

/// Shared page fetcher.
pub struct PageFetcher {
    client: reqwest::Client,
    max_body: usize,
}

impl PageFetcher {
    /// Build the shared client from the crawler config.
    pub fn new(config: &CrawlerConfig, max_body: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .pool_max_idle_per_host(config.max_connections_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .gzip(true)
            .deflate(true)
            .build()?;

        Ok(Self {
            client,
            max_body,
        })
    }

    /// A clone of the underlying client, for collaborators (robots fetches)
    /// that should share the connection pool.
    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// GET `url`. Non-2xx statuses and transport failures come back as
    /// classified [`PageError`]s.
    pub async fn fetch(&self, url: &Url) -> Result<FetchedPage, PageError> {
        let started = Instant::now();

        let mut response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| PageError::from_reqwest(&e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(PageError::from_status(status));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_string();

        if let Some(declared) = response.content_length() {
            if declared as usize > self.max_body {
                return Err(PageError::new(
                    CrawlErrorKind::BodyTooLarge,
                    format!("declared {} bytes, cap {}", declared, self.max_body),
                ));
            }
        }

        let mut buf: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if buf.len() + chunk.len() > self.max_body {
                        return Err(PageError::new(
                            CrawlErrorKind::BodyTooLarge,
                            format!("body exceeds {} byte cap", self.max_body),
                        ));
                    }
                    buf.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => return Err(PageError::from_reqwest(&e)),
            }
        }

        let body_bytes = buf.len() as u64;
        let body = String::from_utf8_lossy(&buf).into_owned();

        Ok(FetchedPage {
            final_url,
            status,
            content_type,
            body,
            body_bytes,
            elapsed: started.elapsed(),
        })
    }
}
