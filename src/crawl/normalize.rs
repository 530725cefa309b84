//! URL canonicalization and validation
//!
//! The normalized form is the sole identity of a URL everywhere in the
//! system: deduplication, queue keys, and storage all use it. Normalization
//! must therefore be idempotent, and everything that enqueues a URL must go
//! through it.

use std::collections::HashSet;
use std::net::IpAddr;

use thiserror::Error;
use url::{Host, Url};

/// Tracking/session query parameters stripped during normalization.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "sid",
    "sessionid",
    "phpsessid",
];

/// File extensions that never yield crawlable HTML.
const BLOCKED_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".zip", ".rar", ".tar", ".gz",
    ".7z", ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".svg", ".webp", ".ico", ".mp3", ".mp4",
    ".avi", ".mov", ".wmv", ".exe", ".msi", ".dmg", ".deb", ".rpm", ".css", ".js",
];

/// Why a URL was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("unparseable URL: {0}")]
    Parse(String),
    #[error("unsupported scheme: {0}")]
    Scheme(String),
    #[error("URL has no host")]
    EmptyHost,
    #[error("host is in a denied address range: {0}")]
    DeniedHost(String),
    #[error("URL exceeds {0} characters")]
    TooLong(usize),
    #[error("non-content file extension")]
    BlockedExtension,
}

/// Canonicalizes URLs and enforces the validity rules.
#[derive(Debug, Clone)]
pub struct UrlNormalizer {
    strip_params: HashSet<String>,
    max_length: usize,
    allow_private_hosts: bool,
}

impl Default for UrlNormalizer {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl UrlNormalizer {
    /// Build a normalizer; `extra_strip_params` extends the built-in
    /// tracking-parameter list.
    pub fn new(extra_strip_params: &[String]) -> Self {
        let mut strip_params: HashSet<String> =
            TRACKING_PARAMS.iter().map(|p| p.to_string()).collect();
        strip_params.extend(extra_strip_params.iter().map(|p| p.to_lowercase()));
        Self {
            strip_params,
            max_length: 2000,
            allow_private_hosts: false,
        }
    }

    /// Allow loopback and private-range hosts. Tests crawl 127.0.0.1.
    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    /// Canonicalize `raw`, resolving it against `base` when relative.
    ///
    /// The `url` crate already lowercases scheme and host, strips default
    /// ports, and percent-encodes the path consistently; on top of that we
    /// drop fragments, strip tracking parameters, sort the query, and trim
    /// trailing slashes on non-root paths.
    pub fn normalize(&self, raw: &str, base: Option<&Url>) -> Result<Url, NormalizeError> {
        let raw = raw.trim();
        let mut url = match base {
            Some(base) => base
                .join(raw)
                .map_err(|e| NormalizeError::Parse(e.to_string()))?,
            None => Url::parse(raw).map_err(|e| NormalizeError::Parse(e.to_string()))?,
        };

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(NormalizeError::Scheme(url.scheme().to_string()));
        }

        match url.host() {
            None => return Err(NormalizeError::EmptyHost),
            Some(Host::Domain(d)) if d.is_empty() => return Err(NormalizeError::EmptyHost),
            Some(Host::Ipv4(addr)) if !self.allow_private_hosts => {
                if Self::is_denied_ip(IpAddr::V4(addr)) {
                    return Err(NormalizeError::DeniedHost(addr.to_string()));
                }
            }
            Some(Host::Ipv6(addr)) if !self.allow_private_hosts => {
                if Self::is_denied_ip(IpAddr::V6(addr)) {
                    return Err(NormalizeError::DeniedHost(addr.to_string()));
                }
            }
            Some(_) => {}
        }

        url.set_fragment(None);

        // Trailing slash on non-root paths is an aliasing source
        let path = url.path().to_string();
        if path.len() > 1 && path.ends_with('/') {
            url.set_path(path.trim_end_matches('/'));
        }

        let path_lower = url.path().to_lowercase();
        if BLOCKED_EXTENSIONS.iter().any(|ext| path_lower.ends_with(ext)) {
            return Err(NormalizeError::BlockedExtension);
        }

        self.canonicalize_query(&mut url);

        if url.as_str().len() > self.max_length {
            return Err(NormalizeError::TooLong(self.max_length));
        }

        Ok(url)
    }

    /// Drop tracking parameters and sort what remains.
    fn canonicalize_query(&self, url: &mut Url) {
        let Some(query) = url.query().map(str::to_owned) else {
            return;
        };

        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !self.strip_params.contains(&k.to_lowercase()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if params.is_empty() {
            url.set_query(None);
            return;
        }

        // Only rebuild if something actually changes; serializer output is
        // stable for already-sorted queries, keeping normalization idempotent.
        params.sort();
        let rebuilt = params
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    urlencoded(k)
                } else {
                    format!("{}={}", urlencoded(k), urlencoded(v))
                }
            })
            .collect::<Vec<_>>()
            .join("&");

        if rebuilt != query {
            url.set_query(Some(&rebuilt));
        }
    }

    fn is_denied_ip(addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_unspecified()
                    || v4.is_broadcast()
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        }
    }
}

/// Minimal percent-encoding for rebuilt query components.
fn urlencoded(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> String {
        UrlNormalizer::default()
            .normalize(raw, None)
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_fragment_stripped() {
        assert_eq!(norm("https://example.com/page#section"), "https://example.com/page");
    }

    #[test]
    fn test_default_port_stripped() {
        assert_eq!(norm("http://example.com:80/a"), "http://example.com/a");
        assert_eq!(norm("https://example.com:443/a"), "https://example.com/a");
    }

    #[test]
    fn test_host_lowercased() {
        assert_eq!(norm("https://EXAMPLE.com/Path"), "https://example.com/Path");
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        assert_eq!(norm("https://example.com/a/b/"), "https://example.com/a/b");
        // Root path keeps its slash
        assert_eq!(norm("https://example.com/"), "https://example.com/");
    }

    #[test]
    fn test_tracking_params_dropped_and_sorted() {
        assert_eq!(
            norm("https://example.com/p?utm_source=x&b=2&a=1"),
            "https://example.com/p?a=1&b=2"
        );
        assert_eq!(norm("https://example.com/p?utm_campaign=x"), "https://example.com/p");
    }

    #[test]
    fn test_idempotent() {
        let n = UrlNormalizer::default();
        for raw in [
            "https://Example.com:443/a/b/?z=1&a=2&utm_source=t#frag",
            "http://example.com/search?q=hello+world",
            "https://example.com/",
        ] {
            let once = n.normalize(raw, None).unwrap();
            let twice = n.normalize(once.as_str(), None).unwrap();
            assert_eq!(once, twice, "not idempotent for {}", raw);
        }
    }

    #[test]
    fn test_relative_resolution() {
        let base = Url::parse("https://example.com/dir/page").unwrap();
        let n = UrlNormalizer::default();
        assert_eq!(
            n.normalize("../other", Some(&base)).unwrap().as_str(),
            "https://example.com/other"
        );
        assert_eq!(
            n.normalize("/abs", Some(&base)).unwrap().as_str(),
            "https://example.com/abs"
        );
    }

    #[test]
    fn test_rejects_bad_schemes() {
        let n = UrlNormalizer::default();
        assert!(matches!(
            n.normalize("ftp://example.com/file", None),
            Err(NormalizeError::Scheme(_))
        ));
        assert!(matches!(
            n.normalize("mailto:me@example.com", None),
            Err(NormalizeError::Scheme(_)) | Err(NormalizeError::EmptyHost)
        ));
    }

    #[test]
    fn test_rejects_denied_hosts() {
        let n = UrlNormalizer::default();
        assert!(matches!(
            n.normalize("http://127.0.0.1/admin", None),
            Err(NormalizeError::DeniedHost(_))
        ));
        assert!(matches!(
            n.normalize("http://192.168.1.1/", None),
            Err(NormalizeError::DeniedHost(_))
        ));
        // Explicitly allowed for test harnesses
        assert!(UrlNormalizer::default()
            .allow_private_hosts()
            .normalize("http://127.0.0.1/admin", None)
            .is_ok());
    }

    #[test]
    fn test_rejects_blocked_extensions() {
        let n = UrlNormalizer::default();
        assert!(matches!(
            n.normalize("https://example.com/manual.PDF", None),
            Err(NormalizeError::BlockedExtension)
        ));
        assert!(n.normalize("https://example.com/manual.html", None).is_ok());
    }

    #[test]
    fn test_rejects_overlong() {
        let n = UrlNormalizer::default();
        let long = format!("https://example.com/{}", "a".repeat(3000));
        assert!(matches!(n.normalize(&long, None), Err(NormalizeError::TooLong(_))));
    }
}
