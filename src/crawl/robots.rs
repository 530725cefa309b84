//! robots.txt policy
//!
//! Per-host cache of parsed robots.txt rules. A host's entry is fetched on
//! first access with a short timeout and honored until its TTL lapses. HTTP
//! 4xx means the site has no policy (allow all); a network failure or 5xx
//! means we cannot know the policy, so the host is denied until the entry
//! expires. Crawl-delay directives larger than the configured floor override
//! the rate limiter for that host.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;
use url::Url;

/// How long a successfully fetched policy is trusted.
const RULES_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// How long a failed fetch (deny-all) is remembered.
const FAILURE_TTL: Duration = Duration::from_secs(60 * 60);
/// robots.txt gets a tighter timeout than page fetches.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One parsed rule line.
#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    allow: bool,
}

/// Parsed rules for one host.
#[derive(Debug, Clone)]
pub struct RobotRules {
    rules: Vec<Rule>,
    crawl_delay: Option<Duration>,
    deny_all: bool,
    fetched_at: Instant,
    ttl: Duration,
}

impl RobotRules {
    /// Parse robots.txt content, keeping the most specific user-agent group.
    ///
    /// A group naming our agent replaces any wildcard group seen earlier;
    /// wildcard groups after a specific match are ignored.
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let ua_lower = user_agent.to_lowercase();
        let mut rules = Vec::new();
        let mut crawl_delay = None;
        let mut group_applies = false;
        let mut found_specific = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    let agent = value.to_lowercase();
                    if agent == "*" {
                        group_applies = !found_specific;
                    } else if ua_lower.contains(&agent) {
                        if !found_specific {
                            // Specific group supersedes wildcard rules
                            rules.clear();
                            crawl_delay = None;
                        }
                        group_applies = true;
                        found_specific = true;
                    } else {
                        group_applies = false;
                    }
                }
                "disallow" if group_applies => {
                    if !value.is_empty() {
                        rules.push(Rule {
                            pattern: value.to_string(),
                            allow: false,
                        });
                    }
                }
                "allow" if group_applies => {
                    if !value.is_empty() {
                        rules.push(Rule {
                            pattern: value.to_string(),
                            allow: true,
                        });
                    }
                }
                "crawl-delay" if group_applies => {
                    if let Ok(secs) = value.parse::<f64>() {
                        if secs >= 0.0 {
                            crawl_delay = Some(Duration::from_secs_f64(secs));
                        }
                    }
                }
                _ => {}
            }
        }

        Self {
            rules,
            crawl_delay,
            deny_all: false,
            fetched_at: Instant::now(),
            ttl: RULES_TTL,
        }
    }

    /// No policy available: everything allowed (404 and friends).
    pub fn allow_all() -> Self {
        Self {
            rules: Vec::new(),
            crawl_delay: None,
            deny_all: false,
            fetched_at: Instant::now(),
            ttl: RULES_TTL,
        }
    }

    /// Fetch failed: deny the host until the entry expires.
    pub fn deny_all() -> Self {
        Self {
            rules: Vec::new(),
            crawl_delay: None,
            deny_all: true,
            fetched_at: Instant::now(),
            ttl: FAILURE_TTL,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay
    }

    /// Whether `path` may be fetched. Longest matching pattern wins; on a
    /// tie, allow wins.
    pub fn allows(&self, path: &str) -> bool {
        if self.deny_all {
            return false;
        }

        let mut best_allow = 0usize;
        let mut best_disallow = 0usize;
        for rule in &self.rules {
            if Self::matches(path, &rule.pattern) {
                let len = rule.pattern.len();
                if rule.allow {
                    best_allow = best_allow.max(len);
                } else {
                    best_disallow = best_disallow.max(len);
                }
            }
        }
        best_allow >= best_disallow
    }

    /// robots.txt pattern match: prefix semantics with `*` wildcards and an
    /// optional `$` end anchor.
    fn matches(path: &str, pattern: &str) -> bool {
        let (pattern, anchored) = match pattern.strip_suffix('$') {
            Some(p) => (p, true),
            None => (pattern, false),
        };

        if !pattern.contains('*') {
            return if anchored {
                path == pattern
            } else {
                path.starts_with(pattern)
            };
        }

        let mut pos = 0usize;
        for (i, part) in pattern.split('*').enumerate() {
            if part.is_empty() {
                continue;
            }
            match path[pos..].find(part) {
                Some(found) => {
                    if i == 0 && found != 0 {
                        return false;
                    }
                    pos += found + part.len();
                }
                None => return false,
            }
        }
        !anchored || pos == path.len()
    }
}

/// Per-host robots.txt cache with single-flight fetching.
pub struct RobotsPolicy {
    cache: DashMap<String, Arc<RobotRules>>,
    fetch_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    client: reqwest::Client,
    user_agent: String,
}

impl RobotsPolicy {
    pub fn new(client: reqwest::Client, user_agent: impl Into<String>) -> Self {
        Self {
            cache: DashMap::new(),
            fetch_locks: DashMap::new(),
            client,
            user_agent: user_agent.into(),
        }
    }

    /// Whether `url` may be fetched, fetching this host's robots.txt first
    /// if it is not cached.
    pub async fn allowed(&self, url: &Url) -> bool {
        let rules = self.rules_for(url).await;
        let mut path = url.path().to_string();
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }
        rules.allows(&path)
    }

    /// Crawl-delay for `url`'s host, when its cached policy declares one.
    pub fn crawl_delay(&self, url: &Url) -> Option<Duration> {
        let key = Self::host_key(url)?;
        self.cache.get(&key).and_then(|r| r.crawl_delay())
    }

    async fn rules_for(&self, url: &Url) -> Arc<RobotRules> {
        let Some(key) = Self::host_key(url) else {
            return Arc::new(RobotRules::deny_all());
        };

        if let Some(entry) = self.cache.get(&key) {
            if entry.is_fresh() {
                return Arc::clone(entry.value());
            }
        }

        // One fetch per host; latecomers wait and reuse the cached result.
        let lock = self
            .fetch_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(entry) = self.cache.get(&key) {
            if entry.is_fresh() {
                return Arc::clone(entry.value());
            }
        }

        let rules = Arc::new(self.fetch_rules(&key).await);
        self.cache.insert(key, Arc::clone(&rules));
        rules
    }

    async fn fetch_rules(&self, host_key: &str) -> RobotRules {
        let robots_url = format!("{}/robots.txt", host_key);
        let response = self
            .client
            .get(&robots_url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => {
                    debug!(host = host_key, bytes = body.len(), "parsed robots.txt");
                    RobotRules::parse(&body, &self.user_agent)
                }
                Err(err) => {
                    debug!(host = host_key, error = %err, "robots.txt body read failed");
                    RobotRules::deny_all()
                }
            },
            Ok(resp) if resp.status().is_client_error() => {
                debug!(host = host_key, status = %resp.status(), "no robots.txt, allowing all");
                RobotRules::allow_all()
            }
            Ok(resp) => {
                debug!(host = host_key, status = %resp.status(), "robots.txt server error, denying host");
                RobotRules::deny_all()
            }
            Err(err) => {
                debug!(host = host_key, error = %err, "robots.txt fetch failed, denying host");
                RobotRules::deny_all()
            }
        }
    }

    /// Cache key: scheme://host[:port]
    fn host_key(url: &Url) -> Option<String> {
        let host = url.host_str()?;
        match url.port() {
            Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
            None => Some(format!("{}://{}", url.scheme(), host)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_specific_agent_overrides_wildcard() {
        let content = r#"
User-agent: *
Disallow: /private/
Crawl-delay: 2

User-agent: webcrawler
Disallow: /admin/
Crawl-delay: 1
"#;
        let rules = RobotRules::parse(content, "webcrawler/0.3");
        assert!(rules.allows("/public/page.html"));
        assert!(!rules.allows("/admin/settings"));
        // Specific group replaced the wildcard's /private/ rule
        assert!(rules.allows("/private/doc"));
        assert_eq!(rules.crawl_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_allow_beats_disallow_on_longer_match() {
        let content = r#"
User-agent: *
Disallow: /private/
Allow: /private/public/
"#;
        let rules = RobotRules::parse(content, "anybot");
        assert!(!rules.allows("/private/secret"));
        assert!(rules.allows("/private/public/page"));
    }

    #[test]
    fn test_wildcard_and_anchor_patterns() {
        assert!(RobotRules::matches("/images/cat.jpg", "/images/*.jpg"));
        assert!(!RobotRules::matches("/images/cat.png", "/images/*.jpg"));
        assert!(RobotRules::matches("/page.html", "/page.html$"));
        assert!(!RobotRules::matches("/page.html?q=1", "/page.html$"));
        assert!(RobotRules::matches("/a/b/c", "/a/"));
        assert!(!RobotRules::matches("/b/a/", "/a/"));
    }

    #[test]
    fn test_deny_all_and_allow_all() {
        assert!(!RobotRules::deny_all().allows("/anything"));
        assert!(RobotRules::allow_all().allows("/anything"));
    }

    #[test]
    fn test_comments_and_garbage_ignored() {
        let content = r#"
# a comment
User-agent: * # inline comment
Disallow: /x/
not a directive at all
"#;
        let rules = RobotRules::parse(content, "bot");
        assert!(!rules.allows("/x/y"));
        assert!(rules.allows("/y"));
    }

    #[test]
    fn test_admin_subtree_disallowed() {
        let rules = RobotRules::parse("User-agent: *\nDisallow: /admin/\n", "webcrawler");
        assert!(!rules.allows("/admin/users"));
        assert!(!rules.allows("/admin/"));
        assert!(rules.allows("/adminish"));
        assert!(rules.allows("/"));
    }
}
