//! HTML content extraction
//!
//! Turns a response body into plain text, a title, and the set of outbound
//! absolute links. Parsing is lenient: malformed HTML degrades to whatever
//! the parser salvages, never to a failed page.

use std::collections::HashSet;

use scraper::{Html, Selector};
use url::Url;

use crate::config::ContentConfig;

/// Elements whose text content is never page content.
const SKIPPED_CONTAINERS: &[&str] = &["script", "style", "noscript", "template", "head", "iframe"];

/// Extraction output for one page.
#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub text: String,
    /// Raw href targets resolved to absolute http(s) URLs, document order,
    /// de-duplicated
    pub links: Vec<Url>,
}

/// HTML to text/title/links converter.
pub struct ContentExtractor {
    allowed_types: Vec<String>,
    title_selector: Selector,
    link_selector: Selector,
}

impl ContentExtractor {
    pub fn new(config: &ContentConfig) -> Self {
        Self {
            allowed_types: config.allowed_content_types.clone(),
            // Static selectors; parse cannot fail
            title_selector: Selector::parse("title").expect("valid selector"),
            link_selector: Selector::parse("a[href]").expect("valid selector"),
        }
    }

    /// Whether a Content-Type header value is in the allow-list.
    ///
    /// Matches on the media type only, ignoring charset parameters.
    pub fn allows_content_type(&self, content_type: &str) -> bool {
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        self.allowed_types
            .iter()
            .any(|allowed| media_type == allowed.to_lowercase())
    }

    /// Parse `html` and pull out text, title, and links resolved against
    /// `base` (the final URL after redirects).
    pub fn extract(&self, html: &str, base: &Url) -> ExtractedPage {
        let document = Html::parse_document(html);

        let title = document
            .select(&self.title_selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty());

        let text = Self::extract_text(&document);
        let links = self.extract_links(&document, base);

        ExtractedPage { title, text, links }
    }

    /// Collect text nodes, skipping non-content subtrees, collapsing
    /// whitespace to single spaces.
    fn extract_text(document: &Html) -> String {
        let mut out = String::new();

        for node in document.root_element().descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            let skipped = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .is_some_and(|e| SKIPPED_CONTAINERS.contains(&e.name()))
            });
            if skipped {
                continue;
            }
            for word in text.split_whitespace() {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(word);
            }
        }

        out
    }

    fn extract_links(&self, document: &Html, base: &Url) -> Vec<Url> {
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for element in document.select(&self.link_selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            if href.is_empty() || href.starts_with('#') {
                continue;
            }
            let Ok(url) = base.join(href) else { continue };
            if url.scheme() != "http" && url.scheme() != "https" {
                continue;
            }
            if seen.insert(url.as_str().to_string()) {
                links.push(url);
            }
        }

        links
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> ContentExtractor {
        ContentExtractor::new(&ContentConfig::default())
    }

    fn base() -> Url {
        Url::parse("https://example.com/dir/page").unwrap()
    }

    #[test]
    fn test_text_extraction_skips_scripts_and_styles() {
        let html = r#"<html><head><title>T</title><style>body{color:red}</style></head>
            <body><p>visible   text</p><script>var hidden = 1;</script>
            <noscript>also hidden</noscript></body></html>"#;
        let page = extractor().extract(html, &base());
        assert_eq!(page.text, "visible text");
    }

    #[test]
    fn test_title() {
        let html = "<html><head><title>  My Page  </title></head><body>x</body></html>";
        let page = extractor().extract(html, &base());
        assert_eq!(page.title.as_deref(), Some("My Page"));

        let untitled = extractor().extract("<html><body>x</body></html>", &base());
        assert!(untitled.title.is_none());
    }

    #[test]
    fn test_link_resolution_and_dedup() {
        let html = r##"
            <a href="/about">About</a>
            <a href="other">Relative</a>
            <a href="https://elsewhere.org/x">Ext</a>
            <a href="/about">Dup</a>
            <a href="#top">Anchor</a>
            <a href="javascript:void(0)">JS</a>
        "##;
        let page = extractor().extract(html, &base());
        let urls: Vec<&str> = page.links.iter().map(|u| u.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/about",
                "https://example.com/dir/other",
                "https://elsewhere.org/x",
            ]
        );
    }

    #[test]
    fn test_malformed_html_degrades() {
        let html = "<p>unclosed <div><span>nested mess";
        let page = extractor().extract(html, &base());
        assert!(page.text.contains("unclosed"));
        assert!(page.text.contains("nested mess"));
    }

    #[test]
    fn test_content_type_allow_list() {
        let e = extractor();
        assert!(e.allows_content_type("text/html"));
        assert!(e.allows_content_type("text/html; charset=utf-8"));
        assert!(e.allows_content_type("Application/XHTML+XML"));
        assert!(!e.allows_content_type("application/pdf"));
        assert!(!e.allows_content_type("image/png"));
        assert!(!e.allows_content_type(""));
    }

    #[test]
    fn test_whitespace_collapsed() {
        let html = "<body><p>a\n\n  b</p>\t<p>c</p></body>";
        let page = extractor().extract(html, &base());
        assert_eq!(page.text, "a b c");
    }
}
