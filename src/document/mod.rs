//! HTML documents handed to rule handlers
//!
//! Page bodies are parsed with `scraper` before dispatch so handlers can query
//! them with CSS selectors. The helpers here cover the common crawl needs:
//! - Links to follow (`a[href]`)
//! - Images to download (`img[src]`)
//! - Page title

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

/// Errors raised while querying a document
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Invalid CSS selector '{selector}': {message}")]
    Selector { selector: String, message: String },
}

/// Turns a raw page body into a queryable document
pub trait DocumentParser: Send + Sync {
    /// Parses `body`, fetched from `url`
    fn parse(&self, url: &str, body: &str) -> Document;
}

/// Default parser backed by `scraper`
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlParser;

impl DocumentParser for HtmlParser {
    fn parse(&self, url: &str, body: &str) -> Document {
        Document::parse(url, body)
    }
}

/// A parsed HTML page
pub struct Document {
    url: Option<Url>,
    html: Html,
}

impl Document {
    /// Parses `body`; relative links are resolved against `url` when it parses
    pub fn parse(url: &str, body: &str) -> Self {
        Self {
            url: Url::parse(url).ok(),
            html: Html::parse_document(body),
        }
    }

    /// The underlying `scraper` document
    pub fn html(&self) -> &Html {
        &self.html
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Extracts the page title from the `<title>` element
    pub fn title(&self) -> Option<String> {
        let title_selector = Selector::parse("title").ok()?;

        self.html
            .select(&title_selector)
            .next()
            .map(|element| element.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Trimmed text of every element matching `css`
    pub fn select_text(&self, css: &str) -> Result<Vec<String>, DocumentError> {
        let selector = parse_selector(css)?;
        Ok(self
            .html
            .select(&selector)
            .map(|element| element.text().collect::<String>().trim().to_string())
            .collect())
    }

    /// Every followable link on the page
    pub fn links(&self) -> Vec<String> {
        self.collect_attr(self.html.root_element(), "a[href]", "href")
    }

    /// Every image source on the page
    pub fn images(&self) -> Vec<String> {
        self.collect_attr(self.html.root_element(), "img[src]", "src")
    }

    /// Links inside the elements matching `css`
    pub fn links_within(&self, css: &str) -> Result<Vec<String>, DocumentError> {
        self.collect_within(css, "a[href]", "href")
    }

    /// Image sources inside the elements matching `css`
    pub fn images_within(&self, css: &str) -> Result<Vec<String>, DocumentError> {
        self.collect_within(css, "img[src]", "src")
    }

    fn collect_within(
        &self,
        css: &str,
        inner: &str,
        attr: &str,
    ) -> Result<Vec<String>, DocumentError> {
        let scope = parse_selector(css)?;
        let mut found = Vec::new();
        for container in self.html.select(&scope) {
            found.extend(self.collect_attr(container, inner, attr));
        }
        Ok(found)
    }

    fn collect_attr(&self, scope: ElementRef<'_>, css: &str, attr: &str) -> Vec<String> {
        let Ok(selector) = Selector::parse(css) else {
            return Vec::new();
        };

        scope
            .select(&selector)
            .filter(|element| element.value().attr("download").is_none())
            .filter_map(|element| element.value().attr(attr))
            .filter_map(|value| resolve_link(value, self.url.as_ref()))
            .collect()
    }
}

fn parse_selector(css: &str) -> Result<Selector, DocumentError> {
    Selector::parse(css).map_err(|e| DocumentError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// Resolves a link against the page URL and validates it
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel: schemes
/// - data: URIs
/// - Fragment-only anchors
/// - Non-HTTP(S) URLs after resolution
///
/// Without a base URL the link is returned as written.
fn resolve_link(href: &str, base_url: Option<&Url>) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    let Some(base_url) = base_url else {
        return Some(href.to_string());
    };

    match base_url.join(href) {
        Ok(absolute_url) => {
            if absolute_url.scheme() == "http" || absolute_url.scheme() == "https" {
                Some(absolute_url.to_string())
            } else {
                None
            }
        }
        Err(_) => None,
    }
}
