//! HTTP-backed browser driver and pattern-based listing parser
//!
//! The driver fetches result pages with reqwest through the assigned proxy,
//! paginates to emulate scrolling, and cuts listing fragments out of each
//! page with a configurable regex whose named groups feed [`PatternParser`].

use crate::error::{BrowserError, ParseError};
use crate::proxy::models::{ProxyType, ValidatedProxy};
use crate::session::collaborators::{
    BlockSignal, BrowserDriver, BrowserFactory, Identity, ItemRef, ListingParser, ListingRecord,
    PageHandle,
};
use async_trait::async_trait;
use chrono::Local;
use rand::Rng;
use regex::Regex;
use reqwest::{Client, Proxy as ReqwestProxy, StatusCode};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default listing pattern: result anchors carrying the place name
pub const DEFAULT_ITEM_PATTERN: &str = r#"(?s)<a[^>]*aria-label="(?P<name>[^"]+)"[^>]*href="(?P<website>[^"]*/place/[^"]*)""#;

const CAPTCHA_MARKERS: &[&str] = &["captcha", "recaptcha", "g-recaptcha"];
const UNUSUAL_TRAFFIC_MARKERS: &[&str] = &[
    "unusual traffic",
    "suspicious activity",
    "temporarily blocked",
    "access denied",
    "too many requests",
];

/// Settings for [`HttpBrowser`]
#[derive(Debug, Clone)]
pub struct HttpBrowserConfig {
    pub timeout: Duration,
    /// Regex with named groups matching `ListingRecord` fields
    pub item_pattern: String,
    /// Query parameter carrying the result offset on pagination
    pub page_param: String,
}

impl Default for HttpBrowserConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            item_pattern: DEFAULT_ITEM_PATTERN.to_string(),
            page_param: "start".to_string(),
        }
    }
}

struct PageState {
    url: String,
    client: Client,
    body: String,
    items: Vec<HashMap<String, String>>,
    seen: HashSet<String>,
    pacing: Option<(Duration, Duration)>,
    first_scroll: bool,
}

/// [`BrowserDriver`] issuing plain HTTP requests
pub struct HttpBrowser {
    config: HttpBrowserConfig,
    item_regex: Arc<Regex>,
}

impl HttpBrowser {
    pub fn new(config: HttpBrowserConfig) -> crate::Result<Self> {
        let item_regex = Arc::new(Regex::new(&config.item_pattern)?);
        Ok(Self { config, item_regex })
    }

    fn client_for(&self, proxy: Option<&ValidatedProxy>, identity: &Identity) -> Result<Client, BrowserError> {
        let mut builder = Client::builder()
            .timeout(self.config.timeout)
            .user_agent(&identity.user_agent);
        if let Some(proxy) = proxy {
            let url = match proxy.candidate.scheme {
                ProxyType::Socks5 => proxy.url().replacen("socks5://", "socks5h://", 1),
                ProxyType::Http | ProxyType::Https => proxy.url(),
            };
            builder = builder.proxy(ReqwestProxy::all(url)?);
        }
        Ok(builder.build()?)
    }

    async fn fetch(client: &Client, url: &str) -> Result<String, BrowserError> {
        let response = client.get(url).send().await?;
        let status = response.status();
        if matches!(
            status,
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
        ) {
            return Err(BrowserError::Blocked(BlockSignal::HttpStatus(status.as_u16())));
        }
        if !status.is_success() {
            return Err(BrowserError::Navigation(format!("HTTP status: {status}")));
        }
        Ok(response.text().await?)
    }

    /// Append newly seen fragments of `body`, returning how many were new
    fn collect_items(&self, state: &mut PageState, body: &str) -> usize {
        let names: Vec<&str> = self.item_regex.capture_names().flatten().collect();
        let mut added = 0;
        for caps in self.item_regex.captures_iter(body) {
            let key = caps[0].to_string();
            if !state.seen.insert(key) {
                continue;
            }
            let fields = names
                .iter()
                .filter_map(|name| {
                    caps.name(name)
                        .map(|m| (name.to_string(), m.as_str().trim().to_string()))
                })
                .collect();
            state.items.push(fields);
            added += 1;
        }
        added
    }

    fn page_url(&self, state: &PageState) -> String {
        let separator = if state.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}={}",
            state.url,
            separator,
            self.config.page_param,
            state.items.len()
        )
    }
}

fn page_state(page: &mut PageHandle) -> Result<&mut PageState, BrowserError> {
    page.downcast_mut::<PageState>()
        .ok_or_else(|| BrowserError::Scroll("page was not created by this driver".to_string()))
}

#[async_trait]
impl BrowserDriver for HttpBrowser {
    async fn navigate(
        &mut self,
        url: &str,
        proxy: Option<&ValidatedProxy>,
        identity: &Identity,
    ) -> Result<PageHandle, BrowserError> {
        let client = self.client_for(proxy, identity)?;
        let body = Self::fetch(&client, url).await?;
        debug!(url, bytes = body.len(), "page loaded");

        Ok(PageHandle::new(PageState {
            url: url.to_string(),
            client,
            body,
            items: Vec::new(),
            seen: HashSet::new(),
            pacing: identity.pacing.map(|p| (p.min, p.max)),
            first_scroll: true,
        }))
    }

    async fn scroll(&mut self, page: &mut PageHandle) -> Result<usize, BrowserError> {
        let state = page_state(page)?;

        if state.first_scroll {
            state.first_scroll = false;
            let body = std::mem::take(&mut state.body);
            let added = self.collect_items(state, &body);
            state.body = body;
            return Ok(added);
        }

        if let Some((min, max)) = state.pacing {
            let pause = if max > min {
                rand::rng().random_range(min..=max)
            } else {
                min
            };
            tokio::time::sleep(pause).await;
        }

        let url = self.page_url(state);
        let body = Self::fetch(&state.client, &url).await?;
        let added = self.collect_items(state, &body);
        state.body = body;
        Ok(added)
    }

    async fn detect_block(&mut self, page: &PageHandle) -> Result<Option<BlockSignal>, BrowserError> {
        let Some(state) = page.downcast_ref::<PageState>() else {
            return Ok(None);
        };
        Ok(detect_markers(&state.body))
    }

    async fn switch_proxy(
        &mut self,
        page: &mut PageHandle,
        proxy: Option<&ValidatedProxy>,
        identity: &Identity,
    ) -> Result<(), BrowserError> {
        let client = self.client_for(proxy, identity)?;
        let state = page_state(page)?;
        state.client = client;
        state.pacing = identity.pacing.map(|p| (p.min, p.max));
        Ok(())
    }
}

/// Scan a page body for block indicators
pub fn detect_markers(body: &str) -> Option<BlockSignal> {
    let lower = body.to_ascii_lowercase();
    if UNUSUAL_TRAFFIC_MARKERS.iter().any(|m| lower.contains(m)) {
        Some(BlockSignal::UnusualTraffic)
    } else if CAPTCHA_MARKERS.iter().any(|m| lower.contains(m)) {
        Some(BlockSignal::Captcha)
    } else {
        None
    }
}

/// Creates one [`HttpBrowser`] per worker
#[derive(Debug, Clone, Default)]
pub struct HttpBrowserFactory {
    pub config: HttpBrowserConfig,
}

impl BrowserFactory for HttpBrowserFactory {
    type Driver = HttpBrowser;

    fn create(&self) -> crate::Result<HttpBrowser> {
        HttpBrowser::new(self.config.clone())
    }
}

/// Builds records from the named groups captured by [`HttpBrowser`]
#[derive(Debug, Clone, Default)]
pub struct PatternParser;

#[async_trait]
impl ListingParser for PatternParser {
    async fn parse(&self, page: &PageHandle, item: ItemRef) -> Result<ListingRecord, ParseError> {
        let state = page
            .downcast_ref::<PageState>()
            .ok_or_else(|| ParseError::new(item.0, "unsupported page"))?;
        let fields = state
            .items
            .get(item.0)
            .ok_or_else(|| ParseError::new(item.0, "no such listing"))?;

        let field = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let name = field("name");
        if name.is_empty() {
            return Err(ParseError::new(item.0, "listing has no name"));
        }

        Ok(ListingRecord {
            name,
            category: field("category"),
            address: field("address"),
            website: field("website"),
            phone: field("phone"),
            hours: field("hours"),
            extracted_at: Local::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(body: &str) -> PageState {
        PageState {
            url: "https://maps.example.com/search/pizza".to_string(),
            client: Client::new(),
            body: body.to_string(),
            items: Vec::new(),
            seen: HashSet::new(),
            pacing: None,
            first_scroll: true,
        }
    }

    #[test]
    fn test_detect_markers() {
        assert_eq!(
            detect_markers("<h1>Our systems have detected unusual traffic</h1>"),
            Some(BlockSignal::UnusualTraffic)
        );
        assert_eq!(
            detect_markers(r#"<div class="g-recaptcha"></div>"#),
            Some(BlockSignal::Captcha)
        );
        assert_eq!(detect_markers("<html>results</html>"), None);
    }

    #[test]
    fn test_collect_items_deduplicates() {
        let browser = HttpBrowser::new(HttpBrowserConfig::default()).unwrap();
        let body = r#"
<a class="hfpxzc" aria-label="Luigi's" href="https://maps.example.com/place/luigis"></a>
<a class="hfpxzc" aria-label="Mario's" href="https://maps.example.com/place/marios"></a>
<a class="hfpxzc" aria-label="Luigi's" href="https://maps.example.com/place/luigis"></a>"#;
        let mut state = state_with(body);
        assert_eq!(browser.collect_items(&mut state, body), 2);
        assert_eq!(browser.collect_items(&mut state, body), 0);
        assert_eq!(state.items[1]["name"], "Mario's");
        assert_eq!(browser.page_url(&state), "https://maps.example.com/search/pizza?start=2");
    }

    #[tokio::test]
    async fn test_first_scroll_counts_loaded_page() {
        let mut browser = HttpBrowser::new(HttpBrowserConfig::default()).unwrap();
        let body = r#"<a aria-label="Cafe" href="/place/cafe">"#;
        let mut page = PageHandle::new(state_with(body));
        assert_eq!(browser.scroll(&mut page).await.unwrap(), 1);
        assert_eq!(browser.detect_block(&page).await.unwrap(), None);

        let record = PatternParser.parse(&page, ItemRef(0)).await.unwrap();
        assert_eq!(record.name, "Cafe");
        assert_eq!(record.website, "/place/cafe");
        assert!(PatternParser.parse(&page, ItemRef(5)).await.is_err());
    }

    #[test]
    fn test_invalid_item_pattern_rejected() {
        let config = HttpBrowserConfig {
            item_pattern: "(unclosed".to_string(),
            ..HttpBrowserConfig::default()
        };
        assert!(HttpBrowser::new(config).is_err());
    }
}
