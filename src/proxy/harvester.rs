//! Proxy harvester for fetching candidate proxies from public list sources
//!
//! This module provides functionality for:
//! - Fetching proxy lists from several sources independently
//! - Normalizing the source-specific formats into [`ProxyCandidate`]s
//! - Deduplicating by identity and applying an optional country filter

use crate::proxy::models::{ProxyCandidate, ProxyType};
use crate::proxy::parser::{ProxyParser, SourceFormat};
use crate::Result;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Country filter value that disables filtering
pub const ALL_COUNTRIES: &str = "ALL";

/// A public endpoint serving a proxy list
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySource {
    /// Name of the proxy source
    pub name: String,
    /// URL to fetch proxies from
    pub url: String,
    /// Response layout
    #[serde(default)]
    pub format: SourceFormat,
    /// Scheme assigned to entries that do not state one
    #[serde(default)]
    pub proxy_type: ProxyType,
}

impl ProxySource {
    pub fn new(name: &str, url: &str, format: SourceFormat, proxy_type: ProxyType) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            format,
            proxy_type,
        }
    }

    /// Free-proxy-list family of sources
    pub fn defaults() -> Vec<ProxySource> {
        vec![
            ProxySource::new(
                "free-proxy-list.net",
                "https://free-proxy-list.net/",
                SourceFormat::Table,
                ProxyType::Http,
            ),
            ProxySource::new(
                "us-proxy.org",
                "https://www.us-proxy.org/",
                SourceFormat::Table,
                ProxyType::Http,
            ),
            ProxySource::new(
                "sslproxies",
                "https://www.sslproxies.org/",
                SourceFormat::Table,
                ProxyType::Http,
            ),
        ]
    }
}

/// Retrieves the raw body of a proxy source
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &ProxySource) -> Result<String>;
}

/// [`SourceFetcher`] backed by a shared reqwest client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, source: &ProxySource) -> Result<String> {
        let response = self.client.get(&source.url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

/// Outcome of harvesting a single source
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source: String,
    pub found: usize,
    pub error: Option<String>,
}

impl SourceReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a full harvest
#[derive(Debug, Clone, Default)]
pub struct Harvest {
    /// Unique candidates, in first-seen order
    pub candidates: Vec<ProxyCandidate>,
    pub reports: Vec<SourceReport>,
}

/// Fetches and merges candidates from every configured source
pub struct ProxyHarvester<F> {
    fetcher: F,
}

impl<F: SourceFetcher> ProxyHarvester<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    /// Harvest every source and return the deduplicated candidates
    ///
    /// A failing source is logged and skipped. An empty result is a normal
    /// outcome.
    pub async fn harvest(&self, sources: &[ProxySource], country_filter: Option<&str>) -> Vec<ProxyCandidate> {
        self.harvest_with_reports(sources, country_filter)
            .await
            .candidates
    }

    pub async fn harvest_with_reports(
        &self,
        sources: &[ProxySource],
        country_filter: Option<&str>,
    ) -> Harvest {
        let country = normalize_country(country_filter);
        info!(sources = sources.len(), country = ?country, "harvesting proxy candidates");

        let fetched = join_all(sources.iter().map(|source| self.harvest_source(source))).await;

        let mut seen = HashSet::new();
        let mut harvest = Harvest::default();
        for (source, outcome) in sources.iter().zip(fetched) {
            match outcome {
                Ok(candidates) => {
                    let before = harvest.candidates.len();
                    for candidate in candidates {
                        if !passes_country(&candidate, country.as_deref()) {
                            continue;
                        }
                        if seen.insert(candidate.id()) {
                            harvest.candidates.push(candidate);
                        }
                    }
                    let found = harvest.candidates.len() - before;
                    debug!(source = %source.name, found, "source harvested");
                    harvest.reports.push(SourceReport {
                        source: source.name.clone(),
                        found,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(source = %source.name, error = %e, "skipping proxy source");
                    harvest.reports.push(SourceReport {
                        source: source.name.clone(),
                        found: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if harvest.candidates.is_empty() {
            warn!("harvest produced no candidates");
        } else {
            info!(candidates = harvest.candidates.len(), "harvest complete");
        }
        harvest
    }

    async fn harvest_source(&self, source: &ProxySource) -> Result<Vec<ProxyCandidate>> {
        let body = self.fetcher.fetch(source).await?;
        ProxyParser::parse(&body, source.format, source.proxy_type)
    }
}

/// Keep the candidates matching `country_filter`
///
/// Applies the same rule as [`ProxyHarvester::harvest`], for candidates
/// loaded some other way (a saved proxy file, for instance).
pub fn retain_country(candidates: Vec<ProxyCandidate>, country_filter: Option<&str>) -> Vec<ProxyCandidate> {
    let country = normalize_country(country_filter);
    candidates
        .into_iter()
        .filter(|candidate| passes_country(candidate, country.as_deref()))
        .collect()
}

fn normalize_country(filter: Option<&str>) -> Option<String> {
    filter
        .map(str::trim)
        .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case(ALL_COUNTRIES))
        .map(str::to_ascii_uppercase)
}

/// Candidates without country metadata always pass
fn passes_country(candidate: &ProxyCandidate, country: Option<&str>) -> bool {
    match (country, candidate.country.as_deref()) {
        (Some(wanted), Some(actual)) => actual.eq_ignore_ascii_case(wanted),
        _ => true,
    }
}
