//! Proxy validator for probing candidates and classifying their anonymity

use crate::error::{ConfigError, ProbeError};
use crate::proxy::geo::GeoLocator;
use crate::proxy::models::{AnonymityFilter, AnonymityLevel, ProxyCandidate, ProxyType, ValidatedProxy};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Proxy as ReqwestProxy};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default timeout for proxy probes in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default number of concurrent probes
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Default endpoint; it echoes the origin IP and the request headers
pub const DEFAULT_TEST_URL: &str = "http://httpbin.org/get";

/// Request headers that reveal a proxy sits in between
const FORWARDING_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "forwarded",
    "via",
    "client-ip",
    "x-client-ip",
    "x-proxy-id",
    "proxy-connection",
];

/// What the test endpoint saw for one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeObservation {
    /// Originating IP(s) reported by the endpoint
    pub origin: String,
    /// Request headers as received, keyed by lowercase name
    pub headers: HashMap<String, String>,
}

impl ProbeObservation {
    /// Parse an httpbin-style JSON echo, or a bare IP body such as icanhazip's
    pub fn from_body(body: &str) -> Result<Self, ProbeError> {
        #[derive(Deserialize)]
        struct Echo {
            origin: Option<String>,
            ip: Option<String>,
            #[serde(default)]
            headers: HashMap<String, String>,
        }

        let trimmed = body.trim();
        if trimmed.starts_with('{') {
            let echo: Echo =
                serde_json::from_str(trimmed).map_err(|e| ProbeError::Malformed(e.to_string()))?;
            let origin = echo
                .origin
                .or(echo.ip)
                .ok_or_else(|| ProbeError::Malformed("no origin field".to_string()))?;
            let headers = echo
                .headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect();
            return Ok(Self { origin, headers });
        }

        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
            return Err(ProbeError::Malformed("expected an IP address".to_string()));
        }
        Ok(Self {
            origin: trimmed.to_string(),
            headers: HashMap::new(),
        })
    }

    fn has_forwarding_headers(&self) -> bool {
        FORWARDING_HEADERS
            .iter()
            .any(|name| self.headers.contains_key(*name))
    }

    fn reveals(&self, real_ip: &str) -> bool {
        let leaks = |value: &str| value.split(',').any(|part| part.trim() == real_ip);
        leaks(&self.origin)
            || FORWARDING_HEADERS
                .iter()
                .filter_map(|name| self.headers.get(*name))
                .any(|value| leaks(value))
    }
}

/// Classify a probe observation against the client's real IP
///
/// Without a known real IP only header leakage can be judged, so the result
/// is never `Transparent`.
pub fn classify(observation: &ProbeObservation, real_ip: Option<&str>) -> AnonymityLevel {
    if real_ip.is_some_and(|ip| observation.reveals(ip)) {
        AnonymityLevel::Transparent
    } else if observation.has_forwarding_headers() {
        AnonymityLevel::Anonymous
    } else {
        AnonymityLevel::Elite
    }
}

/// Performs one request to the test endpoint
#[async_trait]
pub trait Prober: Send + Sync {
    /// Request `test_url` through `candidate`
    async fn probe(
        &self,
        candidate: &ProxyCandidate,
        test_url: &str,
        timeout: Duration,
    ) -> Result<ProbeObservation, ProbeError>;

    /// Request `test_url` directly to learn the client's own IP
    async fn real_ip(&self, test_url: &str, timeout: Duration) -> Result<String, ProbeError>;
}

/// [`Prober`] issuing plain reqwest requests
#[derive(Debug, Clone, Default)]
pub struct HttpProber;

impl HttpProber {
    fn create_client(candidate: &ProxyCandidate, timeout: Duration) -> Result<Client, ProbeError> {
        let proxy_url = candidate.url();
        let reqwest_proxy = match candidate.scheme {
            ProxyType::Http | ProxyType::Https => ReqwestProxy::all(&proxy_url)?,
            ProxyType::Socks5 => ReqwestProxy::all(proxy_url.replacen("socks5://", "socks5h://", 1))?,
        };

        Ok(Client::builder()
            .proxy(reqwest_proxy)
            .timeout(timeout)
            .build()?)
    }

    async fn fetch(client: &Client, test_url: &str) -> Result<ProbeObservation, ProbeError> {
        let response = client.get(test_url).send().await?;
        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status().as_u16()));
        }
        ProbeObservation::from_body(&response.text().await?)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(
        &self,
        candidate: &ProxyCandidate,
        test_url: &str,
        timeout: Duration,
    ) -> Result<ProbeObservation, ProbeError> {
        let client = Self::create_client(candidate, timeout)?;
        Self::fetch(&client, test_url).await
    }

    async fn real_ip(&self, test_url: &str, timeout: Duration) -> Result<String, ProbeError> {
        let client = Client::builder().timeout(timeout).build()?;
        let observation = Self::fetch(&client, test_url).await?;
        observation
            .origin
            .split(',')
            .next()
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| ProbeError::Malformed("empty origin".to_string()))
    }
}

/// Configuration for the proxy validator
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Timeout for each probe
    pub timeout: Duration,
    /// Number of concurrent probes
    pub concurrency: usize,
    /// URL to test proxies against
    pub test_url: String,
    /// Client IP; discovered with a direct request when unset
    pub real_ip: Option<String>,
    /// Minimum anonymity kept in the output
    pub anonymity_filter: AnonymityFilter,
    /// Path to MMDB file for country annotation (optional)
    pub mmdb_path: Option<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            concurrency: DEFAULT_CONCURRENCY,
            test_url: DEFAULT_TEST_URL.to_string(),
            real_ip: None,
            anonymity_filter: AnonymityFilter::All,
            mmdb_path: None,
        }
    }
}

impl ValidatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_test_url(mut self, url: impl Into<String>) -> Self {
        self.test_url = url.into();
        self
    }

    pub fn with_real_ip(mut self, ip: impl Into<String>) -> Self {
        self.real_ip = Some(ip.into());
        self
    }

    pub fn with_anonymity_filter(mut self, filter: AnonymityFilter) -> Self {
        self.anonymity_filter = filter;
        self
    }

    pub fn with_mmdb_path(mut self, path: impl Into<String>) -> Self {
        self.mmdb_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::NotPositive {
                field: "validator.concurrency",
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "validator.timeout",
            });
        }
        if self.test_url.trim().is_empty() {
            return Err(ConfigError::EmptyTestUrl);
        }
        Ok(())
    }
}

/// Probes candidates concurrently and keeps the working ones
pub struct ProxyValidator<P> {
    config: ValidatorConfig,
    prober: Arc<P>,
    geo_locator: Option<GeoLocator>,
}

impl<P: Prober + 'static> ProxyValidator<P> {
    /// Create a validator; malformed configuration is rejected here
    pub fn new(config: ValidatorConfig, prober: P) -> Result<Self, ConfigError> {
        config.validate()?;
        let geo_locator = config.mmdb_path.as_ref().and_then(|path| {
            GeoLocator::from_path(path)
                .map_err(|e| warn!(path = %path, error = %e, "geolocation database unavailable"))
                .ok()
        });

        Ok(Self {
            config,
            prober: Arc::new(prober),
            geo_locator,
        })
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Probe every candidate; the result is sorted fastest first
    pub async fn validate(&self, candidates: Vec<ProxyCandidate>) -> Vec<ValidatedProxy> {
        self.validate_until(candidates, &CancellationToken::new()).await
    }

    /// Like [`validate`](Self::validate), aborting outstanding probes on cancellation
    pub async fn validate_until(
        &self,
        candidates: Vec<ProxyCandidate>,
        cancel: &CancellationToken,
    ) -> Vec<ValidatedProxy> {
        let total = candidates.len();
        let real_ip = self.resolve_real_ip().await;
        info!(candidates = total, concurrency = self.config.concurrency, "validating proxies");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let real_ip = real_ip.as_deref();

        let mut validated: Vec<ValidatedProxy> = stream::iter(candidates)
            .map(|candidate| {
                let sem = Arc::clone(&semaphore);
                async move {
                    let Ok(_permit) = sem.acquire().await else {
                        return None;
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => None,
                        result = self.probe_one(candidate, real_ip) => result,
                    }
                }
            })
            .buffer_unordered(self.config.concurrency)
            .filter_map(|result| async move { result })
            .filter(|proxy| {
                let keep = self.config.anonymity_filter.accepts(proxy.anonymity_level);
                if !keep {
                    debug!(proxy = %proxy.candidate, level = %proxy.anonymity_level, "below anonymity filter");
                }
                async move { keep }
            })
            .collect()
            .await;

        validated.sort_by_key(|proxy| proxy.latency_ms);

        if validated.is_empty() {
            warn!(candidates = total, "no operational proxies found");
        } else {
            info!(working = validated.len(), candidates = total, "validation complete");
        }
        validated
    }

    async fn probe_one(&self, mut candidate: ProxyCandidate, real_ip: Option<&str>) -> Option<ValidatedProxy> {
        let start = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.timeout,
            self.prober
                .probe(&candidate, &self.config.test_url, self.config.timeout),
        )
        .await
        .unwrap_or(Err(ProbeError::Timeout));

        match outcome {
            Ok(observation) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                let level = classify(&observation, real_ip);
                if candidate.country.is_none() {
                    candidate.country = self
                        .geo_locator
                        .as_ref()
                        .and_then(|geo| geo.country_code(&candidate.host));
                }
                debug!(proxy = %candidate, latency_ms, level = %level, "proxy operational");
                Some(ValidatedProxy::new(candidate, latency_ms, level))
            }
            Err(e) => {
                debug!(proxy = %candidate, error = %e, "dropping proxy");
                None
            }
        }
    }

    async fn resolve_real_ip(&self) -> Option<String> {
        if let Some(ip) = &self.config.real_ip {
            return Some(ip.clone());
        }
        let lookup = tokio::time::timeout(
            self.config.timeout,
            self.prober.real_ip(&self.config.test_url, self.config.timeout),
        )
        .await
        .unwrap_or(Err(ProbeError::Timeout));

        match lookup {
            Ok(ip) => {
                debug!(real_ip = %ip, "discovered client IP");
                Some(ip)
            }
            Err(e) => {
                warn!(error = %e, "could not discover client IP; transparent proxies cannot be detected");
                None
            }
        }
    }
}
