//! Application configuration loaded from an optional TOML file
//!
//! Every field has a default, so an empty file (or no file) yields a usable
//! configuration. The binary applies command-line overrides on top.

use crate::browser::{HttpBrowserConfig, DEFAULT_ITEM_PATTERN};
use crate::error::ConfigError;
use crate::proxy::harvester::{ProxySource, ALL_COUNTRIES};
use crate::proxy::models::AnonymityFilter;
use crate::proxy::pool::DEFAULT_FAILURE_THRESHOLD;
use crate::proxy::validator::{ValidatorConfig, DEFAULT_CONCURRENCY, DEFAULT_TEST_URL, DEFAULT_TIMEOUT_SECS};
use crate::session::backoff::Backoff;
use crate::session::machine::SessionConfig;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub harvest: HarvestSection,
    pub validator: ValidatorSection,
    pub pool: PoolSection,
    pub session: SessionSection,
    pub dispatcher: DispatcherSection,
    pub browser: BrowserSection,
    pub output: OutputSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestSection {
    pub sources: Vec<ProxySource>,
    /// ISO country code, or `ALL`
    pub country_filter: String,
    pub fetch_timeout_secs: u64,
}

impl Default for HarvestSection {
    fn default() -> Self {
        Self {
            sources: ProxySource::defaults(),
            country_filter: ALL_COUNTRIES.to_string(),
            fetch_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidatorSection {
    pub timeout_secs: u64,
    pub concurrency: usize,
    pub test_url: String,
    pub real_ip: Option<String>,
    pub anonymity: AnonymityFilter,
    pub mmdb_path: Option<String>,
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            concurrency: DEFAULT_CONCURRENCY,
            test_url: DEFAULT_TEST_URL.to_string(),
            real_ip: None,
            anonymity: AnonymityFilter::All,
            mmdb_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Consecutive failures after which a proxy is blacklisted
    pub failure_threshold: u32,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub max_results: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub listings_per_proxy: usize,
    pub stale_scroll_limit: u32,
    pub operation_timeout_secs: u64,
    pub reharvest_wait_secs: u64,
    pub search_url: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            max_results: defaults.max_results,
            max_attempts: defaults.max_attempts,
            backoff_base_ms: defaults.backoff.base.as_millis() as u64,
            backoff_max_ms: defaults.backoff.max.as_millis() as u64,
            listings_per_proxy: defaults.listings_per_proxy,
            stale_scroll_limit: defaults.stale_scroll_limit,
            operation_timeout_secs: defaults.operation_timeout.as_secs(),
            reharvest_wait_secs: defaults.reharvest_wait.as_secs(),
            search_url: defaults.search_url,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub worker_count: usize,
    /// Cancel the whole batch after this long; unset means no limit
    pub overall_timeout_secs: Option<u64>,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            worker_count: 1,
            overall_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub request_timeout_secs: u64,
    pub item_pattern: String,
    pub page_param: String,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: 20,
            item_pattern: DEFAULT_ITEM_PATTERN.to_string(),
            page_param: "start".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub dir: PathBuf,
    /// Default tracing filter; `RUST_LOG` takes precedence
    pub log_level: String,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("results"),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Read a TOML file; missing fields keep their defaults
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Country filter, or `None` when every country is accepted
    pub fn country_filter(&self) -> Option<&str> {
        let filter = self.harvest.country_filter.trim();
        if filter.is_empty() || filter.eq_ignore_ascii_case(ALL_COUNTRIES) {
            None
        } else {
            Some(filter)
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        let v = &self.validator;
        let mut config = ValidatorConfig::new()
            .with_timeout(Duration::from_secs(v.timeout_secs))
            .with_concurrency(v.concurrency)
            .with_test_url(v.test_url.clone())
            .with_anonymity_filter(v.anonymity);
        if let Some(ip) = &v.real_ip {
            config = config.with_real_ip(ip.clone());
        }
        if let Some(path) = &v.mmdb_path {
            config = config.with_mmdb_path(path.clone());
        }
        config
    }

    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            max_results: s.max_results,
            max_attempts: s.max_attempts,
            backoff: Backoff::new(
                Duration::from_millis(s.backoff_base_ms),
                Duration::from_millis(s.backoff_max_ms),
            ),
            listings_per_proxy: s.listings_per_proxy,
            stale_scroll_limit: s.stale_scroll_limit,
            operation_timeout: Duration::from_secs(s.operation_timeout_secs),
            reharvest_wait: Duration::from_secs(s.reharvest_wait_secs),
            search_url: s.search_url.clone(),
        }
    }

    pub fn browser_config(&self) -> HttpBrowserConfig {
        HttpBrowserConfig {
            timeout: Duration::from_secs(self.browser.request_timeout_secs),
            item_pattern: self.browser.item_pattern.clone(),
            page_param: self.browser.page_param.clone(),
        }
    }

    pub fn overall_timeout(&self) -> Option<Duration> {
        self.dispatcher.overall_timeout_secs.map(Duration::from_secs)
    }

    /// Reject settings that would make the run meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validator_config().validate()?;
        self.session_config().validate()?;
        if self.pool.failure_threshold == 0 {
            return Err(ConfigError::NotPositive {
                field: "pool.failure_threshold",
            });
        }
        if self.dispatcher.worker_count == 0 {
            return Err(ConfigError::NotPositive {
                field: "dispatcher.worker_count",
            });
        }
        if self.harvest.fetch_timeout_secs == 0 {
            return Err(ConfigError::NotPositive {
                field: "harvest.fetch_timeout_secs",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.failure_threshold, 3);
        assert_eq!(config.harvest.sources.len(), 3);
        assert_eq!(config.country_filter(), None);

        let session = config.session_config();
        assert_eq!(session.backoff.base, Duration::from_secs(2));
        assert_eq!(session.backoff.max, Duration::from_secs(60));
        assert_eq!(session.max_attempts, 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
[harvest]
country_filter = "de"

[validator]
concurrency = 50
anonymity = "elite"

[[harvest.sources]]
name = "local"
url = "http://127.0.0.1:9000/proxies.txt"

[dispatcher]
worker_count = 4
overall_timeout_secs = 600
"#,
        )
        .unwrap();

        assert_eq!(config.country_filter(), Some("de"));
        assert_eq!(config.harvest.sources.len(), 1);
        assert_eq!(config.validator.concurrency, 50);
        assert_eq!(config.validator.anonymity, AnonymityFilter::Elite);
        assert_eq!(config.validator.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.dispatcher.worker_count, 4);
        assert_eq!(config.overall_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.session.max_results, 100);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.validator.concurrency = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "validator.concurrency"
            })
        );
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = AppConfig::default();
        config.session.backoff_base_ms = 90_000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::BackoffRange {
                base_ms: 90_000,
                max_ms: 60_000
            })
        );
    }

    #[test]
    fn test_validate_rejects_empty_test_url_and_zero_threshold() {
        let mut config = AppConfig::default();
        config.validator.test_url = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyTestUrl));

        let mut config = AppConfig::default();
        config.pool.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dispatcher.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvester.toml");
        std::fs::write(&path, "[session]\nmax_attempts = 5\n").unwrap();
        assert_eq!(AppConfig::load(&path).unwrap().session.max_attempts, 5);

        std::fs::write(&path, "[session]\nmax_attempts = \"many\"\n").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
