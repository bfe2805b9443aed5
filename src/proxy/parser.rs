//! Proxy list parsing for the formats served by public proxy sources

use crate::proxy::models::{ProxyCandidate, ProxyType, ValidatedProxy};
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::Path;

static URL_FORMAT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?|socks5h?)://([^:/\s]+):(\d{1,5})/?$").expect("Invalid proxy URL regex")
});

/// Regex pattern to match IP:PORT patterns in arbitrary text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid IP:PORT regex")
});

static TABLE_ROW_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").expect("Invalid table row regex"));

static TABLE_CELL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<td[^>]*>(.*?)</td>").expect("Invalid table cell regex"));

static TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("Invalid tag regex"));

/// Layout of a proxy source response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// One `host:port` (or `scheme://host:port`) per line
    #[default]
    Text,
    /// HTML table: ip, port, country code, ..., https yes/no in column 7
    Table,
    /// JSON array (or `{"data": [...]}`) of `{ip, port, country, protocols}`
    Json,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonDocument {
    Wrapped { data: Vec<JsonEntry> },
    Bare(Vec<JsonEntry>),
}

#[derive(Debug, Deserialize)]
struct JsonEntry {
    #[serde(alias = "host")]
    ip: String,
    port: PortValue,
    #[serde(default, alias = "country_code")]
    country: Option<String>,
    #[serde(default)]
    protocols: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

impl PortValue {
    fn value(&self) -> Option<u16> {
        match self {
            PortValue::Number(port) => Some(*port),
            PortValue::Text(text) => text.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SavedProxies {
    working_proxies: Vec<ValidatedProxy>,
}

/// Proxy parser for parsing proxies from strings and files
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy line
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - scheme://IP:PORT
    pub fn parse_line(line: &str, default_type: ProxyType) -> Option<ProxyCandidate> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if let Some(caps) = URL_FORMAT_REGEX.captures(line) {
            let scheme = match &caps[1] {
                "http" => ProxyType::Http,
                "https" => ProxyType::Https,
                _ => ProxyType::Socks5,
            };
            let port = Self::valid_port(&caps[3])?;
            return Some(ProxyCandidate::new(&caps[2], port, scheme));
        }

        let (host, port) = line.split_once(':')?;
        if host.is_empty() || host.contains(char::is_whitespace) {
            return None;
        }
        let port = Self::valid_port(port)?;
        Some(ProxyCandidate::new(host, port, default_type))
    }

    /// Parse a response body according to its source format
    pub fn parse(content: &str, format: SourceFormat, default_type: ProxyType) -> Result<Vec<ProxyCandidate>> {
        match format {
            SourceFormat::Text => Ok(Self::parse_text(content, default_type)),
            SourceFormat::Table => Ok(Self::parse_table(content, default_type)),
            SourceFormat::Json => Self::parse_json(content, default_type),
        }
    }

    /// Parse plain text line by line, falling back to regex extraction
    pub fn parse_text(content: &str, default_type: ProxyType) -> Vec<ProxyCandidate> {
        let proxies: Vec<_> = content
            .lines()
            .filter_map(|line| Self::parse_line(line, default_type))
            .collect();

        if proxies.is_empty() {
            Self::extract_with_regex(content, default_type)
        } else {
            proxies
        }
    }

    /// Parse free-proxy-list style HTML tables
    ///
    /// Rows with fewer than two cells are skipped. The country code is taken
    /// from column 3 and an http-capable row becomes `https` when column 7
    /// reads "yes".
    pub fn parse_table(content: &str, default_type: ProxyType) -> Vec<ProxyCandidate> {
        TABLE_ROW_REGEX
            .captures_iter(content)
            .filter_map(|row| {
                let cells: Vec<String> = TABLE_CELL_REGEX
                    .captures_iter(&row[1])
                    .map(|cell| TAG_REGEX.replace_all(&cell[1], "").trim().to_string())
                    .collect();
                if cells.len() < 2 || !Self::is_ipv4(&cells[0]) {
                    return None;
                }
                let port = Self::valid_port(&cells[1])?;

                let scheme = match cells.get(6).map(|c| c.to_ascii_lowercase()) {
                    Some(flag) if flag == "yes" && default_type == ProxyType::Http => ProxyType::Https,
                    _ => default_type,
                };
                let mut candidate = ProxyCandidate::new(cells[0].clone(), port, scheme);
                if let Some(country) = cells.get(2).filter(|c| Self::is_country_code(c)) {
                    candidate = candidate.with_country(country.to_ascii_uppercase());
                }
                Some(candidate)
            })
            .collect()
    }

    /// Parse JSON proxy listings
    pub fn parse_json(content: &str, default_type: ProxyType) -> Result<Vec<ProxyCandidate>> {
        let entries = match serde_json::from_str::<JsonDocument>(content)? {
            JsonDocument::Wrapped { data } => data,
            JsonDocument::Bare(entries) => entries,
        };

        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let port = entry.port.value().filter(|p| *p != 0)?;
                let scheme = entry
                    .protocols
                    .iter()
                    .find_map(|p| p.parse::<ProxyType>().ok())
                    .unwrap_or(default_type);
                let mut candidate = ProxyCandidate::new(entry.ip, port, scheme);
                if let Some(country) = entry.country.filter(|c| !c.trim().is_empty()) {
                    candidate = candidate.with_country(country.trim().to_ascii_uppercase());
                }
                Some(candidate)
            })
            .collect())
    }

    /// Load candidates from a file
    ///
    /// Accepts a working-proxies JSON written by harvest-only mode, a JSON
    /// listing, or plain text.
    pub fn parse_file<P: AsRef<Path>>(path: P, default_type: ProxyType) -> Result<Vec<ProxyCandidate>> {
        let content = fs::read_to_string(path)?;
        let trimmed = content.trim_start();

        if trimmed.starts_with('{') {
            if let Ok(saved) = serde_json::from_str::<SavedProxies>(&content) {
                return Ok(saved
                    .working_proxies
                    .into_iter()
                    .map(|proxy| proxy.candidate)
                    .collect());
            }
        }
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return Self::parse_json(&content, default_type);
        }
        Ok(Self::parse_text(&content, default_type))
    }

    fn extract_with_regex(content: &str, default_type: ProxyType) -> Vec<ProxyCandidate> {
        IP_PORT_REGEX
            .captures_iter(content)
            .filter_map(|cap| {
                let host = cap.get(1)?.as_str();
                if !Self::is_ipv4(host) {
                    return None;
                }
                let port = Self::valid_port(cap.get(2)?.as_str())?;
                Some(ProxyCandidate::new(host, port, default_type))
            })
            .collect()
    }

    fn valid_port(text: &str) -> Option<u16> {
        text.trim().parse::<u16>().ok().filter(|port| *port != 0)
    }

    fn is_ipv4(host: &str) -> bool {
        host.parse::<std::net::Ipv4Addr>().is_ok()
    }

    fn is_country_code(text: &str) -> bool {
        text.len() == 2 && text.chars().all(|c| c.is_ascii_alphabetic())
    }
}
