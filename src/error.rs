//! Typed errors shared across the crate

use crate::proxy::models::ProxyId;
use crate::session::collaborators::BlockSignal;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration rejected before any work starts
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
    #[error("backoff base delay ({base_ms}ms) exceeds the maximum delay ({max_ms}ms)")]
    BackoffRange { base_ms: u64, max_ms: u64 },
    #[error("test url must not be empty")]
    EmptyTestUrl,
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Misuse of the proxy pool
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("proxy {0} is not checked out")]
    NotCheckedOut(ProxyId),
}

/// Failure reported by the browser-driving collaborator
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("blocked: {0}")]
    Blocked(BlockSignal),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("scroll failed: {0}")]
    Scroll(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// A single listing could not be parsed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("listing {index} could not be parsed: {message}")]
pub struct ParseError {
    pub index: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(index: usize, message: impl Into<String>) -> Self {
        Self {
            index,
            message: message.into(),
        }
    }
}

/// Probe failure; always dropped silently by the validator
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("malformed test endpoint response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Failure writing results to disk
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("nothing to save for {0:?}")]
    Empty(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
