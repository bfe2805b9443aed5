//! Interfaces to the browser-driving and listing-parsing collaborators
//!
//! The session never looks inside a page: it only asks the driver to
//! scroll and to report block signals, and hands opaque item references to
//! the parser.

use crate::error::{BrowserError, ParseError};
use crate::proxy::models::ValidatedProxy;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::time::Duration;

/// Observable evidence that the target flagged the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSignal {
    Captcha,
    /// Rate-limit or service-unavailable style HTTP status
    HttpStatus(u16),
    UnusualTraffic,
    /// The proxy itself failed the navigation
    ProxyFailure(String),
}

impl fmt::Display for BlockSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSignal::Captcha => write!(f, "captcha challenge"),
            BlockSignal::HttpStatus(status) => write!(f, "http status {status}"),
            BlockSignal::UnusualTraffic => write!(f, "unusual traffic notice"),
            BlockSignal::ProxyFailure(reason) => write!(f, "proxy failure: {reason}"),
        }
    }
}

/// Human-like pacing between interactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
}

/// Client identity presented to the target; re-randomized per proxy assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_agent: String,
    pub pacing: Option<Pacing>,
}

/// Supplies identities
pub trait IdentityProvider: Send + Sync {
    fn next_identity(&self) -> Identity;
}

/// Opaque page state owned by the driver that created it
pub struct PageHandle(Box<dyn Any + Send + Sync>);

impl PageHandle {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self(Box::new(state))
    }

    /// Driver-side access to its own page state
    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle").finish_non_exhaustive()
    }
}

/// Position of a listing in encounter order on the current page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemRef(pub usize);

/// One business listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub hours: String,
    #[serde(rename = "timestamp")]
    pub extracted_at: DateTime<Local>,
}

impl ListingRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
            address: String::new(),
            website: String::new(),
            phone: String::new(),
            hours: String::new(),
            extracted_at: Local::now(),
        }
    }
}

/// Drives one browser-like client; exclusively owned by one worker
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Load `url` through `proxy` (direct when `None`) presenting `identity`
    async fn navigate(
        &mut self,
        url: &str,
        proxy: Option<&ValidatedProxy>,
        identity: &Identity,
    ) -> Result<PageHandle, BrowserError>;

    /// Request more results, returning how many new listings appeared
    async fn scroll(&mut self, page: &mut PageHandle) -> Result<usize, BrowserError>;

    /// Inspect the page for block signals
    async fn detect_block(&mut self, page: &PageHandle) -> Result<Option<BlockSignal>, BrowserError>;

    /// Route further requests of `page` through a new proxy and identity
    async fn switch_proxy(
        &mut self,
        _page: &mut PageHandle,
        _proxy: Option<&ValidatedProxy>,
        _identity: &Identity,
    ) -> Result<(), BrowserError> {
        Ok(())
    }
}

/// Creates one driver per worker
pub trait BrowserFactory: Send + Sync {
    type Driver: BrowserDriver + 'static;

    fn create(&self) -> crate::Result<Self::Driver>;
}

/// Reads one listing from a page
#[async_trait]
pub trait ListingParser: Send + Sync {
    async fn parse(&self, page: &PageHandle, item: ItemRef) -> Result<ListingRecord, ParseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_handle_downcast() {
        let mut page = PageHandle::new(vec![1u32, 2, 3]);
        assert_eq!(page.downcast_ref::<Vec<u32>>().map(Vec::len), Some(3));
        page.downcast_mut::<Vec<u32>>().unwrap().push(4);
        assert!(page.downcast_ref::<String>().is_none());
        assert_eq!(page.downcast_ref::<Vec<u32>>().map(Vec::len), Some(4));
    }

    #[test]
    fn test_listing_record_serializes_timestamp_field() {
        let record = ListingRecord::named("Cafe Uno");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["name"], "Cafe Uno");
        assert!(json.get("timestamp").is_some());
        assert!(json.get("extracted_at").is_none());
    }
}
