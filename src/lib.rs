//! Listing Harvester - proxy-rotating listing scraper
//!
//! Harvests public proxies, validates them concurrently, and drives scrape
//! sessions that rotate through the validated pool when a target blocks
//! them. A dispatcher runs batches of queries across parallel workers.

pub mod browser;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod persistence;
pub mod proxy;
pub mod session;

pub use config::AppConfig;
pub use dispatcher::{BatchResults, Dispatcher};
pub use error::{BrowserError, ConfigError, ParseError, PersistError, PoolError, ProbeError};
pub use proxy::*;
pub use session::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
