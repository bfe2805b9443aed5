//! Proxy acquisition, validation and rotation
//!
//! This module provides functionality for:
//! - Harvesting candidate proxies from public list sources
//! - Probing candidates concurrently and classifying their anonymity
//! - Arbitrating access to validated proxies through a shared pool
//! - Refilling the pool on demand when sessions exhaust it

pub mod geo;
pub mod harvester;
pub mod models;
pub mod parser;
pub mod pool;
pub mod replenish;
pub mod validator;

pub use harvester::{HttpFetcher, ProxyHarvester, ProxySource, SourceFetcher};
pub use models::{AnonymityFilter, AnonymityLevel, ProxyCandidate, ProxyId, ProxyType, ValidatedProxy};
pub use parser::{ProxyParser, SourceFormat};
pub use pool::{FailureOutcome, Membership, PoolSize, ProxyPool};
pub use replenish::{HarvestPipeline, Replenisher};
pub use validator::{HttpProber, Prober, ProxyValidator, ValidatorConfig};
