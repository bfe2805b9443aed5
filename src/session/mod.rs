//! Scrape sessions and the collaborators they drive

pub mod backoff;
pub mod collaborators;
pub mod identity;
pub mod machine;

pub use backoff::Backoff;
pub use collaborators::{
    BlockSignal, BrowserDriver, BrowserFactory, Identity, IdentityProvider, ItemRef, ListingParser,
    ListingRecord, Pacing, PageHandle,
};
pub use identity::RandomIdentity;
pub use machine::{
    FailureReason, ScrapeSession, SearchQuery, SessionConfig, SessionContext, SessionResult,
    SessionStatus,
};
