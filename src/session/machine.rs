//! Scrape session state machine
//!
//! ```text
//! INIT -> SEARCHING -> SCROLLING <-> EXTRACTING -> DONE
//!           ^   any of the above -> BLOCKED -> ROTATING -+
//!           +--------------------------------------------+
//!                                  BLOCKED -> FAILED
//! ```
//!
//! A session is bound to one query and one driver. It checks a proxy out
//! of the shared pool, reacts to block signals by returning the proxy as a
//! failure and rotating after an exponential backoff, and hands its proxy
//! back on every exit path.

use crate::error::{BrowserError, ConfigError, ParseError};
use crate::proxy::models::{ProxyId, ValidatedProxy};
use crate::proxy::pool::{FailureOutcome, ProxyPool};
use crate::proxy::replenish::Replenisher;
use crate::session::backoff::Backoff;
use crate::session::collaborators::{
    BlockSignal, BrowserDriver, Identity, IdentityProvider, ItemRef, ListingParser, ListingRecord,
    PageHandle,
};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::form_urlencoded;
use uuid::Uuid;

/// Placeholder replaced by the encoded query in [`SessionConfig::search_url`]
pub const QUERY_PLACEHOLDER: &str = "{query}";

/// One search request: a query with an optional location
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SearchQuery {
    pub query: String,
    pub location: Option<String>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, location: Option<String>) -> Self {
        Self {
            query: query.into(),
            location: location.filter(|l| !l.trim().is_empty()),
        }
    }

    /// Parse a batch line: `query` or `query | location`
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        match line.split_once('|') {
            Some((query, location)) => {
                let query = query.trim();
                (!query.is_empty()).then(|| Self::new(query, Some(location.trim().to_string())))
            }
            None => Some(Self::new(line, None)),
        }
    }

    /// Text typed into the search box
    pub fn full_text(&self) -> String {
        match &self.location {
            Some(location) => format!("{} {}", self.query, location),
            None => self.query.clone(),
        }
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_text())
    }
}

/// State-machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Init,
    Searching,
    Scrolling,
    Extracting,
    Done,
    Blocked,
    Rotating,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Done | SessionStatus::Failed)
    }
}

/// Why a session ended `FAILED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ProxyExhausted,
    BlockedRetriesExhausted,
    Cancelled,
    /// The worker could not start its driver
    BrowserUnavailable,
    /// The worker driving the session panicked
    WorkerFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ProxyExhausted => "proxy_exhausted",
            FailureReason::BlockedRetriesExhausted => "blocked_retries_exhausted",
            FailureReason::Cancelled => "cancelled",
            FailureReason::BrowserUnavailable => "browser_unavailable",
            FailureReason::WorkerFailed => "worker_failed",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Stop after this many listings; 0 means no limit
    pub max_results: usize,
    /// Block-triggered rotations allowed; the session fails when blocked
    /// again after this many
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Proactive rotation after this many extracted listings; 0 disables it
    pub listings_per_proxy: usize,
    /// Consecutive empty scrolls that mark the end of the list
    pub stale_scroll_limit: u32,
    /// Upper bound for every navigation, scroll, block check and parse
    pub operation_timeout: Duration,
    /// How long an exhausted session waits for re-harvested proxies
    pub reharvest_wait: Duration,
    /// Search URL template containing [`QUERY_PLACEHOLDER`]
    pub search_url: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_results: 100,
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_secs(2), Duration::from_secs(60)),
            listings_per_proxy: 0,
            stale_scroll_limit: 2,
            operation_timeout: Duration::from_secs(30),
            reharvest_wait: Duration::from_secs(60),
            search_url: "https://www.google.com/maps/search/{query}".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::NotPositive {
                field: "session.max_attempts",
            });
        }
        if self.stale_scroll_limit == 0 {
            return Err(ConfigError::NotPositive {
                field: "session.stale_scroll_limit",
            });
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "session.operation_timeout",
            });
        }
        if self.backoff.base > self.backoff.max {
            return Err(ConfigError::BackoffRange {
                base_ms: self.backoff.base.as_millis() as u64,
                max_ms: self.backoff.max.as_millis() as u64,
            });
        }
        if !self.search_url.contains(QUERY_PLACEHOLDER) {
            return Err(ConfigError::InvalidValue {
                field: "session.search_url",
                value: self.search_url.clone(),
            });
        }
        Ok(())
    }

    pub fn search_url_for(&self, query: &SearchQuery) -> String {
        self.search_url
            .replace(QUERY_PLACEHOLDER, &encode_query(&query.full_text()))
    }
}

fn encode_query(text: &str) -> String {
    form_urlencoded::byte_serialize(text.trim().as_bytes()).collect()
}

/// Outcome of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionResult {
    pub session_id: Uuid,
    pub query: SearchQuery,
    pub status: SessionStatus,
    pub results: Vec<ListingRecord>,
    pub reason: Option<FailureReason>,
    /// Search attempts made, including the successful one
    pub attempt_count: u32,
    /// Distinct proxy assignments, initial checkout included
    pub proxies_used: u32,
    #[serde(skip)]
    pub parse_failures: Vec<ParseError>,
    #[serde(skip)]
    pub history: Vec<SessionStatus>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

impl SessionResult {
    pub fn is_done(&self) -> bool {
        self.status == SessionStatus::Done
    }
}

enum Interrupt {
    Blocked(BlockSignal),
    Cancelled,
}

/// Shared resources a session draws on
#[derive(Clone, Copy)]
pub struct SessionContext<'a> {
    pub config: &'a SessionConfig,
    /// `None` runs the session without a proxy
    pub pool: Option<&'a ProxyPool>,
    pub replenisher: Option<&'a dyn Replenisher>,
    pub identities: &'a dyn IdentityProvider,
    pub parser: &'a dyn ListingParser,
}

/// A single query driven from `INIT` to `DONE` or `FAILED`
pub struct ScrapeSession<'a> {
    id: Uuid,
    query: SearchQuery,
    ctx: SessionContext<'a>,
    browser: &'a mut dyn BrowserDriver,
    cancel: CancellationToken,
    status: SessionStatus,
    history: Vec<SessionStatus>,
    assigned_proxy: Option<ValidatedProxy>,
    /// Proxies this session was blocked through; rotation avoids them
    failed_proxies: HashSet<ProxyId>,
    identity: Option<Identity>,
    attempt_count: u32,
    proxies_used: u32,
    results: Vec<ListingRecord>,
    parse_failures: Vec<ParseError>,
    /// Listings consumed (parsed or skipped) across attempts
    cursor: usize,
    since_rotation: usize,
    started_at: DateTime<Local>,
}

impl<'a> ScrapeSession<'a> {
    pub fn new(
        query: SearchQuery,
        ctx: SessionContext<'a>,
        browser: &'a mut dyn BrowserDriver,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            query,
            ctx,
            browser,
            cancel,
            status: SessionStatus::Init,
            history: vec![SessionStatus::Init],
            assigned_proxy: None,
            failed_proxies: HashSet::new(),
            identity: None,
            attempt_count: 0,
            proxies_used: 0,
            results: Vec::new(),
            parse_failures: Vec::new(),
            cursor: 0,
            since_rotation: 0,
            started_at: Local::now(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub async fn run(mut self) -> SessionResult {
        info!(session = %self.id, query = %self.query, "session started");
        let outcome = self.drive().await;
        self.finish(outcome)
    }

    async fn drive(&mut self) -> Result<(), FailureReason> {
        self.acquire_proxy().await?;

        loop {
            self.attempt_count += 1;
            let signal = match self.attempt().await {
                Ok(()) => return Ok(()),
                Err(Interrupt::Cancelled) => return Err(FailureReason::Cancelled),
                Err(Interrupt::Blocked(signal)) => signal,
            };

            self.transition(SessionStatus::Blocked);
            warn!(
                session = %self.id,
                query = %self.query,
                attempt = self.attempt_count,
                signal = %signal,
                "block detected"
            );
            self.release_failed_proxy();

            if self.attempt_count > self.ctx.config.max_attempts {
                return Err(FailureReason::BlockedRetriesExhausted);
            }

            self.transition(SessionStatus::Rotating);
            let delay = self.ctx.config.backoff.delay(self.attempt_count);
            debug!(session = %self.id, ?delay, "backing off before rotation");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(FailureReason::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            self.acquire_proxy().await?;
        }
    }

    /// One pass of `SEARCHING -> SCROLLING <-> EXTRACTING`
    async fn attempt(&mut self) -> Result<(), Interrupt> {
        self.transition(SessionStatus::Searching);
        let url = self.ctx.config.search_url_for(&self.query);
        let identity = self.current_identity();
        let timeout = self.ctx.config.operation_timeout;

        let mut page = guarded(
            &self.cancel,
            timeout,
            self.browser
                .navigate(&url, self.assigned_proxy.as_ref(), &identity),
        )
        .await?;
        self.check_block(&page).await?;

        let max_results = self.ctx.config.max_results;
        let mut loaded = 0usize;
        let mut stale = 0u32;

        loop {
            if max_results > 0 && loaded >= max_results {
                debug!(session = %self.id, max_results, "result limit reached");
                break;
            }

            self.transition(SessionStatus::Scrolling);
            let new_items = guarded(&self.cancel, timeout, self.browser.scroll(&mut page)).await?;
            self.check_block(&page).await?;

            if new_items == 0 {
                stale += 1;
                if stale >= self.ctx.config.stale_scroll_limit {
                    debug!(session = %self.id, loaded, "end of result list");
                    break;
                }
                continue;
            }
            stale = 0;
            loaded += new_items;
            if max_results > 0 {
                loaded = loaded.min(max_results);
            }

            self.transition(SessionStatus::Extracting);
            self.extract(&mut page, loaded).await?;
        }

        self.transition(SessionStatus::Done);
        Ok(())
    }

    /// Parse every listing in `cursor..loaded`, in encounter order
    async fn extract(&mut self, page: &mut PageHandle, loaded: usize) -> Result<(), Interrupt> {
        while self.cursor < loaded {
            let item = ItemRef(self.cursor);
            let parsed = tokio::time::timeout(
                self.ctx.config.operation_timeout,
                self.ctx.parser.parse(page, item),
            )
            .await
            .unwrap_or_else(|_| Err(ParseError::new(item.0, "timed out")));
            self.cursor += 1;

            match parsed {
                Ok(record) => {
                    debug!(session = %self.id, listing = %record.name, "listing extracted");
                    self.results.push(record);
                    self.since_rotation += 1;
                }
                Err(e) => {
                    warn!(session = %self.id, error = %e, "skipping listing");
                    self.parse_failures.push(e);
                }
            }

            let per_proxy = self.ctx.config.listings_per_proxy;
            if per_proxy > 0 && self.since_rotation >= per_proxy {
                self.rotate_on_schedule(page).await?;
            }
            if self.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
        }
        Ok(())
    }

    /// Proactive swap; a pending block always wins over the schedule
    async fn rotate_on_schedule(&mut self, page: &mut PageHandle) -> Result<(), Interrupt> {
        self.check_block(page).await?;
        self.since_rotation = 0;

        let Some(pool) = self.ctx.pool else {
            return Ok(());
        };
        let Some(next) = pool.checkout() else {
            debug!(session = %self.id, "no spare proxy for scheduled rotation");
            return Ok(());
        };

        if let Some(previous) = self.assigned_proxy.replace(next) {
            if let Err(e) = pool.return_success(&previous) {
                warn!(session = %self.id, error = %e, "could not return rotated proxy");
            }
        }
        self.proxies_used += 1;
        let identity = self.ctx.identities.next_identity();
        self.identity = Some(identity.clone());
        info!(
            session = %self.id,
            proxy = ?self.assigned_proxy.as_ref().map(|p| p.url()),
            "scheduled proxy rotation"
        );

        guarded(
            &self.cancel,
            self.ctx.config.operation_timeout,
            self.browser
                .switch_proxy(page, self.assigned_proxy.as_ref(), &identity),
        )
        .await
    }

    async fn check_block(&mut self, page: &PageHandle) -> Result<(), Interrupt> {
        let signal = guarded(
            &self.cancel,
            self.ctx.config.operation_timeout,
            self.browser.detect_block(page),
        )
        .await?;
        match signal {
            Some(signal) => Err(Interrupt::Blocked(signal)),
            None => Ok(()),
        }
    }

    /// `INIT` / `ROTATING`: assign a fresh proxy and identity
    async fn acquire_proxy(&mut self) -> Result<(), FailureReason> {
        self.identity = Some(self.ctx.identities.next_identity());
        let Some(pool) = self.ctx.pool else {
            return Ok(());
        };

        let proxy = match pool.checkout_excluding(&self.failed_proxies) {
            Some(proxy) => proxy,
            None => self.await_replenished(pool).await?,
        };
        debug!(session = %self.id, proxy = %proxy, "proxy assigned");
        self.assigned_proxy = Some(proxy);
        self.proxies_used += 1;
        Ok(())
    }

    async fn await_replenished(&self, pool: &ProxyPool) -> Result<ValidatedProxy, FailureReason> {
        let Some(replenisher) = self.ctx.replenisher else {
            warn!(session = %self.id, "proxy pool exhausted");
            return Err(FailureReason::ProxyExhausted);
        };

        let wait = self.ctx.config.reharvest_wait;
        let refill = async {
            replenisher.replenish(pool).await;
            loop {
                if let Some(proxy) = pool.checkout() {
                    return Some(proxy);
                }
                if !pool.wait_for_available(wait).await {
                    return None;
                }
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(FailureReason::Cancelled),
            refilled = tokio::time::timeout(wait, refill) => match refilled {
                Ok(Some(proxy)) => Ok(proxy),
                _ => {
                    warn!(session = %self.id, ?wait, "no proxies after re-harvest");
                    Err(FailureReason::ProxyExhausted)
                }
            },
        }
    }

    fn release_failed_proxy(&mut self) {
        let (Some(pool), Some(proxy)) = (self.ctx.pool, self.assigned_proxy.take()) else {
            return;
        };
        self.failed_proxies.insert(proxy.id());
        match pool.return_failure(&proxy) {
            Ok(FailureOutcome::Blacklisted) => {
                info!(session = %self.id, proxy = %proxy.candidate, "proxy evicted after repeated failures")
            }
            Ok(FailureOutcome::Requeued { .. }) => {}
            Err(e) => warn!(session = %self.id, error = %e, "could not return failed proxy"),
        }
    }

    fn release_healthy_proxy(&mut self) {
        let (Some(pool), Some(proxy)) = (self.ctx.pool, self.assigned_proxy.take()) else {
            return;
        };
        if let Err(e) = pool.return_success(&proxy) {
            warn!(session = %self.id, error = %e, "could not return proxy");
        }
    }

    fn current_identity(&mut self) -> Identity {
        match &self.identity {
            Some(identity) => identity.clone(),
            None => {
                let identity = self.ctx.identities.next_identity();
                self.identity = Some(identity.clone());
                identity
            }
        }
    }

    fn transition(&mut self, next: SessionStatus) {
        if self.status != next {
            debug!(session = %self.id, from = ?self.status, to = ?next, "session transition");
        }
        self.status = next;
        self.history.push(next);
    }

    fn finish(mut self, outcome: Result<(), FailureReason>) -> SessionResult {
        let reason = match outcome {
            Ok(()) => {
                self.release_healthy_proxy();
                None
            }
            Err(reason) => {
                self.release_failed_proxy();
                if self.status != SessionStatus::Failed {
                    self.transition(SessionStatus::Failed);
                }
                Some(reason)
            }
        };

        match reason {
            None => info!(
                session = %self.id,
                query = %self.query,
                listings = self.results.len(),
                attempts = self.attempt_count,
                "session done"
            ),
            Some(reason) => warn!(
                session = %self.id,
                query = %self.query,
                reason = %reason,
                attempts = self.attempt_count,
                "session failed"
            ),
        }

        SessionResult {
            session_id: self.id,
            query: self.query,
            status: self.status,
            results: self.results,
            reason,
            attempt_count: self.attempt_count,
            proxies_used: self.proxies_used,
            parse_failures: self.parse_failures,
            history: self.history,
            started_at: self.started_at,
            finished_at: Local::now(),
        }
    }
}

/// Run a collaborator call under the session's timeout and cancellation
///
/// Block responses, timeouts and other driver failures all count as a
/// blocked attempt.
async fn guarded<T>(
    cancel: &CancellationToken,
    timeout: Duration,
    call: impl Future<Output = Result<T, BrowserError>>,
) -> Result<T, Interrupt> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        outcome = tokio::time::timeout(timeout, call) => match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(BrowserError::Blocked(signal))) => Err(Interrupt::Blocked(signal)),
            Ok(Err(e)) => Err(Interrupt::Blocked(BlockSignal::ProxyFailure(e.to_string()))),
            Err(_) => Err(Interrupt::Blocked(BlockSignal::ProxyFailure("timed out".to_string()))),
        },
    }
}
