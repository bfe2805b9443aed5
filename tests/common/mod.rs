//! Scripted collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use listing_harvester::error::{BrowserError, ParseError, ProbeError};
use listing_harvester::proxy::validator::ProbeObservation;
use listing_harvester::proxy::{
    AnonymityLevel, ProxyCandidate, ProxySource, ProxyType, Prober, SourceFetcher, ValidatedProxy,
};
use listing_harvester::session::{
    BlockSignal, BrowserDriver, BrowserFactory, Identity, IdentityProvider, ItemRef, ListingParser,
    ListingRecord, PageHandle,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// What the target does on one navigation
#[derive(Debug, Clone)]
pub enum Attempt {
    /// The search request itself is answered with a block
    Blocked(BlockSignal),
    /// The page loads; each scroll reveals the next batch of listings
    Results(Vec<usize>),
    /// Like `Results`, but a block page shows up after `after` scrolls
    BlockedAfter { batches: Vec<usize>, after: usize },
    /// Navigation never completes
    Hang,
    /// The driver crashes the task driving it
    Panic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Navigate {
        at: Instant,
        url: String,
        proxy: Option<String>,
        user_agent: String,
    },
    Switch {
        proxy: Option<String>,
        user_agent: String,
    },
}

/// Shared plan and event log for every driver created from it
#[derive(Clone, Default)]
pub struct Script {
    attempts: Arc<Mutex<VecDeque<Attempt>>>,
    /// Attempts chosen by a substring of the navigated URL; never consumed
    routes: Arc<Vec<(String, Attempt)>>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl Script {
    pub fn new(attempts: impl IntoIterator<Item = Attempt>) -> Self {
        Self {
            attempts: Arc::new(Mutex::new(attempts.into_iter().collect())),
            ..Self::default()
        }
    }

    pub fn routed(routes: Vec<(&str, Attempt)>) -> Self {
        Self {
            routes: Arc::new(routes.into_iter().map(|(k, a)| (k.to_string(), a)).collect()),
            ..Self::default()
        }
    }

    pub fn driver(&self) -> ScriptedBrowser {
        ScriptedBrowser {
            script: self.clone(),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn navigations(&self) -> Vec<(Instant, Option<String>)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Navigate { at, proxy, .. } => Some((at, proxy)),
                Event::Switch { .. } => None,
            })
            .collect()
    }

    pub fn switches(&self) -> Vec<Option<String>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Switch { proxy, .. } => Some(proxy),
                Event::Navigate { .. } => None,
            })
            .collect()
    }

    fn next_attempt(&self, url: &str) -> Attempt {
        if let Some((_, attempt)) = self.routes.iter().find(|(key, _)| url.contains(key.as_str())) {
            return attempt.clone();
        }
        self.attempts
            .lock()
            .pop_front()
            .unwrap_or(Attempt::Results(Vec::new()))
    }
}

struct FakePage {
    batches: VecDeque<usize>,
    scrolls: usize,
    block_after: Option<usize>,
    blocked: bool,
}

impl FakePage {
    fn new(batches: Vec<usize>, block_after: Option<usize>) -> Self {
        Self {
            batches: batches.into(),
            scrolls: 0,
            block_after,
            blocked: false,
        }
    }
}

pub struct ScriptedBrowser {
    script: Script,
}

fn proxy_label(proxy: Option<&ValidatedProxy>) -> Option<String> {
    proxy.map(|p| p.candidate.host.clone())
}

#[async_trait]
impl BrowserDriver for ScriptedBrowser {
    async fn navigate(
        &mut self,
        url: &str,
        proxy: Option<&ValidatedProxy>,
        identity: &Identity,
    ) -> Result<PageHandle, BrowserError> {
        self.script.events.lock().push(Event::Navigate {
            at: Instant::now(),
            url: url.to_string(),
            proxy: proxy_label(proxy),
            user_agent: identity.user_agent.clone(),
        });

        match self.script.next_attempt(url) {
            Attempt::Blocked(signal) => Err(BrowserError::Blocked(signal)),
            Attempt::Results(batches) => Ok(PageHandle::new(FakePage::new(batches, None))),
            Attempt::BlockedAfter { batches, after } => {
                Ok(PageHandle::new(FakePage::new(batches, Some(after))))
            }
            Attempt::Hang => std::future::pending().await,
            Attempt::Panic => panic!("driver crashed"),
        }
    }

    async fn scroll(&mut self, page: &mut PageHandle) -> Result<usize, BrowserError> {
        let page = page
            .downcast_mut::<FakePage>()
            .ok_or_else(|| BrowserError::Scroll("foreign page".to_string()))?;
        page.scrolls += 1;
        if page.block_after.is_some_and(|after| page.scrolls >= after) {
            page.blocked = true;
        }
        Ok(page.batches.pop_front().unwrap_or(0))
    }

    async fn detect_block(&mut self, page: &PageHandle) -> Result<Option<BlockSignal>, BrowserError> {
        let blocked = page.downcast_ref::<FakePage>().is_some_and(|page| page.blocked);
        Ok(blocked.then_some(BlockSignal::Captcha))
    }

    async fn switch_proxy(
        &mut self,
        _page: &mut PageHandle,
        proxy: Option<&ValidatedProxy>,
        identity: &Identity,
    ) -> Result<(), BrowserError> {
        self.script.events.lock().push(Event::Switch {
            proxy: proxy_label(proxy),
            user_agent: identity.user_agent.clone(),
        });
        Ok(())
    }
}

/// Hands out drivers sharing one [`Script`]
pub struct ScriptedFactory {
    pub script: Script,
    pub broken: bool,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            broken: false,
        }
    }
}

impl BrowserFactory for ScriptedFactory {
    type Driver = ScriptedBrowser;

    fn create(&self) -> listing_harvester::Result<ScriptedBrowser> {
        if self.broken {
            anyhow::bail!("browser binary not found");
        }
        Ok(self.script.driver())
    }
}

/// Names every listing after its position; chosen positions fail to parse
#[derive(Default)]
pub struct IndexParser {
    pub fail_on: HashSet<usize>,
}

impl IndexParser {
    pub fn failing(positions: impl IntoIterator<Item = usize>) -> Self {
        Self {
            fail_on: positions.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ListingParser for IndexParser {
    async fn parse(&self, _page: &PageHandle, item: ItemRef) -> Result<ListingRecord, ParseError> {
        if self.fail_on.contains(&item.0) {
            return Err(ParseError::new(item.0, "missing name element"));
        }
        Ok(ListingRecord::named(format!("listing-{}", item.0)))
    }
}

/// Numbered user agents, no pacing
#[derive(Default)]
pub struct CountingIdentity {
    issued: AtomicUsize,
}

impl IdentityProvider for CountingIdentity {
    fn next_identity(&self) -> Identity {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Identity {
            user_agent: format!("agent/{n}"),
            pacing: None,
        }
    }
}

pub fn validated(host: &str, latency_ms: u64) -> ValidatedProxy {
    ValidatedProxy::new(
        ProxyCandidate::new(host, 8080, ProxyType::Http),
        latency_ms,
        AnonymityLevel::Elite,
    )
}

/// Serves canned bodies keyed by source URL
#[derive(Default)]
pub struct StaticFetcher {
    pub bodies: HashMap<String, Result<String, String>>,
}

impl StaticFetcher {
    pub fn with(mut self, url: &str, body: Result<&str, &str>) -> Self {
        self.bodies
            .insert(url.to_string(), body.map(str::to_string).map_err(str::to_string));
        self
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, source: &ProxySource) -> listing_harvester::Result<String> {
        match self.bodies.get(&source.url) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(e)) => Err(anyhow::anyhow!("{e}")),
            None => Err(anyhow::anyhow!("no route for {}", source.url)),
        }
    }
}

/// Answers after a per-host delay; unknown hosts refuse the connection
pub struct ScriptedProber {
    pub real_ip: String,
    pub delays: HashMap<String, Duration>,
    pub headers: HashMap<String, Vec<(String, String)>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedProber {
    pub fn new(real_ip: &str) -> Self {
        Self {
            real_ip: real_ip.to_string(),
            delays: HashMap::new(),
            headers: HashMap::new(),
            in_flight: Arc::default(),
            peak: Arc::default(),
        }
    }

    /// Highest number of requests ever in flight at once
    pub fn peak(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }

    pub fn answers(mut self, host: &str, delay: Duration) -> Self {
        self.delays.insert(host.to_string(), delay);
        self
    }

    pub fn forwards(mut self, host: &str, name: &str, value: &str) -> Self {
        self.headers
            .entry(host.to_string())
            .or_default()
            .push((name.to_string(), value.to_string()));
        self
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(
        &self,
        candidate: &ProxyCandidate,
        _test_url: &str,
        _timeout: Duration,
    ) -> Result<ProbeObservation, ProbeError> {
        let Some(delay) = self.delays.get(&candidate.host) else {
            return Err(ProbeError::Malformed("connection refused".to_string()));
        };
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(*delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ProbeObservation {
            origin: candidate.host.clone(),
            headers: self
                .headers
                .get(&candidate.host)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect(),
        })
    }

    async fn real_ip(&self, _test_url: &str, _timeout: Duration) -> Result<String, ProbeError> {
        Ok(self.real_ip.clone())
    }
}
