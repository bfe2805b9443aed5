//! Shared registry of validated proxies
//!
//! Every known proxy identity is in exactly one of three sets:
//! `available`, `checked_out` or `blacklisted`. All transitions happen under
//! a single lock, so no two callers can hold the same checked-out identity.

use crate::error::{ConfigError, PoolError};
use crate::proxy::models::{ProxyId, ValidatedProxy};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default number of consecutive failures that evicts a proxy
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Set counts, for observability and re-harvest triggers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSize {
    pub available: usize,
    pub checked_out: usize,
    pub blacklisted: usize,
}

impl PoolSize {
    pub fn total(&self) -> usize {
        self.available + self.checked_out + self.blacklisted
    }
}

/// Which set an identity currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Available,
    CheckedOut,
    Blacklisted,
}

/// Where a failed proxy went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued { consecutive_failures: u32 },
    Blacklisted,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: HashMap<ProxyId, ValidatedProxy>,
    /// Ordered by `(latency_ms, identity)`
    available: BTreeSet<(u64, ProxyId)>,
    checked_out: HashSet<ProxyId>,
    blacklisted: HashSet<ProxyId>,
}

impl PoolState {
    fn size(&self) -> PoolSize {
        PoolSize {
            available: self.available.len(),
            checked_out: self.checked_out.len(),
            blacklisted: self.blacklisted.len(),
        }
    }

    fn make_available(&mut self, id: ProxyId) {
        if let Some(entry) = self.entries.get(&id) {
            self.available.insert(rank(entry));
        }
    }
}

fn rank(proxy: &ValidatedProxy) -> (u64, ProxyId) {
    (proxy.latency_ms, proxy.id())
}

/// Thread-safe proxy pool shared by all sessions of a run
#[derive(Debug)]
pub struct ProxyPool {
    state: Mutex<PoolState>,
    failure_threshold: u32,
    replenished: Notify,
}

impl ProxyPool {
    pub fn new(failure_threshold: u32) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::NotPositive {
                field: "pool.failure_threshold",
            });
        }
        Ok(Self {
            state: Mutex::new(PoolState::default()),
            failure_threshold,
            replenished: Notify::new(),
        })
    }

    pub fn with_proxies(
        failure_threshold: u32,
        proxies: impl IntoIterator<Item = ValidatedProxy>,
    ) -> Result<Self, ConfigError> {
        let pool = Self::new(failure_threshold)?;
        pool.extend(proxies);
        Ok(pool)
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Add validated proxies; identities already known (in any set) are ignored
    ///
    /// Returns how many entries became available.
    pub fn extend(&self, proxies: impl IntoIterator<Item = ValidatedProxy>) -> usize {
        let added = {
            let mut state = self.state.lock();
            let mut added = 0;
            for proxy in proxies {
                let id = proxy.id();
                if state.entries.contains_key(&id) {
                    continue;
                }
                state.available.insert(rank(&proxy));
                state.entries.insert(id, proxy);
                added += 1;
            }
            added
        };

        if added > 0 {
            debug!(added, "proxies added to pool");
            self.replenished.notify_waiters();
        }
        added
    }

    /// Take the lowest-latency available proxy, or `None` when exhausted
    pub fn checkout(&self) -> Option<ValidatedProxy> {
        let mut state = self.state.lock();
        let (_, id) = state.available.pop_first()?;
        state.checked_out.insert(id.clone());
        state.entries.get(&id).cloned()
    }

    /// Like [`checkout`](Self::checkout), skipping the `avoid` identities
    ///
    /// Falls back to the lowest-latency proxy when every available one is
    /// in `avoid`.
    pub fn checkout_excluding(&self, avoid: &HashSet<ProxyId>) -> Option<ValidatedProxy> {
        let mut state = self.state.lock();
        let key = state
            .available
            .iter()
            .find(|(_, id)| !avoid.contains(id))
            .or_else(|| state.available.first())
            .cloned()?;
        state.available.remove(&key);
        let (_, id) = key;
        state.checked_out.insert(id.clone());
        state.entries.get(&id).cloned()
    }

    /// Hand a proxy back after successful use
    pub fn return_success(&self, proxy: &ValidatedProxy) -> Result<(), PoolError> {
        let id = proxy.id();
        {
            let mut state = self.state.lock();
            if !state.checked_out.remove(&id) {
                return Err(PoolError::NotCheckedOut(id));
            }
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.consecutive_failures = 0;
            }
            state.make_available(id);
        }
        self.replenished.notify_waiters();
        Ok(())
    }

    /// Hand a proxy back after a failure
    ///
    /// The proxy is blacklisted for good once its consecutive failures reach
    /// the threshold; otherwise it becomes available again.
    pub fn return_failure(&self, proxy: &ValidatedProxy) -> Result<FailureOutcome, PoolError> {
        let id = proxy.id();
        let outcome = {
            let mut state = self.state.lock();
            if !state.checked_out.remove(&id) {
                return Err(PoolError::NotCheckedOut(id));
            }
            let failures = match state.entries.get_mut(&id) {
                Some(entry) => {
                    entry.consecutive_failures += 1;
                    entry.consecutive_failures
                }
                None => self.failure_threshold,
            };

            if failures >= self.failure_threshold {
                state.blacklisted.insert(id.clone());
                FailureOutcome::Blacklisted
            } else {
                state.make_available(id.clone());
                FailureOutcome::Requeued {
                    consecutive_failures: failures,
                }
            }
        };

        match outcome {
            FailureOutcome::Blacklisted => warn!(proxy = %id, "proxy blacklisted"),
            FailureOutcome::Requeued { consecutive_failures } => {
                debug!(proxy = %id, consecutive_failures, "proxy requeued after failure");
                self.replenished.notify_waiters();
            }
        }
        Ok(outcome)
    }

    pub fn size(&self) -> PoolSize {
        self.state.lock().size()
    }

    pub fn membership(&self, id: &ProxyId) -> Option<Membership> {
        let state = self.state.lock();
        if state.checked_out.contains(id) {
            Some(Membership::CheckedOut)
        } else if state.blacklisted.contains(id) {
            Some(Membership::Blacklisted)
        } else if state.entries.contains_key(id) {
            Some(Membership::Available)
        } else {
            None
        }
    }

    /// Available and checked-out proxies, fastest first
    pub fn working(&self) -> Vec<ValidatedProxy> {
        let state = self.state.lock();
        let mut proxies: Vec<_> = state
            .entries
            .iter()
            .filter(|(id, _)| !state.blacklisted.contains(*id))
            .map(|(_, proxy)| proxy.clone())
            .collect();
        proxies.sort_by_key(|proxy| proxy.latency_ms);
        proxies
    }

    pub fn blacklisted(&self) -> Vec<ValidatedProxy> {
        let state = self.state.lock();
        state
            .blacklisted
            .iter()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect()
    }

    /// Wait until at least one proxy is available or `timeout` elapses
    pub async fn wait_for_available(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.replenished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.size().available > 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let available = self.size().available > 0;
                if !available {
                    info!(?timeout, "timed out waiting for proxies");
                }
                return available;
            }
        }
    }
}
