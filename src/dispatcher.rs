//! Runs a batch of queries across a bounded pool of workers
//!
//! Workers pull queries from a FIFO backlog and drive one session at a
//! time, each with its own driver. All workers share the proxy pool.

use crate::error::ConfigError;
use crate::proxy::pool::ProxyPool;
use crate::proxy::replenish::Replenisher;
use crate::session::collaborators::{BrowserFactory, IdentityProvider, ListingParser};
use crate::session::identity::RandomIdentity;
use crate::session::machine::{
    FailureReason, ScrapeSession, SearchQuery, SessionConfig, SessionContext, SessionResult,
    SessionStatus,
};
use chrono::Local;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Per-query outcomes of a batch
pub type BatchResults = HashMap<SearchQuery, SessionResult>;

/// True when the batch is non-empty and no query succeeded
pub fn all_failed(results: &BatchResults) -> bool {
    !results.is_empty() && results.values().all(|r| r.status == SessionStatus::Failed)
}

/// Process exit code for a batch: non-zero only if every query failed
pub fn exit_code(results: &BatchResults) -> i32 {
    if all_failed(results) {
        1
    } else {
        0
    }
}

fn unstarted(query: SearchQuery, reason: FailureReason) -> SessionResult {
    let now = Local::now();
    SessionResult {
        session_id: Uuid::new_v4(),
        query,
        status: SessionStatus::Failed,
        results: Vec::new(),
        reason: Some(reason),
        attempt_count: 0,
        proxies_used: 0,
        parse_failures: Vec::new(),
        history: vec![SessionStatus::Init, SessionStatus::Failed],
        started_at: now,
        finished_at: now,
    }
}

/// Owns the shared resources of a batch run
pub struct Dispatcher<B: BrowserFactory> {
    factory: Arc<B>,
    parser: Arc<dyn ListingParser>,
    identities: Arc<dyn IdentityProvider>,
    pool: Option<Arc<ProxyPool>>,
    replenisher: Option<Arc<dyn Replenisher>>,
    session_config: Arc<SessionConfig>,
    overall_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl<B: BrowserFactory + 'static> Dispatcher<B> {
    pub fn new(factory: B, parser: Arc<dyn ListingParser>, session_config: SessionConfig) -> Self {
        Self {
            factory: Arc::new(factory),
            parser,
            identities: Arc::new(RandomIdentity::default()),
            pool: None,
            replenisher: None,
            session_config: Arc::new(session_config),
            overall_timeout: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Route sessions through `pool`; without one, sessions run direct
    pub fn with_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_replenisher(mut self, replenisher: Arc<dyn Replenisher>) -> Self {
        self.replenisher = Some(replenisher);
        self
    }

    pub fn with_identities(mut self, identities: Arc<dyn IdentityProvider>) -> Self {
        self.identities = identities;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.overall_timeout = timeout;
        self
    }

    /// Cancelling this token aborts in-flight sessions
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn pool(&self) -> Option<&Arc<ProxyPool>> {
        self.pool.as_ref()
    }

    /// Drive every query to a terminal state
    ///
    /// Returns once the backlog is drained and all workers are idle. A
    /// failed session never stops the others.
    pub async fn run(&self, queries: Vec<SearchQuery>, worker_count: usize) -> Result<BatchResults, ConfigError> {
        if worker_count == 0 {
            return Err(ConfigError::NotPositive {
                field: "dispatcher.worker_count",
            });
        }
        self.session_config.validate()?;

        let total = queries.len();
        let workers = worker_count.min(total.max(1));
        info!(queries = total, workers, "dispatching batch");

        let backlog = Arc::new(Mutex::new(VecDeque::from(queries)));
        let cancel = self.shutdown.child_token();
        let deadline = self.overall_timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(?timeout, "batch timeout reached, cancelling sessions");
                cancel.cancel();
            })
        });

        let results = Arc::new(Mutex::new(BatchResults::with_capacity(total)));
        let in_flight = Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let shared = Shared {
                backlog: Arc::clone(&backlog),
                results: Arc::clone(&results),
                in_flight: Arc::clone(&in_flight),
            };
            tasks.spawn(self.worker(worker, shared, cancel.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
            }
        }
        if let Some(deadline) = deadline {
            deadline.abort();
        }

        let mut results = std::mem::take(&mut *results.lock());
        // Sessions that were running when their worker panicked
        for (worker, query) in in_flight.lock().drain() {
            error!(worker, query = %query, "session lost with its worker");
            results
                .entry(query.clone())
                .or_insert_with(|| unstarted(query, FailureReason::WorkerFailed));
        }

        // Queries nobody got to: the run was cancelled or every worker died
        let leftover_reason = if cancel.is_cancelled() {
            FailureReason::Cancelled
        } else {
            FailureReason::WorkerFailed
        };
        let leftover: Vec<_> = backlog.lock().drain(..).collect();
        for query in leftover {
            results
                .entry(query.clone())
                .or_insert_with(|| unstarted(query, leftover_reason));
        }

        let done = results.values().filter(|r| r.is_done()).count();
        info!(done, failed = results.len() - done, "batch complete");
        Ok(results)
    }

    fn worker(
        &self,
        worker: usize,
        shared: Shared,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let factory = Arc::clone(&self.factory);
        let parser = Arc::clone(&self.parser);
        let identities = Arc::clone(&self.identities);
        let pool = self.pool.clone();
        let replenisher = self.replenisher.clone();
        let config = Arc::clone(&self.session_config);

        async move {
            let mut driver = match factory.create() {
                Ok(driver) => Some(driver),
                Err(e) => {
                    error!(worker, error = %e, "could not start browser");
                    None
                }
            };

            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let next = shared.backlog.lock().pop_front();
                let Some(query) = next else {
                    break;
                };

                let result = match driver.as_mut() {
                    Some(driver) => {
                        shared.in_flight.lock().insert(worker, query.clone());
                        let ctx = SessionContext {
                            config: config.as_ref(),
                            pool: pool.as_deref(),
                            replenisher: replenisher.as_deref(),
                            identities: identities.as_ref(),
                            parser: parser.as_ref(),
                        };
                        ScrapeSession::new(query.clone(), ctx, driver, cancel.child_token())
                            .run()
                            .await
                    }
                    None => unstarted(query.clone(), FailureReason::BrowserUnavailable),
                };
                shared.results.lock().insert(query, result);
                shared.in_flight.lock().remove(&worker);
            }
        }
    }
}

/// State every worker of one batch writes to
struct Shared {
    backlog: Arc<Mutex<VecDeque<SearchQuery>>>,
    results: Arc<Mutex<BatchResults>>,
    /// Query each worker is driving right now
    in_flight: Arc<Mutex<HashMap<usize, SearchQuery>>>,
}
