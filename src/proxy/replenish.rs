//! Re-harvest hook used by sessions when the pool runs dry

use crate::proxy::harvester::{ProxyHarvester, ProxySource, SourceFetcher};
use crate::proxy::pool::ProxyPool;
use crate::proxy::validator::{Prober, ProxyValidator};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

/// Produces fresh proxies into a pool
#[async_trait]
pub trait Replenisher: Send + Sync {
    /// Add proxies to `pool`, returning how many became available
    async fn replenish(&self, pool: &ProxyPool) -> usize;
}

/// Harvester followed by validator, feeding the pool
///
/// Concurrent callers are serialized; a caller that waited for another
/// refill skips its own when the pool already has proxies.
pub struct HarvestPipeline<F, P> {
    harvester: ProxyHarvester<F>,
    validator: ProxyValidator<P>,
    sources: Vec<ProxySource>,
    country_filter: Option<String>,
    running: Mutex<()>,
}

impl<F: SourceFetcher, P: Prober + 'static> HarvestPipeline<F, P> {
    pub fn new(
        harvester: ProxyHarvester<F>,
        validator: ProxyValidator<P>,
        sources: Vec<ProxySource>,
        country_filter: Option<String>,
    ) -> Self {
        Self {
            harvester,
            validator,
            sources,
            country_filter,
            running: Mutex::new(()),
        }
    }

    pub fn harvester(&self) -> &ProxyHarvester<F> {
        &self.harvester
    }

    pub fn validator(&self) -> &ProxyValidator<P> {
        &self.validator
    }

    pub fn sources(&self) -> &[ProxySource] {
        &self.sources
    }

    pub fn country_filter(&self) -> Option<&str> {
        self.country_filter.as_deref()
    }
}

#[async_trait]
impl<F: SourceFetcher, P: Prober + 'static> Replenisher for HarvestPipeline<F, P> {
    async fn replenish(&self, pool: &ProxyPool) -> usize {
        let _guard = self.running.lock().await;
        if pool.size().available > 0 {
            return 0;
        }

        info!("pool exhausted, re-harvesting proxies");
        let candidates = self
            .harvester
            .harvest(&self.sources, self.country_filter.as_deref())
            .await;
        if candidates.is_empty() {
            return 0;
        }
        let validated = self.validator.validate(candidates).await;
        let added = pool.extend(validated);
        info!(added, "pool replenished");
        added
    }
}
