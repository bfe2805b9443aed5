use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use listing_harvester::{
    browser::{HttpBrowserFactory, PatternParser},
    config::AppConfig,
    dispatcher::{exit_code, Dispatcher},
    error::PersistError,
    persistence,
    proxy::{
        harvester::{retain_country, ALL_COUNTRIES}, AnonymityFilter, HarvestPipeline, HttpFetcher, HttpProber,
        ProxyHarvester, ProxyParser, ProxyPool, ProxyType, ProxyValidator,
    },
    session::{ListingParser, SearchQuery},
};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Scrape business listings through a pool of rotating free proxies
#[derive(Parser)]
#[command(name = "listing-harvester")]
#[command(about = "Scrape business listings through a pool of rotating free proxies")]
struct Cli {
    /// Search query, e.g. "coffee shops"
    query: Option<String>,

    /// Location appended to the query
    #[arg(short, long)]
    location: Option<String>,

    /// Maximum listings per query (0 for no limit)
    #[arg(short, long)]
    max_results: Option<usize>,

    /// Route sessions through harvested proxies
    #[arg(long)]
    use_proxy: bool,

    /// Load proxy candidates from a file instead of harvesting
    #[arg(long)]
    proxy_file: Option<PathBuf>,

    /// Minimum anonymity (elite, anonymous, all)
    #[arg(long)]
    proxy_type: Option<String>,

    /// Harvest and validate proxies, save them, and exit
    #[arg(long)]
    harvest_only: bool,

    /// Keep proxies from this country code only (ALL disables filtering)
    #[arg(long)]
    country_filter: Option<String>,

    /// File with one query per line, optionally "query | location"
    #[arg(short = 'f', long)]
    queries_file: Option<PathBuf>,

    /// Number of parallel sessions
    #[arg(short = 'n', long)]
    threads: Option<usize>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for result files
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) -> Result<()> {
        if let Some(max_results) = self.max_results {
            config.session.max_results = max_results;
        }
        if let Some(proxy_type) = &self.proxy_type {
            config.validator.anonymity = AnonymityFilter::from_str(proxy_type).map_err(|e| anyhow!(e))?;
        }
        if let Some(country) = &self.country_filter {
            config.harvest.country_filter = country.clone();
        }
        if let Some(threads) = self.threads {
            config.dispatcher.worker_count = threads;
        }
        if let Some(dir) = &self.output_dir {
            config.output.dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.output.log_level = level.clone();
        }
        Ok(())
    }

    fn queries(&self) -> Result<Vec<SearchQuery>> {
        if let Some(path) = &self.queries_file {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read queries file {}", path.display()))?;
            return Ok(content.lines().filter_map(SearchQuery::from_line).collect());
        }
        Ok(self
            .query
            .iter()
            .filter(|q| !q.trim().is_empty())
            .map(|q| SearchQuery::new(q.trim(), self.location.clone()))
            .collect())
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    cli.apply(&mut config)?;
    init_tracing(&config.output.log_level);
    config.validate()?;

    let queries = cli.queries()?;
    if queries.is_empty() && !cli.harvest_only {
        bail!("no search query given; pass a query or --queries-file");
    }

    let country = config.country_filter().map(str::to_string);
    let country_label = country.clone().unwrap_or_else(|| ALL_COUNTRIES.to_string());

    let mut pool = None;
    let mut replenisher = None;
    if cli.use_proxy || cli.harvest_only {
        let validator = ProxyValidator::new(config.validator_config(), HttpProber)?;
        let harvester = ProxyHarvester::new(HttpFetcher::with_timeout(Duration::from_secs(
            config.harvest.fetch_timeout_secs,
        ))?);

        let candidates = match &cli.proxy_file {
            Some(path) => {
                let loaded = ProxyParser::parse_file(path, ProxyType::Http)?;
                retain_country(loaded, country.as_deref())
            }
            None => {
                harvester
                    .harvest(&config.harvest.sources, country.as_deref())
                    .await
            }
        };
        println!("Harvested {} proxy candidates", candidates.len());

        let validated = validator.validate(candidates).await;
        println!("Validated {} working proxies", validated.len());
        for proxy in validated.iter().take(10) {
            println!("  {proxy}");
        }

        let shared = Arc::new(ProxyPool::with_proxies(config.pool.failure_threshold, validated)?);

        if cli.harvest_only {
            match persistence::save_proxies(&shared.working(), &shared.blacklisted(), &country_label, &config.output.dir) {
                Ok(path) => println!("Saved working proxies to {}", path.display()),
                Err(PersistError::Empty(_)) => println!("No working proxies to save"),
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        if shared.size().available == 0 {
            warn!("starting without working proxies; sessions will wait for a re-harvest");
        }
        if cli.proxy_file.is_none() {
            replenisher = Some(Arc::new(HarvestPipeline::new(
                harvester,
                validator,
                config.harvest.sources.clone(),
                country.clone(),
            )));
        }
        pool = Some(shared);
    }

    let factory = HttpBrowserFactory {
        config: config.browser_config(),
    };
    let parser: Arc<dyn ListingParser> = Arc::new(PatternParser);
    let mut dispatcher = Dispatcher::new(factory, parser, config.session_config())
        .with_overall_timeout(config.overall_timeout());
    if let Some(pool) = &pool {
        dispatcher = dispatcher.with_pool(Arc::clone(pool));
    }
    if let Some(replenisher) = replenisher {
        dispatcher = dispatcher.with_replenisher(replenisher);
    }

    let shutdown = dispatcher.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling sessions");
            shutdown.cancel();
        }
    });

    let results = dispatcher
        .run(queries.clone(), config.dispatcher.worker_count)
        .await?;

    println!();
    println!("{} queries processed", results.len());
    for query in &queries {
        let Some(result) = results.get(query) else {
            continue;
        };
        let reason = result.reason.map(|r| format!(" ({r})")).unwrap_or_default();
        println!(
            "  {} -> {:?}{}: {} listings, {} attempts, {} proxies",
            query,
            result.status,
            reason,
            result.results.len(),
            result.attempt_count,
            result.proxies_used
        );
        match persistence::save(result, &config.output.dir) {
            Ok(path) => println!("    saved to {}", path.display()),
            Err(PersistError::Empty(_)) => {}
            Err(e) => warn!(query = %query, error = %e, "failed to save listings"),
        }
    }

    if let Some(pool) = &pool {
        let size = pool.size();
        info!(
            available = size.available,
            blacklisted = size.blacklisted,
            "final pool state"
        );
    }

    let code = exit_code(&results);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
