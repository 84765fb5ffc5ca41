use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hivegate::config::{HivegateConfig, LogFormat};
use hivegate::events::{EventEmitter, LogSink};
use hivegate::ratelimit::{
    DistributedRateLimiter, LocalRateLimiter, PolicyResolver, PolicySet, PolicyWatcher,
    PrincipalTier, RateLimiter, SubjectInput,
};
use hivegate::response::rate_limit_headers;
use hivegate::store::{CounterStore, MemoryStore, RedisStore, RedisStoreConfig};

/// Smallest connect timeout used for the store, whatever the request timeout.
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "hivegate", version, about = "Distributed request rate limiting")]
struct Cli {
    /// Configuration file (YAML); HIVEGATE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate a policy file, then print the effective policies
    Validate {
        #[arg(long)]
        policy: PathBuf,
    },
    /// Run requests through the limiter and print each decision
    Simulate {
        #[arg(long)]
        principal: String,
        #[arg(long, default_value = "user")]
        tier: PrincipalTier,
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        cost: Option<f64>,
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
    },
    /// Check that the configured store is reachable
    Probe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = HivegateConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Validate { policy } => validate(policy),
        Command::Simulate {
            principal,
            tier,
            service,
            endpoint,
            cost,
            count,
            concurrency,
        } => {
            let mut input = SubjectInput::new(principal, tier);
            if let Some(service) = service {
                input = input.with_service(service);
            }
            if let Some(endpoint) = endpoint {
                input = input.with_endpoint(endpoint);
            }
            if let Some(cost) = cost {
                input = input.with_cost(cost);
            }
            simulate(&config, input, count, concurrency).await
        }
        Command::Probe => probe(&config).await,
    }
}

fn init_tracing(config: &HivegateConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Logs go to stderr so stdout stays machine-readable.
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let policies = PolicySet::from_file(&path)
        .with_context(|| format!("invalid policy file {}", path.display()))?;

    for tier in PrincipalTier::ALL {
        println!("{}", serde_json::to_string(&policies.tier(tier))?);
    }
    for (tag, rule) in policies.services() {
        println!(
            "{}",
            json!({ "service": tag, "multiplier": rule.multiplier, "cost_multiplier": rule.cost_multiplier })
        );
    }
    for (_, policy) in policies.endpoints() {
        println!("{}", serde_json::to_string(policy)?);
    }

    info!(path = %path.display(), "Policy file is valid");
    Ok(())
}

async fn redis_store(config: &HivegateConfig, url: &str) -> anyhow::Result<Arc<dyn CounterStore>> {
    let store = RedisStore::connect(RedisStoreConfig {
        url: url.to_string(),
        key_prefix: config.store.key_prefix.clone(),
        connect_timeout: config.store.timeout().max(MIN_CONNECT_TIMEOUT),
    })
    .await?;
    Ok(Arc::new(store))
}

/// Assemble the facade from configuration.
///
/// Without a store URL the facade runs local-only, unless `memory_fallback`
/// asks for an in-process shared store instead.
async fn build_limiter(
    config: &HivegateConfig,
    memory_fallback: bool,
) -> anyhow::Result<Arc<RateLimiter>> {
    let policies = match &config.policy.path {
        Some(path) => PolicySet::from_file(path)
            .with_context(|| format!("invalid policy file {}", path))?,
        None => PolicySet::builtin(),
    };
    let resolver = Arc::new(PolicyResolver::new(policies));
    let local = Arc::new(LocalRateLimiter::new(config.local.max_subjects));

    let events = if config.events.enabled {
        EventEmitter::spawn(Arc::new(LogSink), config.events.buffer_size)
    } else {
        EventEmitter::disabled()
    };

    let store: Option<Arc<dyn CounterStore>> = match &config.store.url {
        Some(url) => Some(redis_store(config, url).await?),
        None if memory_fallback => Some(Arc::new(MemoryStore::new())),
        None => None,
    };

    let limiter = match store {
        Some(store) => {
            info!(store = store.name(), "Using shared counter store");
            let distributed = DistributedRateLimiter::with_timeout(store, config.store.timeout());
            RateLimiter::new(resolver, distributed, local, events)
        }
        None => {
            warn!("No counter store configured, limits are enforced per process");
            RateLimiter::local_only(resolver, local, events)
        }
    };
    Ok(Arc::new(limiter))
}

/// Start the sweeper, the health probe and, if configured, the policy watcher.
fn spawn_background(limiter: &Arc<RateLimiter>, config: &HivegateConfig) -> Vec<JoinHandle<()>> {
    let mut tasks = vec![limiter
        .local()
        .spawn_sweeper(Duration::from_secs(config.local.sweep_interval_secs))];

    if let Some(probe) = limiter.spawn_health_probe(config.store.probe_interval()) {
        tasks.push(probe);
    }

    let interval = config.policy.reload_interval_secs;
    if let Some(path) = config.policy.path.as_ref().filter(|_| interval > 0) {
        let watcher = PolicyWatcher::new(
            Arc::clone(limiter.resolver()),
            path,
            Duration::from_secs(interval),
        );
        tasks.push(watcher.spawn());
    }
    tasks
}

async fn simulate(
    config: &HivegateConfig,
    input: SubjectInput,
    count: usize,
    concurrency: usize,
) -> anyhow::Result<()> {
    if concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }

    let limiter = build_limiter(config, true).await?;
    let tasks = spawn_background(&limiter, config);

    let mut seq = 0usize;
    let mut allowed = 0usize;
    while seq < count {
        let batch = concurrency.min(count - seq);
        let decisions = join_all((0..batch).map(|_| limiter.evaluate(&input))).await;

        for decision in decisions {
            seq += 1;
            if decision.allowed {
                allowed += 1;
            }
            let headers: BTreeMap<String, String> = rate_limit_headers(&decision)
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();
            println!(
                "{}",
                json!({ "seq": seq, "decision": decision, "headers": headers })
            );
        }
    }

    let health = limiter.health();
    info!(
        requests = count,
        allowed,
        rejected = count - allowed,
        state = %health.state,
        events_dropped = limiter.events().dropped(),
        "Simulation finished"
    );

    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn probe(config: &HivegateConfig) -> anyhow::Result<()> {
    let Some(url) = &config.store.url else {
        println!("{}", json!({ "store": null, "state": "DEGRADED" }));
        bail!("no counter store configured (set store.url or HIVEGATE__STORE__URL)");
    };

    let store = redis_store(config, url).await?;
    let limiter = DistributedRateLimiter::with_timeout(store, config.store.timeout());

    match limiter.ping().await {
        Ok(()) => {
            println!("{}", json!({ "store": limiter.store_name(), "state": "HEALTHY" }));
            Ok(())
        }
        Err(e) => {
            println!(
                "{}",
                json!({ "store": limiter.store_name(), "state": "DEGRADED", "error": e.to_string() })
            );
            Err(e).context("counter store is unreachable")
        }
    }
}
