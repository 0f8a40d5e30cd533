use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratelab::config::RatelabConfig;
use ratelab::ratelimit::{Algorithm, LimiterRegistry};
use ratelab::sink::DecisionLog;
use ratelab::store::RedisStore;

/// Drive one rate limiting algorithm with simulated traffic.
#[derive(Debug, Parser)]
#[command(name = "ratelab", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Algorithm to exercise
    #[arg(short, long, default_value_t = Algorithm::TokenBucket)]
    algorithm: Algorithm,

    /// Steady requests per second after the burst
    #[arg(long, default_value_t = 5.0)]
    rps: f64,

    /// Requests fired at once before steady traffic
    #[arg(long, default_value_t = 0)]
    burst: u32,

    /// Stop after this many seconds
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Client id keying shared store state
    #[arg(long)]
    client_id: Option<String>,

    /// Route decisions through the shared Redis store
    #[arg(long)]
    shared_store: bool,

    /// Redis URL, overriding the configuration file
    #[arg(long)]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let cli = Cli::parse();

    info!("Starting Ratelab simulator");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = RatelabConfig::load(cli.config.as_deref())?;
    if cli.shared_store {
        config.store.enabled = true;
    }
    if let Some(url) = cli.redis_url.clone() {
        config.store.redis_url = url;
    }
    info!(
        algorithm = %cli.algorithm,
        shared_store = config.store.enabled,
        "Configuration loaded"
    );

    let log = Arc::new(DecisionLog::new(config.log.capacity));
    let mut registry = LimiterRegistry::new(&config.limiters, log.clone());

    if config.store.enabled {
        match RedisStore::connect(&config.store.redis_url, config.store.timeout()).await {
            Ok(store) => {
                registry = registry.with_shared_store(Arc::new(store), config.store.shared_options());
            }
            Err(err) => {
                warn!(error = %err, "Shared store unreachable, running local limiters only");
            }
        }
    }
    let registry = Arc::new(registry);

    // Print every published decision, including leaked admissions
    let mut events = log.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(decision) => match serde_json::to_string(&decision) {
                    Ok(line) => println!("{}", line),
                    Err(err) => warn!(error = %err, "Failed to encode decision"),
                },
                Err(err) => warn!(error = %err, "Decision printer lagged"),
            }
        }
    });

    let traffic = run_traffic(
        registry.clone(),
        cli.algorithm,
        cli.burst,
        cli.rps,
        cli.client_id.clone(),
    );

    tokio::select! {
        _ = traffic => {}
        _ = tokio::time::sleep(Duration::from_secs(cli.duration_secs)) => {
            info!(duration_secs = cli.duration_secs, "Simulation finished");
        }
        _ = shutdown_signal() => {}
    }

    registry.shutdown();
    printer.abort();

    let mut totals: BTreeMap<String, usize> = BTreeMap::new();
    for decision in log.entries() {
        *totals.entry(format!("{:?}", decision.status()).to_lowercase()).or_default() += 1;
    }
    info!(totals = ?totals, fallbacks = registry.fallback_count(), "Decision totals");

    println!("{}", serde_json::to_string_pretty(&registry.states())?);

    info!("Ratelab simulator stopped");
    Ok(())
}

/// Fire `burst` requests at once, then `rps` requests per second until
/// cancelled.
async fn run_traffic(
    registry: Arc<LimiterRegistry>,
    algorithm: Algorithm,
    burst: u32,
    rps: f64,
    client_id: Option<String>,
) {
    let client_id = client_id.as_deref();
    for _ in 0..burst {
        registry.decide(algorithm, None, client_id).await;
    }

    if !rps.is_finite() || rps <= 0.0 {
        std::future::pending::<()>().await;
    }

    let period = Duration::from_secs_f64(1.0 / rps).max(Duration::from_micros(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        registry.decide(algorithm, None, client_id).await;
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
