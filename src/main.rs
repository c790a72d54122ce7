use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keygate::config::AppConfig;
use keygate::ratelimit::{KeyedLimiterRegistry, ManualClock, OverrideRules, Sweeper};
use keygate::simulate::{self, LoadPattern};

/// Drive a keygate limiter with synthetic traffic and report the outcome.
#[derive(Parser, Debug)]
#[command(name = "keygate", version, about)]
struct Args {
    /// Configuration file (YAML); `KEYGATE__*` environment variables override it
    #[arg(short, long)]
    config: Option<String>,

    /// Ignore `KEYGATE__*` environment variables and read only the config file
    #[arg(long)]
    no_env: bool,

    /// Per-key override rules (YAML)
    #[arg(long)]
    overrides: Option<String>,

    /// Arrival pattern
    #[arg(long, value_enum)]
    pattern: Option<LoadPattern>,

    /// Simulated duration in seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Number of distinct keys
    #[arg(long)]
    keys: Option<usize>,

    /// RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("Starting Keygate load simulation");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match (args.no_env, args.config.as_deref()) {
        (true, Some(path)) => AppConfig::from_file(path)?,
        (true, None) => AppConfig::default(),
        (false, path) => AppConfig::load(path)?,
    };
    if let Some(pattern) = args.pattern {
        config.simulation.pattern = pattern;
    }
    if let Some(duration_secs) = args.duration_secs {
        config.simulation.duration_secs = duration_secs;
    }
    if let Some(keys) = args.keys {
        config.simulation.keys = keys;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    info!(
        window_ms = config.limiter.window_ms,
        base_limit = config.limiter.base_limit,
        adaptive = config.limiter.adaptive,
        "Configuration loaded"
    );

    let overrides = match args.overrides.as_deref().or(config.overrides_path.as_deref()) {
        Some(path) => OverrideRules::from_file(path)?,
        None => OverrideRules::new(),
    };

    // Simulated time: the run finishes as fast as the CPU allows
    let clock = ManualClock::new(Instant::now());
    let registry = Arc::new(KeyedLimiterRegistry::with_overrides(
        config.limiter.clone(),
        Arc::new(clock.clone()),
        overrides,
    )?);
    info!("Limiter registry initialized");

    let sweeper = if config.sweeper.enabled && config.limiter.idle_ttl().is_some() {
        Some(Sweeper::spawn(Arc::clone(&registry), config.sweeper.interval())?)
    } else {
        None
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let mut simulation = {
        let registry = Arc::clone(&registry);
        let cancel = Arc::clone(&cancel);
        let sim_config = config.simulation.clone();
        tokio::task::spawn_blocking(move || {
            simulate::run(registry.as_ref(), &clock, &sim_config, &cancel)
        })
    };

    let report = tokio::select! {
        report = &mut simulation => report?,
        _ = shutdown_signal() => {
            cancel.store(true, Ordering::Relaxed);
            simulation.await?
        }
    };

    if let Some(sweeper) = sweeper {
        let evicted = sweeper.shutdown().await;
        info!(evicted = evicted, "Sweeper stopped");
    }

    if report.cancelled {
        warn!("Simulation cancelled before completion");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            pattern = %report.pattern,
            requests = report.requests,
            admitted = report.admitted,
            rejected = report.rejected,
            admission_ratio = report.admission_ratio(),
            "Simulation complete"
        );
        for key in &report.keys {
            info!(
                key = %key.key,
                admitted = key.admitted,
                rejected = key.rejected,
                limit = key.final_limit,
                estimate = key.final_estimate,
                "Key summary"
            );
        }
    }

    info!(keys = registry.len(), "Keygate stopped");
    Ok(())
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
            info!("Received Ctrl+C, cancelling simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling simulation");
        }
    }
}
