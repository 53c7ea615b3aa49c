//! Gateway Daemon - JSONL Inference Pipeline
//!
//! Entry point that assembles the inference gateway from configuration and
//! streams submissions through it: one JSON request per stdin line, one JSON
//! result per stdout line. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Default config ($XDG_CONFIG_HOME/inference-gateway/gateway.toml)
//! gateway-daemon < filings.jsonl > verdicts.jsonl
//!
//! # Explicit config and persistent dead letters
//! gateway-daemon --config ./gateway.toml --dead-letter ./dead.jsonl
//!
//! # Tighter budget for this run
//! gateway-daemon --daily-budget-usd 1.5
//!
//! # Verbose logging
//! RUST_LOG=gateway_core=debug gateway-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop reading input, drain in-flight requests, exit

mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use gateway_core::config::{default_config_path, load_config_from_path};
use gateway_core::{ConfigOverrides, DeadLetterSink, Gateway, GatewayConfig, JsonlDeadLetterSink};

use pipeline::Pipeline;

/// Gateway Daemon - routes sentiment requests across inference backends
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Append dead-lettered requests to this JSONL file
    #[arg(long, env = "GATEWAY_DEAD_LETTER", value_name = "FILE")]
    dead_letter: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Override the daily budget for metered backends
    #[arg(long, value_name = "USD")]
    daily_budget_usd: Option<f64>,

    /// Override the attempt limit per request
    #[arg(long, value_name = "N")]
    max_attempts: Option<u32>,

    /// Override the cache similarity threshold
    #[arg(long, value_name = "RATIO")]
    similarity_threshold: Option<f32>,

    /// Deadline for lines without `deadline_ms`
    #[arg(long, default_value_t = 30_000, value_name = "MS")]
    deadline_ms: u64,

    /// Do not probe backends at startup
    #[arg(long)]
    skip_health_check: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(usd) = self.daily_budget_usd {
            overrides = overrides.with_daily_budget_usd(usd);
        }
        if let Some(attempts) = self.max_attempts {
            overrides = overrides.with_max_attempts(attempts);
        }
        if let Some(threshold) = self.similarity_threshold {
            overrides = overrides.with_similarity_threshold(threshold);
        }
        overrides
    }
}

/// File, then environment, then command line
fn resolve_config(args: &Args) -> Result<GatewayConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path.clone())
        .with_context(|| format!("Failed to load configuration from {path:?}"))?;
    args.overrides()
        .apply(&mut config)
        .context("Invalid command-line override")?;

    if config.backends.is_empty() {
        anyhow::bail!("No backends configured; add [[backends]] entries to the config file");
    }
    Ok(config)
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("gateway_daemon={level},gateway_core={level}"))
    });

    // stdout carries results
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn stop_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            None
        }
    };
    let terminate = async {
        match sigterm.as_mut() {
            Some(sigterm) => {
                sigterm.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = interrupt => info!("Received SIGINT, stopping intake"),
        () = terminate => info!("Received SIGTERM, stopping intake"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("Gateway daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    info!(
        source = %config.source(),
        backends = config.backends.len(),
        "Configuration loaded"
    );

    let gateway = match &args.dead_letter {
        Some(path) => {
            let sink = JsonlDeadLetterSink::open(path)
                .await
                .with_context(|| format!("Failed to open dead-letter file {path:?}"))?;
            info!(path = ?path, "Dead letters persisted");
            Gateway::from_config_with_sink(&config, Arc::new(sink) as Arc<dyn DeadLetterSink>)?
        }
        None => {
            warn!("No --dead-letter file; dead letters are kept in memory only");
            Gateway::from_config(&config)?
        }
    };

    if !args.skip_health_check {
        let healthy = gateway
            .check_health()
            .await
            .into_iter()
            .filter(|(_, ok)| *ok)
            .count();
        if healthy == 0 {
            warn!("No backend reachable at startup; requests will wait or fail over");
        }
    }

    let pipeline = Pipeline::new(
        Arc::clone(&gateway.dispatcher),
        Duration::from_millis(args.deadline_ms),
    );
    let result = pipeline
        .run(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            stop_signal(),
        )
        .await;

    info!("Shutting down...");
    gateway.dispatcher.shutdown().await;

    let metrics = gateway.snapshot();
    let cache = gateway.cache.stats();
    info!(
        submitted = metrics.submitted,
        completed = metrics.completed,
        cache_hits = metrics.cache_hits,
        cache_misses = metrics.cache_misses,
        coalesced = metrics.coalesced,
        retries = metrics.retries,
        dead_lettered = metrics.dead_lettered,
        cancelled = metrics.cancelled,
        cache_entries = cache.entries,
        spent_today_usd = gateway.ledger.spent_today(),
        "Final metrics"
    );
    for backend in &metrics.backends {
        info!(
            backend = %backend.backend,
            calls = backend.calls,
            successes = backend.successes,
            failures = backend.failures,
            timeouts = backend.timeouts,
            peak_in_flight = backend.peak_in_flight,
            spend_usd = backend.spend_usd,
            "Backend metrics"
        );
    }

    match result {
        Ok(summary) => {
            info!(
                lines = summary.lines,
                invalid = summary.invalid,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "Gateway daemon stopped cleanly"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
