//! TrafficGuard CLI
//!
//! Command-line interface for the TrafficGuard traffic monitor.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trafficguard::collector::LineSource;
use trafficguard::monitor::Monitor;
use trafficguard::Config;

/// TrafficGuard - per-process network traffic alerts
#[derive(Parser)]
#[command(name = "trafficguard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "TRAFFICGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor
    Run {
        /// Read traffic records from this file or FIFO instead of stdin
        ///
        /// Reads from stdin or a FIFO block until the writer sends more data;
        /// on shutdown they are abandoned after a short grace period.
        #[arg(long)]
        events: Option<PathBuf>,
    },

    /// Validate the configuration and print the resolved values
    CheckConfig,
}

/// Grace period for blocking reads still parked on stdin or a FIFO
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::read(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    // validation warnings need the subscriber installed
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error starting runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Run { events } => runtime.block_on(run_monitor(config, events.as_deref())),
        Commands::CheckConfig => check_config(&config),
    };

    // stdin reads sit on a blocking thread that cancellation cannot reach
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if config.logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

async fn run_monitor(config: Config, events: Option<&Path>) -> anyhow::Result<()> {
    if let Some(addr) = config.metrics.prometheus_listen {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "Serving Prometheus metrics");
    }

    let monitor = Monitor::new(&config)?;
    spawn_signal_handler(monitor.cancel_token());

    info!(
        threshold_mb = config.rules.traffic_threshold_mb,
        time_window = %humantime::format_duration(config.rules.time_window),
        "TrafficGuard is running. Press Ctrl+C to exit."
    );

    let stats = match events {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            run_source(monitor, file).await?
        }
        None => run_source(monitor, tokio::io::stdin()).await?,
    };

    if stats.lost_samples > 0 {
        warn!(
            lost_samples = stats.lost_samples,
            "Upstream dropped samples; totals are a lower bound"
        );
    }
    info!("Shutdown complete.");
    Ok(())
}

async fn run_source<R>(
    monitor: Monitor,
    reader: R,
) -> trafficguard::Result<trafficguard::collector::SourceStats>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    monitor.run(LineSource::new(reader)).await
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, gracefully shutting down...");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, relying on Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
