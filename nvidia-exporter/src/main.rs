//! Prometheus exporter for NVIDIA GPUs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use nvidia_exporter::logging::init_tracing;
use nvidia_exporter::{
    DeviceCollector, ExporterConfig, ExporterError, GpuMetrics, HttpServer, NvmlQuery, Sampler,
    SystemProcessNames,
};

/// Prometheus exporter for NVIDIA GPUs.
#[derive(Parser, Debug)]
#[command(name = "nvidia-exporter")]
#[command(about = "Export NVIDIA GPU telemetry as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config and EXPORTER_PORT).
    #[arg(long)]
    listen: Option<String>,

    /// Polling interval in seconds (overrides config and POLLING_INTERVAL_SECONDS).
    #[arg(long)]
    interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    let result = runtime.block_on(run(args));

    // A cycle stuck inside the driver would otherwise hold up process exit.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

fn load_config(args: &Args) -> anyhow::Result<ExporterConfig> {
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)
            .with_context(|| format!("Failed to load {}", config_path))?
    } else {
        ExporterConfig::default()
    };

    config.apply_env()?;

    if let Some(listen) = &args.listen {
        config.prometheus.listen = listen.clone();
    }
    if let Some(interval) = args.interval {
        config.sampling.polling_interval_secs = interval;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    init_tracing(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.prometheus.listen,
        path = %config.prometheus.path,
        interval_secs = config.sampling.polling_interval_secs,
        "Starting NVIDIA Prometheus exporter"
    );

    let metrics = Arc::new(GpuMetrics::new(&config.prometheus.prefix));

    let mut collector =
        DeviceCollector::new(NvmlQuery::new(), SystemProcessNames::new(), metrics.clone());
    collector.init()?;

    let http_server = HttpServer::bind(
        metrics.clone(),
        config.listen_addr()?,
        config.prometheus.path.clone(),
    )
    .await?;

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sampler = Sampler::new(collector, &config.sampling);
    let mut sampler_task = tokio::spawn(sampler.run(shutdown_rx.clone()));
    let mut http_task = tokio::spawn(http_server.run(shutdown_rx));

    let result = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        res = &mut sampler_task => task_result("Sampler", res),
        res = &mut http_task => task_result("HTTP server", res),
    };

    // Signal shutdown; receivers may already be gone if a task exited.
    let _ = shutdown_tx.send(true);

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), async move {
        if !sampler_task.is_finished() {
            let _ = sampler_task.await;
        }
        if !http_task.is_finished() {
            let _ = http_task.await;
        }
    })
    .await;

    info!("Exporter stopped");
    result
}

fn task_result(
    name: &str,
    res: Result<Result<(), ExporterError>, JoinError>,
) -> anyhow::Result<()> {
    match res {
        Ok(Ok(())) => {
            warn!("{} exited unexpectedly", name);
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "{} failed", name);
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("{} task panicked: {}", name, e)),
    }
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
