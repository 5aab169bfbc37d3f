//! gpugate daemon
//!
//! Loads the model configuration, starts the background lifecycle loops and
//! serves the OpenAI-compatible gateway.

use anyhow::{Context, Result};
use clap::Parser;
use gpugate_api::{create_router, ApiKeys, AppState, RequestRouter};
use gpugate_core::{DaemonConfig, LoggingConfig};
use gpugate_network::{HealthMonitor, WorkerProxy};
use gpugate_runtime::{ProcessHost, ProcessHostConfig};
use gpugate_scheduler::{
    AdmissionGate, AvailabilityScheduler, DefaultVariantPolicy, LifecycleManager, SystemClock,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// gpugate daemon - on-demand GPU model gateway
#[derive(Parser, Debug)]
#[command(name = "gpugated")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "/etc/gpugate/gpugate.toml")]
    config: PathBuf,

    /// Address to bind the API server (overrides config)
    #[arg(long)]
    address: Option<String>,

    /// Port for the API server (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Log level or filter directive (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: text or json (overrides config)
    #[arg(long)]
    log_format: Option<String>,
}

fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match config.format.as_str() {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = DaemonConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(address) = args.address {
        config.api.address = address;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_logging(&config.logging);

    info!("Starting gpugate daemon v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(config.registry()?);
    info!(models = registry.len(), names = ?registry.public_names(), "Loaded model registry");

    let host = Arc::new(ProcessHost::new(ProcessHostConfig {
        stop_grace: Duration::from_secs(config.runtime.stop_grace_secs),
        probe_timeout: config.health.probe_timeout(),
    })?);

    let lifecycle = Arc::new(LifecycleManager::new(
        registry.clone(),
        host,
        config.lifecycle.clone(),
        config.health.probe_timeout(),
    ));
    let availability = Arc::new(AvailabilityScheduler::new(
        registry.clone(),
        Arc::new(SystemClock::new(config.availability.clock)),
    ));
    let admission = Arc::new(AdmissionGate::new(&registry));
    let policy = Arc::new(DefaultVariantPolicy::new(config.routing.long_context_threshold));
    let proxy = WorkerProxy::new(config.routing.request_timeout())?;

    let router = RequestRouter::new(
        registry.clone(),
        availability.clone(),
        lifecycle.clone(),
        admission,
        policy,
        proxy,
        config.routing.clone(),
    );
    let state = Arc::new(AppState::new(router, lifecycle.clone()));
    let app = create_router(state, ApiKeys::new(config.api.keys.clone()), &config.api);

    let background = vec![
        lifecycle
            .clone()
            .spawn_idle_sweeper(config.lifecycle.idle_sweep_interval()),
        Arc::new(HealthMonitor::new(lifecycle.clone(), &config.health)).spawn(),
        availability.spawn_ticker(
            lifecycle.clone(),
            Duration::from_secs(config.availability.tick_interval_secs),
        ),
    ];

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid listen address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    for task in background {
        task.abort();
    }

    info!("Stopping workers");
    lifecycle.shutdown().await;
    info!("gpugate daemon stopped");

    Ok(())
}
