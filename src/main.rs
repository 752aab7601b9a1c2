//! rosterd - registry control plane daemon.

use rosterd::bus::memory::InProcessBus;
use rosterd::clock::SystemClock;
use rosterd::config::Config;
use rosterd::netconfig::store::{MemoryStore, ProfileStore, SqliteStore};
use rosterd::supervisor::{Supervisor, SupervisorParams};
use rosterd::{http, metrics};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `rosterd.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "rosterd.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (before tracing, so we can use log_format).
    // A missing file means defaults; ops runs plenty of cores that way.
    let config_path = resolve_config_path();
    let config = if Path::new(&config_path).exists() {
        Config::load(&config_path).map_err(|e| {
            eprintln!("ERROR: Failed to load config from {}: {}", config_path, e);
            e
        })?
    } else {
        Config::default()
    };

    // Initialize tracing based on config
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match config.server.log_format {
        rosterd::config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        rosterd::config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    // Validate configuration
    if let Err(errors) = rosterd::config::validate(&config) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    info!(
        name = %config.server.name,
        soft_timeout_secs = config.registry.soft_timeout_secs,
        hard_timeout_secs = config.registry.hard_timeout_secs,
        "Starting rosterd"
    );

    // Profile catalog: SQLite when configured, otherwise in-memory (seeded
    // with the bundled default on first touch).
    let store: Arc<dyn ProfileStore> = match &config.database {
        Some(db) => {
            let store = SqliteStore::connect(&db.path).await?;
            info!(path = %db.path, "Profile catalog opened");
            Arc::new(store)
        }
        None => {
            info!("No database configured, using in-memory profile catalog");
            Arc::new(MemoryStore::new())
        }
    };

    // The bus transport is pluggable behind the Bus trait; the in-process
    // bus serves single-host deployments and embedded nodes.
    let bus = Arc::new(InProcessBus::new());
    let clock = Arc::new(SystemClock::new());

    let metrics_port = config.server.metrics_port;
    let supervisor = Supervisor::new(SupervisorParams {
        config,
        bus,
        clock,
        store,
    });
    info!("Supervisor initialized");

    // Spawn signal handler for graceful shutdown
    {
        let shutdown_tx = supervisor.shutdown_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT - initiating graceful shutdown"),
                _ = sigterm.recv() => info!("Received SIGTERM - initiating graceful shutdown"),
            }

            let _ = shutdown_tx.send(());
        });
    }

    // Prometheus metrics are optional.
    // Convention: metrics_port = 0 disables the HTTP endpoint (used by tests).
    if metrics_port == 0 {
        info!("Metrics disabled");
    } else {
        metrics::init();
        info!("Metrics initialized");

        http::spawn(supervisor.clone(), metrics_port);
        info!(port = metrics_port, "Operational HTTP endpoint started");
    }

    supervisor.start().await?;
    info!("Registry control plane running");

    // Park until shutdown.
    let mut shutdown_rx = supervisor.shutdown_tx.subscribe();
    let _ = shutdown_rx.recv().await;

    info!("Shutting down, waiting for tasks to finish...");
    // Give tasks a moment to flush logs and settle in-flight work
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

    Ok(())
}
