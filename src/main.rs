//! configmap-reloader
//!
//! Serves the `message` of a mounted config file and rebuilds its HTTP
//! server whenever that file is written or replaced.
//!
//! # Architecture Overview
//!
//! ```text
//!   config file ──inotify──▶ ┌──────────┐  Ping/End/Restart/path   ┌──────────────┐
//!   (ConfigMap volume)       │ watcher  │ ───── rendezvous ──────▶ │  lifecycle   │
//!                            └──────────┘                          │  controller  │
//!                                                                  └──┬────────┬──┘
//!                                            rebuild (drain, cooldown)│        │ GET / (liveness)
//!                                                                     ▼        ▼
//!                                                               ┌──────────────────┐
//!     Client ──────────────────────────────────────────────────▶│   HTTP server    │
//!                                                               │  :8080  → message│
//!                                                               └──────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use configmap_reloader::config::{load_settings, validation::validate_settings, ConfigError, ConfigWatcher, Settings};
use configmap_reloader::control;
use configmap_reloader::lifecycle::{signals, LifecycleController};
use configmap_reloader::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "configmap-reloader")]
#[command(about = "Serve a mounted config value, restarting when the file changes", long_about = None)]
struct Cli {
    /// TOML settings file; defaults apply when omitted
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Watched config file, overriding the settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the settings
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => load_settings(path)?,
        None => Settings::default(),
    };
    if let Some(config) = cli.config {
        settings.config_path = config;
    }
    if let Some(bind) = cli.bind {
        settings.listener.bind_address = bind;
    }
    validate_settings(&settings).map_err(ConfigError::Validation)?;

    logging::init_logging(&settings.observability);
    tracing::info!("configmap-reloader v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        config_path = %settings.config_path.display(),
        bind_address = %settings.listener.bind_address,
        shutdown_grace_ms = settings.lifecycle.shutdown_grace_ms,
        restart_cooldown_ms = settings.lifecycle.restart_cooldown_ms,
        "Configuration loaded"
    );

    if settings.observability.metrics_enabled {
        if let Some(addr) = settings.observability.metrics_socket_addr() {
            metrics::init_metrics(addr);
        }
    }

    let watcher = ConfigWatcher::new(&settings.config_path).inspect_err(|e| {
        tracing::error!(error = %e, "Cannot watch config file");
    })?;

    let (control_tx, control_rx) = control::channel();
    let controller = LifecycleController::new(&settings, control_rx);
    tokio::spawn(watcher.run(control_tx));

    controller
        .run(signals::shutdown_signal())
        .await
        .inspect_err(|e| tracing::error!(error = %e, "Lifecycle controller failed"))?;

    tracing::info!("Shutdown complete");
    Ok(())
}
