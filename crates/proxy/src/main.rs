//! Torii gateway entry point.
//!
//! Usage:
//!
//!     torii [-c path/to/gateway.yaml]
//!
//! The gateway hot-reloads its configuration: edit the YAML file while the
//! process is running and the change takes effect without a restart.
//! SIGINT and SIGTERM trigger a graceful shutdown with a ten-second drain
//! for in-flight requests.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use torii_config::Config;
use torii_proxy::admin::{self, AdminState};
use torii_proxy::{build_info, serve, spawn_config_watcher, App, VERSION};

/// Torii, an HTTP/1.1 reverse proxy and load-balancing gateway.
#[derive(Parser, Debug)]
#[command(name = "torii", version = VERSION, about)]
struct Cli {
    /// Configuration file path.
    #[arg(short = 'c', long = "config", env = "TORII_CONFIG", default_value = "configs/gateway.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (cfg, have_config_file) = match Config::from_file(&cli.config) {
        Ok(cfg) => (cfg, true),
        Err(e) => {
            warn!(
                path = %cli.config.display(),
                error = %e,
                "could not load config file, using defaults"
            );
            (Config::default_dev(), false)
        }
    };

    let app = App::build(cfg, build_info()).context("failed to initialise gateway")?;

    if app.cfg.health_check.enabled {
        Arc::clone(&app.monitor).start().await;
    }

    // The watcher stops when dropped, so it lives until the end of main.
    let _watcher = if have_config_file {
        match spawn_config_watcher(
            cli.config.clone(),
            Arc::clone(&app.registry),
            Arc::clone(&app.coordinator),
        ) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "config hot-reload disabled");
                None
            }
        }
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if app.cfg.admin.enabled {
        let listener = TcpListener::bind(&app.cfg.admin.listen_addr)
            .await
            .with_context(|| format!("binding admin API to {}", app.cfg.admin.listen_addr))?;
        let state = Arc::new(AdminState {
            registry: Arc::clone(&app.registry),
            started_at: std::time::Instant::now(),
            version: VERSION,
        });
        tokio::spawn(admin::serve(listener, state, shutdown_rx.clone()));
    }

    let listener = TcpListener::bind(&app.cfg.listen_addr)
        .await
        .with_context(|| format!("binding to {}", app.cfg.listen_addr))?;

    info!(
        addr = %app.cfg.listen_addr,
        strategy = %app.cfg.strategy,
        backends = app.cfg.backends.len(),
        health_check = app.cfg.health_check.enabled,
        rate_limit = app.cfg.rate_limit.enabled,
        auth = app.cfg.auth.enabled,
        version = VERSION,
        "gateway listening"
    );

    let monitor = Arc::clone(&app.monitor);
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "signal handler failed");
        }
        info!("shutting down gateway");

        // Stop probing before the drain so no probe flips health state
        // while connections wind down.
        monitor.stop().await;
        let _ = shutdown_tx.send(true);
    });

    serve(listener, Arc::clone(&app.gateway), shutdown_rx).await;

    info!("gateway stopped");
    Ok(())
}

/// Resolve when SIGINT or SIGTERM arrives.
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}
