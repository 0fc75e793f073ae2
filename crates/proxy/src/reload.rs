//! Zero-downtime reconfiguration.
//!
//! Two pieces cooperate here. The [`SwapCoordinator`] owns the references
//! that must change together when the pool changes: it rebuilds a policy
//! over the new snapshot and pushes it into the proxy engine and the
//! health monitor. The registry's change callback points at it, so admin
//! mutations and file reloads take the same path.
//!
//! The file watcher turns config-file writes into full pool swaps. An
//! invalid file is logged and skipped; the running configuration stays in
//! force. The listening socket is untouched either way.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tracing::{error, info};

use torii_common::{ToriiError, ToriiResult};
use torii_config::{Config, Strategy};

use crate::backend::{Backend, BackendList};
use crate::health::HealthMonitor;
use crate::middleware::{build_chain, HandlerCell};
use crate::proxy::ProxyEngine;
use crate::registry::Registry;

/// Settle window after a file event before reparsing, so editors that
/// write in multiple steps trigger one reload.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Applies pool and middleware swaps to the running gateway.
pub struct SwapCoordinator {
    engine: Arc<ProxyEngine>,
    monitor: Arc<HealthMonitor>,
    chain: Arc<HandlerCell>,
}

impl SwapCoordinator {
    pub fn new(
        engine: Arc<ProxyEngine>,
        monitor: Arc<HealthMonitor>,
        chain: Arc<HandlerCell>,
    ) -> Self {
        Self {
            engine,
            monitor,
            chain,
        }
    }

    /// Rebuild the policy over `backends` and swap it into the engine and
    /// the health monitor. In-flight requests finish on the policy they
    /// captured.
    pub fn apply_pool(&self, strategy: Strategy, backends: BackendList) {
        self.engine
            .update_policy(crate::balance::Policy::new(strategy, backends.clone()));
        self.monitor.update_backends(backends);
    }

    /// Compose a fresh middleware chain for `cfg` and publish it.
    pub fn apply_middlewares(&self, cfg: &Config) {
        self.chain.store(build_chain(cfg, Arc::clone(&self.engine)));
    }
}

/// Watch `path` and reload the gateway on every change.
///
/// The returned watcher must be kept alive; dropping it stops the reloads.
pub fn spawn_config_watcher(
    path: PathBuf,
    registry: Arc<Registry>,
    coordinator: Arc<SwapCoordinator>,
) -> ToriiResult<notify::RecommendedWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Event>(16);

    let mut watcher = notify::recommended_watcher(move |event: Result<Event, notify::Error>| {
        if let Ok(event) = event {
            let _ = tx.blocking_send(event);
        }
    })
    .map_err(|e| ToriiError::config(format!("creating file watcher: {e}")))?;

    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .map_err(|e| ToriiError::config(format!("watching {}: {e}", path.display())))?;

    info!(path = %path.display(), "watching configuration file");

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                continue;
            }

            tokio::time::sleep(DEBOUNCE).await;
            while rx.try_recv().is_ok() {}

            reload_from_file(&path, &registry, &coordinator);
        }
    });

    Ok(watcher)
}

/// Parse `path` and apply it to the running gateway. Failures leave the
/// previous configuration in force.
fn reload_from_file(path: &Path, registry: &Registry, coordinator: &SwapCoordinator) {
    let cfg = match Config::from_file(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "config reload failed, keeping previous configuration");
            return;
        }
    };
    let backends = match Backend::from_cfgs(&cfg.backends) {
        Ok(backends) => backends,
        Err(e) => {
            error!(error = %e, "config reload failed, keeping previous configuration");
            return;
        }
    };

    registry.replace_all(backends, cfg.strategy);
    coordinator.apply_middlewares(&cfg);

    info!(
        backends = cfg.backends.len(),
        strategy = %cfg.strategy,
        rate_limit = cfg.rate_limit.enabled,
        auth = cfg.auth.enabled,
        "configuration reloaded"
    );
}
