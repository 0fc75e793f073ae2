//! Gateway assembly.
//!
//! [`App::build`] turns a validated [`Config`] into the full set of wired
//! runtime objects: backends, policy, proxy engine, health monitor,
//! middleware chain, registry, and swap coordinator. The binary and the
//! integration tests share this path, so a tested gateway is assembled
//! exactly like a production one.
//!
//! Must be called from within a Tokio runtime; chain construction spawns
//! the rate limiter's sweeper task when rate limiting is enabled.

use std::sync::Arc;

use torii_common::ToriiResult;
use torii_config::Config;

use crate::backend::{Backend, BackendList};
use crate::balance::Policy;
use crate::health::{HealthConfig, HealthMonitor};
use crate::middleware::{build_chain, HandlerCell};
use crate::proxy::ProxyEngine;
use crate::registry::Registry;
use crate::reload::SwapCoordinator;
use crate::server::{BuildInfo, Gateway};

/// A fully wired gateway, ready to serve.
pub struct App {
    pub cfg: Config,
    pub engine: Arc<ProxyEngine>,
    pub monitor: Arc<HealthMonitor>,
    pub chain: Arc<HandlerCell>,
    pub registry: Arc<Registry>,
    pub coordinator: Arc<SwapCoordinator>,
    pub gateway: Arc<Gateway>,
}

impl App {
    /// Wire every component from `cfg`.
    pub fn build(cfg: Config, build: BuildInfo) -> ToriiResult<Self> {
        let backends = Backend::from_cfgs(&cfg.backends)?;
        let pool: BackendList = Arc::new(backends.clone());

        let engine = Arc::new(ProxyEngine::new(Policy::new(cfg.strategy, pool.clone())));
        let monitor = Arc::new(HealthMonitor::new(
            HealthConfig::from(&cfg.health_check),
            pool,
        ));
        let chain = Arc::new(HandlerCell::new(build_chain(&cfg, Arc::clone(&engine))));

        let coordinator = Arc::new(SwapCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&monitor),
            Arc::clone(&chain),
        ));

        let coordinator_cb = Arc::clone(&coordinator);
        let registry = Arc::new(Registry::new(
            backends,
            cfg.strategy,
            Box::new(move |strategy, snapshot| {
                coordinator_cb.apply_pool(strategy, snapshot);
            }),
        ));

        let gateway = Arc::new(Gateway::new(Arc::clone(&chain), build));

        Ok(Self {
            cfg,
            engine,
            monitor,
            chain,
            registry,
            coordinator,
            gateway,
        })
    }
}
