//! Active health probing for upstream backends.
//!
//! The [`HealthMonitor`] owns a hot-swappable backend list and probes every
//! backend concurrently on a fixed interval with `GET raw_url + path`.
//! Statuses in `[200, 400)` mark the backend healthy, anything else
//! (including transport errors and timeouts) marks it unhealthy. The proxy
//! engine performs the complementary passive demotion when a live request
//! fails; this monitor is the only component that promotes a backend back.
//!
//! The probe loop is a spawned task cancelled through a broadcast channel,
//! and `stop` waits for it to exit.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::{Request, Uri};
use http_body_util::Empty;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use torii_config::HealthCheckCfg;

use crate::backend::{Backend, BackendList};

type ProbeClient = Client<HttpConnector, Empty<Bytes>>;

/// Probe parameters taken from the `health_check` config section.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Appended to each backend's raw URL to form the probe target.
    pub path: String,
}

impl From<&HealthCheckCfg> for HealthConfig {
    fn from(cfg: &HealthCheckCfg) -> Self {
        Self {
            interval: cfg.interval,
            timeout: cfg.timeout,
            path: cfg.path.clone(),
        }
    }
}

/// Background prober for the backend pool.
pub struct HealthMonitor {
    config: HealthConfig,
    backends: ArcSwap<Vec<Arc<Backend>>>,
    client: ProbeClient,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor over `backends`; call [`start`] to begin probing.
    ///
    /// [`start`]: HealthMonitor::start
    pub fn new(config: HealthConfig, backends: BackendList) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            backends: ArcSwap::new(backends),
            client: Client::builder(TokioExecutor::new()).build_http(),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Spawn the probe loop.
    ///
    /// The first cycle runs right away so backends are classified quickly
    /// at startup; afterwards one cycle runs per interval tick.
    pub async fn start(self: Arc<Self>) {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return;
        }

        let monitor = Arc::clone(&self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *guard = Some(tokio::spawn(async move {
            // The first interval tick completes immediately.
            let mut ticker = time::interval(monitor.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.probe_all().await,
                    _ = shutdown_rx.recv() => {
                        debug!("health monitor stopping");
                        break;
                    }
                }
            }
        }));

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            timeout_ms = self.config.timeout.as_millis() as u64,
            path = %self.config.path,
            "health monitor started"
        );
    }

    /// Signal the probe loop to exit and wait for it.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Swap in a new backend list.
    ///
    /// Probes already in flight finish against the backends they captured;
    /// the next cycle walks the new list.
    pub fn update_backends(&self, backends: BackendList) {
        self.backends.store(backends);
    }

    /// Probe every backend in the current snapshot concurrently and wait
    /// for all probes to finish.
    pub async fn probe_all(&self) {
        let snapshot = self.backends.load_full();

        let mut probes = Vec::with_capacity(snapshot.len());
        for backend in snapshot.iter() {
            let client = self.client.clone();
            let timeout = self.config.timeout;
            let target = format!("{}{}", backend.raw_url(), self.config.path);
            let backend = Arc::clone(backend);
            probes.push(tokio::spawn(async move {
                probe(&client, timeout, &target, &backend).await;
            }));
        }
        for p in probes {
            let _ = p.await;
        }
    }
}

/// Send one GET to `target` and update the backend's health flag.
async fn probe(client: &ProbeClient, timeout: Duration, target: &str, backend: &Backend) {
    let uri: Uri = match target.parse() {
        Ok(uri) => uri,
        Err(e) => {
            demote(backend, &format!("bad probe target: {e}"));
            return;
        }
    };
    let request = Request::get(uri).body(Empty::new()).expect("GET with a parsed URI");

    match time::timeout(timeout, client.request(request)).await {
        Ok(Ok(response)) => {
            let status = response.status().as_u16();
            if (200..400).contains(&status) {
                if !backend.is_healthy() {
                    info!(backend = %backend.raw_url(), "backend recovered");
                }
                backend.set_healthy(true);
            } else {
                demote(backend, &format!("status {status}"));
            }
        }
        Ok(Err(e)) => demote(backend, &format!("{e}")),
        Err(_) => demote(backend, &format!("timeout after {timeout:?}")),
    }
}

fn demote(backend: &Backend, reason: &str) {
    if backend.is_healthy() {
        warn!(backend = %backend.raw_url(), reason = %reason, "backend became unhealthy");
    }
    backend.set_healthy(false);
}
