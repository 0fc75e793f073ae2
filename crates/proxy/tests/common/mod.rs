//! Shared fixtures for the end-to-end tests.
//!
//! Gateways under test are assembled through the same [`App::build`] path
//! as the production binary and served on an ephemeral port. Upstreams are
//! tiny hyper servers that answer every request with their own name, so
//! assertions can tell which backend handled a request.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use torii_config::{AdminCfg, AuthCfg, BackendCfg, Config, HealthCheckCfg, RateLimitCfg, Strategy};
use torii_proxy::{build_info, serve, App};

/// A named upstream answering `200` with its name as the body.
pub struct Upstream {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Upstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn an upstream on an ephemeral port.
pub async fn spawn_upstream(name: &'static str) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<hyper::body::Incoming>| async move {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                        name.as_bytes(),
                    ))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    Upstream { addr, handle }
}

/// A gateway under test, listening on an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub app: App,
    shutdown: watch::Sender<bool>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn stop(&self) {
        self.app.monitor.stop().await;
        let _ = self.shutdown.send(true);
    }
}

/// Build and serve a gateway for `cfg`. The health monitor is started only
/// when the config enables it.
pub async fn start_gateway(cfg: Config) -> TestGateway {
    let app = App::build(cfg, build_info()).expect("test config must build");

    if app.cfg.health_check.enabled {
        Arc::clone(&app.monitor).start().await;
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(serve(listener, Arc::clone(&app.gateway), shutdown_rx));

    TestGateway {
        addr,
        app,
        shutdown,
    }
}

/// A config pointing at `urls`, with every optional subsystem off.
pub fn base_config(urls: &[&str]) -> Config {
    Config {
        listen_addr: "127.0.0.1:0".to_string(),
        strategy: Strategy::RoundRobin,
        backends: urls
            .iter()
            .map(|u| BackendCfg {
                url: u.to_string(),
                weight: 1,
            })
            .collect(),
        health_check: HealthCheckCfg {
            enabled: false,
            ..HealthCheckCfg::default()
        },
        rate_limit: RateLimitCfg::default(),
        auth: AuthCfg::default(),
        admin: AdminCfg {
            enabled: false,
            ..AdminCfg::default()
        },
    }
}
