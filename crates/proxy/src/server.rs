//! The gateway's listening loop.
//!
//! Accepts HTTP/1.1 connections and routes every request through the
//! middleware chain loaded from the atomic cell at that moment. The one
//! exception is `GET /healthz`, answered by the process itself so external
//! probes can always tell whether the gateway is alive, regardless of
//! middleware or backend state.
//!
//! Shutdown is graceful: the accept loop stops, in-flight requests get up
//! to ten seconds to complete, then connections are force-closed.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::http_util::{json_response, ProxyBody};
use crate::middleware::{ClientInfo, HandlerCell};

/// How long in-flight requests may keep running after shutdown begins.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-process identity reported by `/healthz`.
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub build_date: &'static str,
}

/// Connection-accepting front of the gateway.
pub struct Gateway {
    chain: Arc<HandlerCell>,
    build: BuildInfo,
    started_at: Instant,
}

impl Gateway {
    pub fn new(chain: Arc<HandlerCell>, build: BuildInfo) -> Self {
        Self {
            chain,
            build,
            started_at: Instant::now(),
        }
    }

    /// Route one inbound request.
    pub async fn dispatch(&self, req: Request<Incoming>, remote: SocketAddr) -> Response<ProxyBody> {
        if req.uri().path() == "/healthz" {
            return self.healthz();
        }

        let client = ClientInfo {
            remote_addr: remote,
            tls: false,
        };
        let handler = self.chain.load();
        handler.handle(req.map(|body| body.boxed()), client).await
    }

    fn healthz(&self) -> Response<ProxyBody> {
        json_response(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "version": self.build.version,
                "commit": self.build.commit,
                "build_date": self.build.build_date,
                "uptime": format_uptime(self.started_at.elapsed()),
            }),
        )
    }
}

/// Accept connections until `shutdown` flips, then drain.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    mut shutdown: watch::Receiver<bool>,
) {
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let gateway = Arc::clone(&gateway);
                let service = service_fn(move |req| {
                    let gateway = Arc::clone(&gateway);
                    async move { Ok::<_, Infallible>(gateway.dispatch(req, remote).await) }
                });

                let conn = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(error = %e, "connection error");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }

    info!("draining in-flight requests");
    tokio::select! {
        _ = graceful.shutdown() => info!("drain complete"),
        _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
            warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "drain timed out, closing connections");
        }
    }
}

/// Human-readable uptime with second precision, like `1h2m3s`.
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formats_with_second_precision() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0s");
        assert_eq!(format_uptime(Duration::from_millis(2750)), "2s");
        assert_eq!(format_uptime(Duration::from_secs(59)), "59s");
        assert_eq!(format_uptime(Duration::from_secs(60)), "1m0s");
        assert_eq!(format_uptime(Duration::from_secs(150)), "2m30s");
        assert_eq!(format_uptime(Duration::from_secs(3723)), "1h2m3s");
        assert_eq!(format_uptime(Duration::from_secs(7200)), "2h0m0s");
    }
}
