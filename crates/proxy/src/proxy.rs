//! The request-forwarding core.
//!
//! [`ProxyEngine`] holds the active balancing policy behind an atomic swap
//! and a persistent pooled upstream client. Per request it asks the policy
//! for a backend, rewrites the target, injects the forwarding headers,
//! streams the upstream response back, and settles the per-backend
//! accounting on whichever completion path the request takes.
//!
//! A backend that fails at dispatch time (dial error, timeout, protocol
//! error before response headers) is marked unhealthy on the spot. The
//! health monitor is the only component that brings it back. There are no
//! retries; the client gets a 502 and the next request selects again.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::header::{HeaderValue, HOST};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error};

use crate::backend::Backend;
use crate::balance::Policy;
use crate::http_util::{text_response, ProxyBody};
use crate::middleware::{ClientInfo, RequestHandler};

/// Upstream connection-pool defaults.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Request headers that must not travel upstream. The client library
/// manages its own connection semantics, so everything connection-scoped
/// is dropped here, `Te` and `Trailer` included.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// The central request handler. Safe for concurrent use.
pub struct ProxyEngine {
    policy: ArcSwap<Policy>,
    client: Client<HttpConnector, ProxyBody>,
}

impl ProxyEngine {
    /// Create an engine running `policy`. The upstream connection pool is
    /// created once and reused across policy swaps.
    pub fn new(policy: Policy) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build_http();
        Self {
            policy: ArcSwap::from_pointee(policy),
            client,
        }
    }

    /// Atomically replace the active policy.
    ///
    /// Requests that already captured the previous policy finish on it,
    /// including their matching `done` call; new requests see the new
    /// policy immediately. No connections are dropped.
    pub fn update_policy(&self, policy: Policy) {
        self.policy.store(Arc::new(policy));
    }

    /// Rewrite `req` in place to target `backend`, keeping the original
    /// path and query.
    fn rewrite_request(req: &mut Request<ProxyBody>, backend: &Backend, client: &ClientInfo) {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let target = Uri::builder()
            .scheme(backend.scheme())
            .authority(backend.authority())
            .path_and_query(path_and_query)
            .build()
            .expect("URI from pre-validated backend components");

        let original_host = req
            .headers()
            .get(HOST)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(""));

        *req.uri_mut() = target;
        let authority = HeaderValue::from_str(backend.authority())
            .expect("authority was parsed from a URI");
        req.headers_mut().insert(HOST, authority);

        strip_hop_by_hop(req.headers_mut());

        let remote = client.remote_addr.to_string();
        let forwarded_for = match req.headers().get("x-forwarded-for") {
            Some(prior) => {
                let prior = prior.to_str().unwrap_or("");
                format!("{prior}, {remote}")
            }
            None => remote.clone(),
        };
        let headers = req.headers_mut();
        if let Ok(v) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", v);
        }
        if let Ok(v) = HeaderValue::from_str(&remote) {
            headers.insert("x-real-ip", v);
        }
        headers.insert("x-forwarded-host", original_host);
        headers.insert(
            "x-forwarded-proto",
            HeaderValue::from_static(if client.tls { "https" } else { "http" }),
        );
    }
}

/// Drop connection-scoped headers from a request or response.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

#[async_trait]
impl RequestHandler for ProxyEngine {
    async fn handle(&self, mut req: Request<ProxyBody>, client: ClientInfo) -> Response<ProxyBody> {
        let policy = self.policy.load_full();

        let backend = match policy.next() {
            Ok(backend) => backend,
            Err(e) => {
                error!(
                    method = %req.method(),
                    path = req.uri().path(),
                    error = %e,
                    "no healthy backend available"
                );
                return text_response(StatusCode::BAD_GATEWAY, "bad gateway");
            }
        };

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        Self::rewrite_request(&mut req, &backend, &client);

        debug!(
            method = %method,
            path = %path,
            backend = backend.raw_url(),
            "proxying request"
        );

        match self.client.request(req).await {
            Ok(response) => {
                policy.done(&backend);
                backend.inc_requests();

                let mut response = response.map(|body| body.boxed());
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Err(e) => {
                policy.done(&backend);

                // Passive health demotion. The active monitor clears the
                // flag once the backend answers probes again.
                backend.set_healthy(false);
                backend.inc_requests();
                backend.inc_errors();

                error!(
                    backend = backend.raw_url(),
                    method = %method,
                    path = %path,
                    error = %e,
                    "backend error, marked unhealthy"
                );
                text_response(StatusCode::BAD_GATEWAY, "bad gateway")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendList;
    use crate::http_util::{empty, full};
    use crate::middleware::test_support::client;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use torii_config::Strategy;

    /// Upstream fixture that answers `hello-world` and mirrors the proxy
    /// headers it received as `echo-*` response headers.
    async fn spawn_echo_upstream() -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        let mut builder = Response::builder().status(StatusCode::OK);
                        for name in [
                            "host",
                            "x-forwarded-for",
                            "x-real-ip",
                            "x-forwarded-host",
                            "x-forwarded-proto",
                            "te",
                        ] {
                            if let Some(value) = req.headers().get(name) {
                                builder = builder.header(format!("echo-{name}"), value.clone());
                            }
                        }
                        Ok::<_, Infallible>(
                            builder.body(Full::new(Bytes::from("hello-world"))).unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, handle)
    }

    fn engine_over(urls: &[&str], strategy: Strategy) -> (ProxyEngine, BackendList) {
        let backends: BackendList = Arc::new(
            urls.iter()
                .map(|u| Arc::new(Backend::new(u, 1).unwrap()))
                .collect(),
        );
        (
            ProxyEngine::new(Policy::new(strategy, backends.clone())),
            backends,
        )
    }

    fn request(path: &str) -> Request<ProxyBody> {
        Request::builder()
            .uri(path)
            .header(HOST, "gateway.test")
            .body(empty())
            .unwrap()
    }

    #[tokio::test]
    async fn forwards_request_and_relays_response() {
        let (addr, upstream) = spawn_echo_upstream().await;
        let (engine, backends) = engine_over(&[&format!("http://{addr}")], Strategy::RoundRobin);

        let response = engine.handle(request("/anything"), client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["echo-host"], addr.to_string().as_str());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"hello-world");

        assert_eq!(backends[0].total_requests(), 1);
        assert_eq!(backends[0].total_errors(), 0);
        assert_eq!(backends[0].active_conns(), 0);
        assert!(backends[0].is_healthy());
        upstream.abort();
    }

    #[tokio::test]
    async fn injects_forwarding_headers() {
        let (addr, upstream) = spawn_echo_upstream().await;
        let (engine, _) = engine_over(&[&format!("http://{addr}")], Strategy::RoundRobin);

        let response = engine.handle(request("/"), client()).await;
        let headers = response.headers();
        assert_eq!(headers["echo-x-forwarded-for"], "127.0.0.1:4242");
        assert_eq!(headers["echo-x-real-ip"], "127.0.0.1:4242");
        assert_eq!(headers["echo-x-forwarded-host"], "gateway.test");
        assert_eq!(headers["echo-x-forwarded-proto"], "http");
        upstream.abort();
    }

    #[tokio::test]
    async fn appends_to_existing_forwarded_for_and_strips_hop_by_hop() {
        let (addr, upstream) = spawn_echo_upstream().await;
        let (engine, _) = engine_over(&[&format!("http://{addr}")], Strategy::RoundRobin);

        let req = Request::builder()
            .uri("/")
            .header(HOST, "gateway.test")
            .header("x-forwarded-for", "10.1.1.1")
            .header("te", "trailers")
            .body(empty())
            .unwrap();
        let response = engine.handle(req, client()).await;

        let headers = response.headers();
        assert_eq!(headers["echo-x-forwarded-for"], "10.1.1.1, 127.0.0.1:4242");
        assert!(headers.get("echo-te").is_none());
        upstream.abort();
    }

    #[tokio::test]
    async fn dispatch_failure_demotes_backend_and_returns_502() {
        // Bind then drop so the port refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (engine, backends) = engine_over(&[&format!("http://{addr}")], Strategy::RoundRobin);

        let response = engine.handle(request("/"), client()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        assert!(!backends[0].is_healthy());
        assert_eq!(backends[0].total_requests(), 1);
        assert_eq!(backends[0].total_errors(), 1);
        assert_eq!(backends[0].active_conns(), 0);
    }

    #[tokio::test]
    async fn no_selectable_backend_short_circuits_to_502() {
        let (engine, backends) = engine_over(&["http://127.0.0.1:9"], Strategy::RoundRobin);
        backends[0].set_healthy(false);

        let response = engine.handle(request("/"), client()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        // Nothing was dispatched, so nothing was accounted.
        assert_eq!(backends[0].total_requests(), 0);
        assert_eq!(backends[0].total_errors(), 0);
    }

    #[tokio::test]
    async fn update_policy_switches_new_requests() {
        let (addr_a, upstream_a) = spawn_echo_upstream().await;
        let (addr_b, upstream_b) = spawn_echo_upstream().await;

        let (engine, _) = engine_over(&[&format!("http://{addr_a}")], Strategy::RoundRobin);
        let response = engine.handle(request("/"), client()).await;
        assert_eq!(response.headers()["echo-host"], addr_a.to_string().as_str());

        let replacement: BackendList = Arc::new(vec![Arc::new(
            Backend::new(&format!("http://{addr_b}"), 1).unwrap(),
        )]);
        engine.update_policy(Policy::new(Strategy::RoundRobin, replacement));

        let response = engine.handle(request("/"), client()).await;
        assert_eq!(response.headers()["echo-host"], addr_b.to_string().as_str());

        upstream_a.abort();
        upstream_b.abort();
    }

    #[tokio::test]
    async fn post_body_reaches_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upstream = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        Ok::<_, Infallible>(Response::new(Full::new(body)))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        let (engine, _) = engine_over(&[&format!("http://{addr}")], Strategy::RoundRobin);
        let req = Request::builder()
            .method("POST")
            .uri("/submit")
            .header(HOST, "gateway.test")
            .body(full("payload"))
            .unwrap();
        let response = engine.handle(req, client()).await;

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"payload");
        upstream.abort();
    }
}
