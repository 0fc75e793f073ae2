//! Management REST API.
//!
//! A small hyper server on its own listen address, separate from the
//! proxied traffic. All mutations go through the [`Registry`], so every
//! change propagates to the balancer and health monitor the same way a
//! config reload does.
//!
//! Routes:
//!
//! - `GET  /api/stats`             aggregate counters and pool health
//! - `GET  /api/backends`          per-backend state and counters
//! - `POST /api/backends`          add, JSON body `{"url": ..., "weight": ...}`
//! - `DELETE /api/backends?url=`   remove
//! - `POST /api/backends/block?url=` / `POST /api/backends/unblock?url=`

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use torii_common::ToriiError;

use crate::http_util::{json_response, ProxyBody};
use crate::registry::Registry;
use crate::server::format_uptime;

/// Shared state behind the admin handlers.
pub struct AdminState {
    pub registry: Arc<Registry>,
    pub started_at: Instant,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
struct AddBackendBody {
    url: String,
    #[serde(default)]
    weight: i64,
}

#[derive(Debug, serde::Serialize)]
struct StatsResponse {
    uptime: String,
    version: &'static str,
    total_requests: i64,
    total_errors: i64,
    active_conns: i64,
    backends_total: usize,
    backends_healthy: usize,
    backends_blocked: usize,
}

/// Serve the admin API until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AdminState>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "admin API listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(route(req, &state).await) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(error = %e, "admin connection error");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn route(req: Request<Incoming>, state: &AdminState) -> Response<ProxyBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::GET, "/api/stats") => handle_stats(state),
        (&Method::GET, "/api/backends") => json_response(StatusCode::OK, &state.registry.list()),
        (&Method::POST, "/api/backends") => handle_add(req, state).await,
        (&Method::DELETE, "/api/backends") => {
            handle_url_action(req, state, |reg, url| reg.remove(url), "removed")
        }
        (&Method::POST, "/api/backends/block") => {
            handle_url_action(req, state, |reg, url| reg.block(url), "blocked")
        }
        (&Method::POST, "/api/backends/unblock") => {
            handle_url_action(req, state, |reg, url| reg.unblock(url), "unblocked")
        }
        _ => error_response(StatusCode::NOT_FOUND, "no such endpoint"),
    }
}

fn handle_stats(state: &AdminState) -> Response<ProxyBody> {
    let backends = state.registry.list();

    let mut stats = StatsResponse {
        uptime: format_uptime(state.started_at.elapsed()),
        version: state.version,
        total_requests: 0,
        total_errors: 0,
        active_conns: 0,
        backends_total: backends.len(),
        backends_healthy: 0,
        backends_blocked: 0,
    };
    for b in &backends {
        stats.total_requests += b.total_requests;
        stats.total_errors += b.total_errors;
        stats.active_conns += b.active_conns;
        if b.healthy && !b.blocked {
            stats.backends_healthy += 1;
        }
        if b.blocked {
            stats.backends_blocked += 1;
        }
    }

    json_response(StatusCode::OK, &stats)
}

async fn handle_add(req: Request<Incoming>, state: &AdminState) -> Response<ProxyBody> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "unreadable body"),
    };
    let body: AddBackendBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid JSON body"),
    };
    if body.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "url is required");
    }
    let weight = if body.weight < 1 { 1 } else { body.weight.min(u32::MAX as i64) as u32 };

    match state.registry.add(&body.url, weight) {
        Ok(()) => {
            info!(url = %body.url, weight, "admin: backend added");
            json_response(StatusCode::OK, &json!({"status": "added"}))
        }
        Err(e) => registry_error_response(e),
    }
}

fn handle_url_action(
    req: Request<Incoming>,
    state: &AdminState,
    action: impl Fn(&Registry, &str) -> Result<(), ToriiError>,
    verb: &str,
) -> Response<ProxyBody> {
    let Some(url) = query_param(req.uri().query(), "url") else {
        return error_response(StatusCode::BAD_REQUEST, "url query parameter is required");
    };

    match action(&state.registry, &url) {
        Ok(()) => {
            info!(url = %url, "admin: backend {verb}");
            json_response(StatusCode::OK, &json!({ "status": verb }))
        }
        Err(e) => registry_error_response(e),
    }
}

fn registry_error_response(e: ToriiError) -> Response<ProxyBody> {
    let status = match &e {
        ToriiError::DuplicateBackend(_) => StatusCode::CONFLICT,
        ToriiError::BackendNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    warn!(error = %e, "admin mutation rejected");
    error_response(status, &e.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    json_response(status, &json!({ "error": message }))
}

/// Extract a query parameter, percent-decoding its value.
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    for pair in query?.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name {
            return Some(percent_decode(value));
        }
    }
    None
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&value[i + 1..i + 3], 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_finds_and_decodes() {
        assert_eq!(
            query_param(Some("url=http%3A%2F%2Fa%3A1"), "url").as_deref(),
            Some("http://a:1")
        );
        assert_eq!(
            query_param(Some("x=1&url=http://a:1"), "url").as_deref(),
            Some("http://a:1")
        );
        assert_eq!(query_param(Some("x=1"), "url"), None);
        assert_eq!(query_param(None, "url"), None);
    }

    #[test]
    fn percent_decode_handles_plus_and_invalid_escapes() {
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
