//! The middleware chain in front of the proxy engine.
//!
//! Every middleware is a transparent wrapper around an inner
//! [`RequestHandler`]; the proxy engine sits at the bottom of the stack and
//! implements the same trait. A composed chain is immutable, so swapping
//! the whole chain is one atomic store into the [`HandlerCell`]. Requests
//! load the cell once and run entirely through the composition they
//! captured, which makes enabling or disabling rate limiting and
//! authentication safe while traffic is in flight.
//!
//! Composition order is fixed, outermost first: request logging, then rate
//! limiting (if enabled), then JWT authentication (if enabled), then the
//! proxy engine.

mod auth;
mod logger;
mod rate_limit;

pub use auth::JwtAuth;
pub use logger::RequestLogger;
pub use rate_limit::RateLimiter;

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::{Request, Response};

use torii_config::Config;

use crate::http_util::ProxyBody;
use crate::proxy::ProxyEngine;

/// Connection-level facts about the inbound client.
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    /// TCP peer address of the client connection.
    pub remote_addr: SocketAddr,
    /// Whether the inbound connection arrived over TLS.
    pub tls: bool,
}

/// The single request-handler contract every middleware conforms to.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, req: Request<ProxyBody>, client: ClientInfo) -> Response<ProxyBody>;
}

/// Atomic cell holding the active middleware composition.
///
/// The composition is wrapped in a sized slot so the swap stays a single
/// atomic pointer store. Readers load once per request and keep that
/// composition for the whole request, whatever swaps happen meanwhile.
pub struct HandlerCell {
    slot: ArcSwap<ChainSlot>,
}

struct ChainSlot {
    handler: Arc<dyn RequestHandler>,
}

impl HandlerCell {
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            slot: ArcSwap::from_pointee(ChainSlot { handler }),
        }
    }

    /// Publish a new composition.
    pub fn store(&self, handler: Arc<dyn RequestHandler>) {
        self.slot.store(Arc::new(ChainSlot { handler }));
    }

    /// The composition in force right now.
    pub fn load(&self) -> Arc<dyn RequestHandler> {
        Arc::clone(&self.slot.load().handler)
    }
}

/// Compose the middleware chain for `cfg` around the proxy engine.
pub fn build_chain(cfg: &Config, engine: Arc<ProxyEngine>) -> Arc<dyn RequestHandler> {
    let mut handler: Arc<dyn RequestHandler> = engine;
    if cfg.auth.enabled {
        handler = Arc::new(JwtAuth::new(&cfg.auth, handler));
    }
    if cfg.rate_limit.enabled {
        handler = Arc::new(RateLimiter::new(&cfg.rate_limit, handler));
    }
    Arc::new(RequestLogger::new(handler))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use http::StatusCode;

    use crate::http_util::full;

    /// Innermost handler for middleware tests: answers 200 with a fixed
    /// body and echoes selected request headers for assertions.
    pub struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(
            &self,
            req: Request<ProxyBody>,
            _client: ClientInfo,
        ) -> Response<ProxyBody> {
            let mut builder = Response::builder().status(StatusCode::OK);
            if let Some(id) = req.headers().get("x-request-id") {
                builder = builder.header("x-echoed-request-id", id.clone());
            }
            builder.body(full("echo")).unwrap()
        }
    }

    pub fn client() -> ClientInfo {
        ClientInfo {
            remote_addr: "127.0.0.1:4242".parse().unwrap(),
            tls: false,
        }
    }

    pub fn get(path: &str) -> Request<ProxyBody> {
        Request::builder()
            .uri(path)
            .body(crate::http_util::empty())
            .unwrap()
    }
}
