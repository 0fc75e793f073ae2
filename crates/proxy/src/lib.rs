//! Torii, an HTTP/1.1 reverse proxy and load-balancing gateway.
//!
//! The gateway accepts client requests, picks a healthy upstream through a
//! pluggable balancing policy, forwards the request with the standard
//! proxy headers, and streams the response back. Around that core sit an
//! active health monitor, a swappable middleware chain (request logging,
//! per-IP rate limiting, JWT authentication), a runtime registry driving
//! zero-downtime pool swaps, a management REST API, and config-file hot
//! reload.

pub mod admin;
pub mod app;
pub mod backend;
pub mod balance;
pub mod health;
pub mod http_util;
pub mod middleware;
pub mod proxy;
pub mod registry;
pub mod reload;
pub mod server;

pub use app::App;
pub use backend::{Backend, BackendList};
pub use balance::Policy;
pub use health::{HealthConfig, HealthMonitor};
pub use middleware::{build_chain, ClientInfo, HandlerCell, RequestHandler};
pub use proxy::ProxyEngine;
pub use registry::{BackendInfo, Registry};
pub use reload::{spawn_config_watcher, SwapCoordinator};
pub use server::{format_uptime, serve, BuildInfo, Gateway};

/// Crate version, baked at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Short git commit hash, or `unknown` outside a checkout.
pub const COMMIT: &str = env!("TORII_COMMIT");
/// UTC build timestamp.
pub const BUILD_DATE: &str = env!("TORII_BUILD_DATE");

/// Build identity for /healthz and --version.
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: VERSION,
        commit: COMMIT,
        build_date: BUILD_DATE,
    }
}
