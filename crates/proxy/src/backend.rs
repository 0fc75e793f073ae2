//! Runtime state for upstream servers.
//!
//! A [`Backend`] is the live record for one upstream: its parsed address,
//! its static weight, and the mutable flags and counters the balancer and
//! health monitor act on. All mutable state is atomic, so the per-request
//! hot path never takes a lock to read health or bump a counter.
//!
//! Backend lists are immutable snapshots. Any mutation (admin API, config
//! reload) builds a new list and swaps it in; requests already holding a
//! reference to an old backend keep using it until the reference drops.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use http::Uri;

use torii_common::{ToriiError, ToriiResult};
use torii_config::BackendCfg;

/// Immutable snapshot of the backend pool, in declared order.
pub type BackendList = Arc<Vec<Arc<Backend>>>;

/// One upstream HTTP server.
#[derive(Debug)]
pub struct Backend {
    raw_url: String,
    scheme: String,
    authority: String,
    weight: u32,

    healthy: AtomicBool,
    blocked: AtomicBool,
    active_conns: AtomicI64,
    total_requests: AtomicI64,
    total_errors: AtomicI64,
}

impl Backend {
    /// Parse `raw_url` and return a healthy backend ready for traffic.
    ///
    /// The URL must be absolute: a scheme and a host are required. Weights
    /// below 1 are raised to 1.
    pub fn new(raw_url: &str, weight: u32) -> ToriiResult<Self> {
        let uri: Uri = raw_url.parse().map_err(|e| ToriiError::InvalidBackendUrl {
            url: raw_url.to_string(),
            reason: format!("{e}"),
        })?;

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| ToriiError::InvalidBackendUrl {
                url: raw_url.to_string(),
                reason: "missing scheme".to_string(),
            })?
            .to_string();
        let authority = uri
            .authority()
            .ok_or_else(|| ToriiError::InvalidBackendUrl {
                url: raw_url.to_string(),
                reason: "missing host".to_string(),
            })?
            .as_str()
            .to_string();

        Ok(Self {
            raw_url: raw_url.to_string(),
            scheme,
            authority,
            weight: weight.max(1),
            healthy: AtomicBool::new(true),
            blocked: AtomicBool::new(false),
            active_conns: AtomicI64::new(0),
            total_requests: AtomicI64::new(0),
            total_errors: AtomicI64::new(0),
        })
    }

    /// Build the runtime backend list from config entries, preserving order.
    pub fn from_cfgs(cfgs: &[BackendCfg]) -> ToriiResult<Vec<Arc<Backend>>> {
        cfgs.iter()
            .map(|c| Backend::new(&c.url, c.effective_weight()).map(Arc::new))
            .collect()
    }

    /// The URL exactly as declared; identity key for admin mutations.
    pub fn raw_url(&self) -> &str {
        &self.raw_url
    }

    /// URL scheme, `http` or `https`.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// `host:port` used for request rewriting and the Host header.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, v: bool) {
        self.healthy.store(v, Ordering::Relaxed);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Relaxed)
    }

    pub fn set_blocked(&self, v: bool) {
        self.blocked.store(v, Ordering::Relaxed);
    }

    /// Eligible for selection: healthy and not administratively blocked.
    pub fn selectable(&self) -> bool {
        self.is_healthy() && !self.is_blocked()
    }

    /// Increment the active-connection count, returning the new value.
    pub fn inc_conns(&self) -> i64 {
        self.active_conns.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement the active-connection count, returning the new value.
    pub fn dec_conns(&self) -> i64 {
        self.active_conns.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn active_conns(&self) -> i64 {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn inc_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> i64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn inc_errors(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_errors(&self) -> i64 {
        self.total_errors.load(Ordering::Relaxed)
    }
}
