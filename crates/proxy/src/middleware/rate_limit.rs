//! Per-client-IP token-bucket rate limiting.
//!
//! Each client IP owns one bucket holding up to `burst` tokens, refilled
//! continuously at `rps` tokens per second. A request takes one token or
//! gets a 429. The client IP prefers the `X-Real-IP` header over the TCP
//! peer address, so deployments behind another proxy layer still bucket by
//! end-client.
//!
//! Buckets live in a concurrent map. A background task sweeps the map
//! every five minutes and deletes buckets idle for more than ten; the task
//! holds only a weak reference, so it winds down on its own after a chain
//! swap drops the limiter.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use http::{HeaderMap, Request, Response, StatusCode};
use parking_lot::Mutex;
use tracing::{debug, warn};

use torii_config::RateLimitCfg;

use crate::http_util::{text_response, ProxyBody};
use crate::middleware::{ClientInfo, RequestHandler};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const IDLE_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// Token-bucket rate limiter around an inner handler.
pub struct RateLimiter {
    rps: f64,
    burst: u32,
    buckets: Arc<DashMap<String, Mutex<Bucket>>>,
    inner: Arc<dyn RequestHandler>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitCfg, inner: Arc<dyn RequestHandler>) -> Self {
        let buckets: Arc<DashMap<String, Mutex<Bucket>>> = Arc::new(DashMap::new());
        spawn_sweeper(Arc::downgrade(&buckets));
        Self {
            rps: cfg.rps,
            burst: cfg.burst,
            buckets,
            inner,
        }
    }

    /// Take one token from `ip`'s bucket; false means over the limit.
    fn allow(&self, ip: &str) -> bool {
        let now = Instant::now();
        let entry = self.buckets.entry(ip.to_string()).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: f64::from(self.burst),
                last_refill: now,
                last_seen: now,
            })
        });

        let mut bucket = entry.lock();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(f64::from(self.burst));
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl RequestHandler for RateLimiter {
    async fn handle(&self, req: Request<ProxyBody>, client: ClientInfo) -> Response<ProxyBody> {
        let ip = client_ip(req.headers(), client.remote_addr);
        if !self.allow(&ip) {
            warn!(ip = %ip, path = req.uri().path(), "rate limit exceeded");
            return text_response(StatusCode::TOO_MANY_REQUESTS, "too many requests");
        }
        self.inner.handle(req, client).await
    }
}

/// Resolve the client IP: `X-Real-IP` first, then the TCP peer address
/// without its port.
fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    remote.ip().to_string()
}

/// Periodically delete buckets nobody has used lately. Exits once the
/// owning limiter is gone.
fn spawn_sweeper(buckets: Weak<DashMap<String, Mutex<Bucket>>>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(buckets) = buckets.upgrade() else {
                break;
            };
            let before = buckets.len();
            buckets.retain(|_, bucket| bucket.lock().last_seen.elapsed() < IDLE_EXPIRY);
            debug!(
                purged = before - buckets.len(),
                remaining = buckets.len(),
                "rate limiter bucket sweep"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support::{client, get, Echo};

    fn limiter(rps: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(
            &RateLimitCfg {
                enabled: true,
                rps,
                burst,
            },
            Arc::new(Echo),
        )
    }

    #[tokio::test]
    async fn burst_is_honored_then_requests_are_rejected() {
        let limiter = limiter(0.001, 2);

        for _ in 0..2 {
            let response = limiter.handle(get("/"), client()).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = limiter.handle(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn distinct_ips_get_distinct_buckets() {
        let limiter = limiter(0.001, 1);

        assert!(limiter.allow("10.0.0.1"));
        assert!(limiter.allow("10.0.0.2"));
        assert!(!limiter.allow("10.0.0.1"));
        assert!(!limiter.allow("10.0.0.2"));
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let limiter = limiter(50.0, 1);

        assert!(limiter.allow("10.0.0.1"));
        assert!(!limiter.allow("10.0.0.1"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.allow("10.0.0.1"));
    }

    #[tokio::test]
    async fn refill_never_exceeds_burst() {
        let limiter = limiter(100.0, 2);

        assert!(limiter.allow("10.0.0.1"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Plenty of refill time has passed, but only `burst` tokens fit.
        assert!(limiter.allow("10.0.0.1"));
        assert!(limiter.allow("10.0.0.1"));
        assert!(!limiter.allow("10.0.0.1"));
    }

    #[test]
    fn client_ip_prefers_x_real_ip() {
        let remote: SocketAddr = "192.0.2.7:5555".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, remote), "192.0.2.7");

        headers.insert("x-real-ip", "203.0.113.9".parse().unwrap());
        assert_eq!(client_ip(&headers, remote), "203.0.113.9");
    }
}
