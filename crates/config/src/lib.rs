//! Configuration model for the Torii gateway.
//!
//! The gateway is driven by one YAML file. Every field has a default so a
//! minimal file only needs to list its backends:
//!
//! ```yaml
//! listen_addr: "0.0.0.0:8080"
//! strategy: round_robin
//! backends:
//!   - url: "http://127.0.0.1:8081"
//!     weight: 3
//!   - url: "http://127.0.0.1:8082"
//! health_check:
//!   enabled: true
//!   interval: 10s
//!   timeout: 2s
//!   path: /healthz
//! rate_limit:
//!   enabled: false
//!   rps: 100
//!   burst: 200
//! auth:
//!   enabled: false
//!   secret: ""
//!   exclude: []
//! admin:
//!   enabled: true
//!   listen_addr: "0.0.0.0:9091"
//! ```
//!
//! Loading and validation are strict: an unparseable file or an empty
//! backend list is an error, so a bad reload never replaces a good running
//! configuration. The only silent normalization is backend weight, where
//! zero or negative values are raised to 1.

pub mod duration;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use torii_common::{ToriiError, ToriiResult};

pub use duration::parse_duration;

/// Load-balancing strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
}

impl Strategy {
    /// The canonical config-file spelling of this strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::LeastConnections => "least_connections",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ToriiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" | "" => Ok(Strategy::RoundRobin),
            "weighted_round_robin" => Ok(Strategy::WeightedRoundRobin),
            "least_connections" => Ok(Strategy::LeastConnections),
            other => Err(ToriiError::UnknownStrategy(other.to_string())),
        }
    }
}

/// One upstream server as declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCfg {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: i64,
}

impl BackendCfg {
    /// Weight with the `>= 1` invariant applied.
    pub fn effective_weight(&self) -> u32 {
        if self.weight < 1 {
            1
        } else {
            self.weight.min(u32::MAX as i64) as u32
        }
    }
}

/// Active health-probing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval", deserialize_with = "duration::deserialize")]
    pub interval: Duration,
    #[serde(default = "default_timeout", deserialize_with = "duration::deserialize")]
    pub timeout: Duration,
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthCheckCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
            timeout: default_timeout(),
            path: default_health_path(),
        }
    }
}

/// Per-client-IP token-bucket rate limiting.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitCfg {
    #[serde(default)]
    pub enabled: bool,
    /// Sustained requests per second per client IP.
    #[serde(default = "default_rps")]
    pub rps: f64,
    /// Maximum instantaneous burst above the sustained rate.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            rps: default_rps(),
            burst: default_burst(),
        }
    }
}

/// JWT Bearer-token authentication.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthCfg {
    #[serde(default)]
    pub enabled: bool,
    /// HMAC-SHA256 signing secret shared with token issuers.
    #[serde(default)]
    pub secret: String,
    /// Exact request paths that bypass authentication.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Management API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_admin_addr")]
    pub listen_addr: String,
}

impl Default for AdminCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_admin_addr(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub backends: Vec<BackendCfg>,
    #[serde(default)]
    pub health_check: HealthCheckCfg,
    #[serde(default)]
    pub rate_limit: RateLimitCfg,
    #[serde(default)]
    pub auth: AuthCfg,
    #[serde(default)]
    pub admin: AdminCfg,
}

impl Config {
    /// A single-backend configuration for local development, used when no
    /// config file is available at startup.
    pub fn default_dev() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            strategy: Strategy::RoundRobin,
            backends: vec![BackendCfg {
                url: "http://localhost:8081".to_string(),
                weight: 1,
            }],
            health_check: HealthCheckCfg::default(),
            rate_limit: RateLimitCfg::default(),
            auth: AuthCfg::default(),
            admin: AdminCfg::default(),
        }
    }

    /// Parse a configuration from YAML text and validate it.
    pub fn from_yaml(text: &str) -> ToriiResult<Self> {
        let mut cfg: Config = serde_yaml::from_str(text)
            .map_err(|e| ToriiError::config(format!("parsing YAML: {e}")))?;
        cfg.validate()?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Read and parse the configuration file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> ToriiResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ToriiError::config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// Reject configurations the gateway cannot run with.
    fn validate(&self) -> ToriiResult<()> {
        if self.backends.is_empty() {
            return Err(ToriiError::config("at least one backend must be defined"));
        }
        for (i, b) in self.backends.iter().enumerate() {
            if b.url.trim().is_empty() {
                return Err(ToriiError::config(format!("backend[{i}] has an empty url")));
            }
        }
        if self.auth.enabled && self.auth.secret.is_empty() {
            return Err(ToriiError::config("auth.enabled requires auth.secret"));
        }
        if self.rate_limit.enabled && self.rate_limit.rps <= 0.0 {
            return Err(ToriiError::config("rate_limit.rps must be positive"));
        }
        if self.health_check.enabled && self.health_check.interval.is_zero() {
            return Err(ToriiError::config("health_check.interval must be positive"));
        }
        Ok(())
    }

    fn normalize(&mut self) {
        for b in &mut self.backends {
            if b.weight < 1 {
                b.weight = 1;
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_weight() -> i64 {
    1
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_addr() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_rps() -> f64 {
    100.0
}

fn default_burst() -> u32 {
    200
}
