//! Error types for the Torii gateway.
//!
//! One enum covers every failure mode the gateway distinguishes. Selection
//! and dispatch errors are converted to HTTP responses at the request
//! boundary and never propagate further; registry errors surface to the
//! admin caller; configuration errors surface to the reloader or abort
//! startup.

use thiserror::Error;

/// Result alias used throughout the gateway.
pub type ToriiResult<T> = Result<T, ToriiError>;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum ToriiError {
    /// A backend URL could not be parsed into scheme + host:port.
    #[error("invalid backend URL {url:?}: {reason}")]
    InvalidBackendUrl { url: String, reason: String },

    /// An admin mutation tried to register a URL that already exists.
    #[error("backend {0:?} already exists")]
    DuplicateBackend(String),

    /// An admin mutation referenced a URL that is not registered.
    #[error("backend {0:?} not found")]
    BackendNotFound(String),

    /// Every backend is unhealthy or blocked.
    #[error("no healthy backend available")]
    NoHealthyBackend,

    /// The configuration named a load-balancing strategy we do not have.
    #[error("unknown load-balancing strategy {0:?}")]
    UnknownStrategy(String),

    /// Configuration could not be read, parsed, or validated.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ToriiError {
    /// Shorthand for a configuration error with a formatted message.
    pub fn config(message: impl Into<String>) -> Self {
        ToriiError::Config(message.into())
    }
}
