//! Mutable source of truth for the backend pool.
//!
//! The [`Registry`] is the only place the backend list changes. The admin
//! API and the config reloader both write through it; everything else
//! consumes immutable snapshots. After every successful mutation the
//! registered change callback fires with the strategy and a fresh
//! snapshot, outside the registry lock, so the callback is free to call
//! back into the registry or push swaps into the engine and monitor.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use torii_common::{ToriiError, ToriiResult};
use torii_config::Strategy;

use crate::backend::{Backend, BackendList};

/// Change notification: the current strategy and the new pool snapshot.
pub type ChangeCallback = Box<dyn Fn(Strategy, BackendList) + Send + Sync>;

/// Serializable view of one backend's state and counters.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub url: String,
    pub weight: u32,
    pub healthy: bool,
    pub blocked: bool,
    pub active_conns: i64,
    pub total_requests: i64,
    pub total_errors: i64,
}

impl BackendInfo {
    fn snapshot(backend: &Backend) -> Self {
        Self {
            url: backend.raw_url().to_string(),
            weight: backend.weight(),
            healthy: backend.is_healthy(),
            blocked: backend.is_blocked(),
            active_conns: backend.active_conns(),
            total_requests: backend.total_requests(),
            total_errors: backend.total_errors(),
        }
    }
}

struct Inner {
    backends: Vec<Arc<Backend>>,
    strategy: Strategy,
}

/// Thread-safe, mutable backend pool with change notification.
pub struct Registry {
    inner: RwLock<Inner>,
    on_change: ChangeCallback,
}

impl Registry {
    /// Create a registry seeded with `backends` under `strategy`.
    pub fn new(
        backends: Vec<Arc<Backend>>,
        strategy: Strategy,
        on_change: ChangeCallback,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner { backends, strategy }),
            on_change,
        }
    }

    /// Current state of every backend, in declared order.
    pub fn list(&self) -> Vec<BackendInfo> {
        let inner = self.inner.read();
        inner.backends.iter().map(|b| BackendInfo::snapshot(b)).collect()
    }

    /// Snapshot of the current pool.
    pub fn backends(&self) -> BackendList {
        Arc::new(self.inner.read().backends.clone())
    }

    /// The strategy currently in force.
    pub fn strategy(&self) -> Strategy {
        self.inner.read().strategy
    }

    /// Register a new backend. Fails on an unparseable or duplicate URL.
    pub fn add(&self, url: &str, weight: u32) -> ToriiResult<()> {
        let backend = Arc::new(Backend::new(url, weight)?);

        let (strategy, snapshot) = {
            let mut inner = self.inner.write();
            if inner.backends.iter().any(|b| b.raw_url() == url) {
                return Err(ToriiError::DuplicateBackend(url.to_string()));
            }
            inner.backends.push(backend);
            (inner.strategy, Arc::new(inner.backends.clone()))
        };

        (self.on_change)(strategy, snapshot);
        Ok(())
    }

    /// Remove the backend registered under `url`.
    pub fn remove(&self, url: &str) -> ToriiResult<()> {
        let (strategy, snapshot) = {
            let mut inner = self.inner.write();
            let idx = inner
                .backends
                .iter()
                .position(|b| b.raw_url() == url)
                .ok_or_else(|| ToriiError::BackendNotFound(url.to_string()))?;
            inner.backends.remove(idx);
            (inner.strategy, Arc::new(inner.backends.clone()))
        };

        (self.on_change)(strategy, snapshot);
        Ok(())
    }

    /// Administratively veto the backend under `url`.
    pub fn block(&self, url: &str) -> ToriiResult<()> {
        self.set_blocked(url, true)
    }

    /// Lift the veto on the backend under `url`.
    pub fn unblock(&self, url: &str) -> ToriiResult<()> {
        self.set_blocked(url, false)
    }

    fn set_blocked(&self, url: &str, blocked: bool) -> ToriiResult<()> {
        let (strategy, snapshot) = {
            let inner = self.inner.read();
            let backend = inner
                .backends
                .iter()
                .find(|b| b.raw_url() == url)
                .ok_or_else(|| ToriiError::BackendNotFound(url.to_string()))?;
            backend.set_blocked(blocked);
            (inner.strategy, Arc::new(inner.backends.clone()))
        };

        (self.on_change)(strategy, snapshot);
        Ok(())
    }

    /// Swap the whole pool, as on a config-file reload.
    ///
    /// Backends whose URL and weight are unchanged keep their existing
    /// runtime record, so health state and counters survive the reload;
    /// everything else starts fresh.
    pub fn replace_all(&self, backends: Vec<Arc<Backend>>, strategy: Strategy) {
        let (strategy, snapshot) = {
            let mut inner = self.inner.write();
            let merged: Vec<Arc<Backend>> = backends
                .into_iter()
                .map(|new| {
                    inner
                        .backends
                        .iter()
                        .find(|old| {
                            old.raw_url() == new.raw_url() && old.weight() == new.weight()
                        })
                        .cloned()
                        .unwrap_or(new)
                })
                .collect();
            inner.backends = merged;
            inner.strategy = strategy;
            (strategy, Arc::new(inner.backends.clone()))
        };

        (self.on_change)(strategy, snapshot);
    }
}
