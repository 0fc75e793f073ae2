//! Load-balancing policies.
//!
//! Every policy works on an immutable [`BackendList`] snapshot and shares
//! one two-operation contract: [`Policy::next`] picks a selectable backend
//! and increments its active-connection count before returning, and
//! [`Policy::done`] releases that count exactly once when the request
//! finishes. Neither operation awaits, so both are safe to call from any
//! number of concurrent request tasks.
//!
//! Swapping the pool means constructing a fresh policy over the new list;
//! a policy never mutates its backend list after construction.

mod least_conn;
mod round_robin;
mod weighted;

pub use least_conn::LeastConnections;
pub use round_robin::RoundRobin;
pub use weighted::WeightedRoundRobin;

use std::sync::Arc;

use torii_common::{ToriiError, ToriiResult};
use torii_config::Strategy;

use crate::backend::{Backend, BackendList};

/// A selection algorithm over a fixed backend list.
#[derive(Debug)]
pub enum Policy {
    RoundRobin(RoundRobin),
    WeightedRoundRobin(WeightedRoundRobin),
    LeastConnections(LeastConnections),
}

impl Policy {
    /// Construct the policy named by `strategy` over `backends`.
    pub fn new(strategy: Strategy, backends: BackendList) -> Self {
        match strategy {
            Strategy::RoundRobin => Policy::RoundRobin(RoundRobin::new(backends)),
            Strategy::WeightedRoundRobin => {
                Policy::WeightedRoundRobin(WeightedRoundRobin::new(backends))
            }
            Strategy::LeastConnections => {
                Policy::LeastConnections(LeastConnections::new(backends))
            }
        }
    }

    /// Choose the backend for the next request.
    ///
    /// The winner's active-connection count is already incremented when
    /// this returns; callers must pair every success with one [`done`].
    ///
    /// [`done`]: Policy::done
    pub fn next(&self) -> ToriiResult<Arc<Backend>> {
        match self {
            Policy::RoundRobin(p) => p.next(),
            Policy::WeightedRoundRobin(p) => p.next(),
            Policy::LeastConnections(p) => p.next(),
        }
    }

    /// Release one active connection on `backend`.
    pub fn done(&self, backend: &Backend) {
        backend.dec_conns();
    }
}

/// Selectable backends from `all`, in declared order.
pub(crate) fn selectable_subset(all: &[Arc<Backend>]) -> Vec<&Arc<Backend>> {
    all.iter().filter(|b| b.selectable()).collect()
}

/// Shared failure for an empty selectable set.
pub(crate) fn no_healthy() -> ToriiError {
    ToriiError::NoHealthyBackend
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn pool(urls: &[(&str, u32)]) -> BackendList {
        Arc::new(
            urls.iter()
                .map(|(url, w)| Arc::new(Backend::new(url, *w).unwrap()))
                .collect(),
        )
    }
}
