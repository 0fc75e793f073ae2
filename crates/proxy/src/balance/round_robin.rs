//! Round-robin selection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use torii_common::ToriiResult;

use crate::backend::{Backend, BackendList};

use super::{no_healthy, selectable_subset};

/// Even distribution across selectable backends via a lock-free counter.
///
/// The counter is global and monotonic; the modulo is taken over the
/// selectable subset at selection time. While health flaps, the short-term
/// distribution can skew, which is acceptable: it converges as soon as the
/// subset is stable again.
#[derive(Debug)]
pub struct RoundRobin {
    backends: BackendList,
    counter: AtomicU64,
}

impl RoundRobin {
    pub fn new(backends: BackendList) -> Self {
        Self {
            backends,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> ToriiResult<Arc<Backend>> {
        let subset = selectable_subset(&self.backends);
        if subset.is_empty() {
            return Err(no_healthy());
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let chosen = Arc::clone(subset[(n % subset.len() as u64) as usize]);
        chosen.inc_conns();
        Ok(chosen)
    }
}
