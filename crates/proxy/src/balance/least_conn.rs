//! Least-connections selection.

use std::sync::Arc;

use torii_common::ToriiResult;

use crate::backend::{Backend, BackendList};

use super::no_healthy;

/// Route each request to the selectable backend with the fewest active
/// connections, first declared wins on ties.
///
/// The scan and the increment are not one atomic step: two concurrent
/// callers may both observe the same minimum and pick the same backend.
/// The algorithm is an approximation and the counters correct it on the
/// very next selection.
#[derive(Debug)]
pub struct LeastConnections {
    backends: BackendList,
}

impl LeastConnections {
    pub fn new(backends: BackendList) -> Self {
        Self { backends }
    }

    pub fn next(&self) -> ToriiResult<Arc<Backend>> {
        let mut best: Option<&Arc<Backend>> = None;
        for b in self.backends.iter() {
            if !b.selectable() {
                continue;
            }
            match best {
                Some(current) if current.active_conns() <= b.active_conns() => {}
                _ => best = Some(b),
            }
        }

        let Some(best) = best else {
            return Err(no_healthy());
        };
        let chosen = Arc::clone(best);
        chosen.inc_conns();
        Ok(chosen)
    }
}
