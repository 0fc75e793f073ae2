//! Smooth weighted round-robin selection.

use std::sync::Arc;

use parking_lot::Mutex;

use torii_common::ToriiResult;

use crate::backend::{Backend, BackendList};

use super::no_healthy;

/// The nginx smooth weighted round-robin algorithm.
///
/// Per selection, under a short lock with no I/O:
///
/// 1. Every selectable entry gains its static weight.
/// 2. The entry with the highest current weight wins, earliest index on
///    ties.
/// 3. The winner loses the sum of all selectable weights.
///
/// Over any window with a stable selectable set, backend `i` is chosen at
/// `weight_i / total` and selections interleave instead of bursting: for
/// weights 3 and 1 the sequence is `A A B A` repeating, not `A A A B`.
#[derive(Debug)]
pub struct WeightedRoundRobin {
    entries: Mutex<Vec<WrrEntry>>,
}

#[derive(Debug)]
struct WrrEntry {
    backend: Arc<Backend>,
    current_weight: i64,
}

impl WeightedRoundRobin {
    pub fn new(backends: BackendList) -> Self {
        let entries = backends
            .iter()
            .map(|b| WrrEntry {
                backend: Arc::clone(b),
                current_weight: 0,
            })
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn next(&self) -> ToriiResult<Arc<Backend>> {
        let chosen = {
            let mut entries = self.entries.lock();

            let mut total: i64 = 0;
            let mut best: Option<usize> = None;
            for e in entries.iter_mut() {
                if !e.backend.selectable() {
                    continue;
                }
                let weight = i64::from(e.backend.weight());
                total += weight;
                e.current_weight += weight;
            }
            for (i, e) in entries.iter().enumerate() {
                if !e.backend.selectable() {
                    continue;
                }
                match best {
                    Some(j) if entries[j].current_weight >= e.current_weight => {}
                    _ => best = Some(i),
                }
            }

            let Some(best) = best else {
                return Err(no_healthy());
            };
            entries[best].current_weight -= total;
            Arc::clone(&entries[best].backend)
        };

        chosen.inc_conns();
        Ok(chosen)
    }
}
