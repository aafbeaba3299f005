//! Cooperative stop requests keyed by job name or task id.
//!
//! A stop cancels the token handed to every running body registered under
//! that name. A stop for a name with nothing running is remembered and
//! applied to the next body registered under it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct StopState {
    running: HashMap<String, Vec<(u64, CancellationToken)>>,
    pending: HashSet<String>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct StopRegistry {
    state: Arc<Mutex<StopState>>,
}

impl StopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a body about to run under `name`.
    ///
    /// The returned guard's token is a child of `parent`; dropping the guard
    /// unregisters it.
    pub fn register(&self, name: &str, parent: &CancellationToken) -> StopGuard {
        let token = parent.child_token();
        let mut state = self.lock();
        if state.pending.remove(name) {
            tracing::info!(name, "Stop was requested before start");
            token.cancel();
        }
        let id = state.next_id;
        state.next_id += 1;
        state
            .running
            .entry(name.to_string())
            .or_default()
            .push((id, token.clone()));
        StopGuard {
            registry: self.clone(),
            name: name.to_string(),
            id,
            token,
        }
    }

    /// Cancels every body running under `name`. Returns how many.
    pub fn stop(&self, name: &str) -> usize {
        let mut state = self.lock();
        let stopped = state.running.get(name).map_or(0, |bodies| {
            bodies.iter().for_each(|(_, t)| t.cancel());
            bodies.len()
        });
        if stopped == 0 {
            state.pending.insert(name.to_string());
        }
        stopped
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock().running.get(name).is_some_and(|b| !b.is_empty())
    }

    /// Forgets remembered stops.
    pub fn clear_pending(&self) {
        self.lock().pending.clear();
    }

    fn unregister(&self, name: &str, id: u64) {
        let mut state = self.lock();
        if let Some(bodies) = state.running.get_mut(name) {
            bodies.retain(|(i, _)| *i != id);
            if bodies.is_empty() {
                state.running.remove(name);
            }
        }
    }
}

pub struct StopGuard {
    registry: StopRegistry,
    name: String,
    id: u64,
    token: CancellationToken,
}

impl StopGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.name, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_cancels_running_bodies() {
        let stops = StopRegistry::new();
        let root = CancellationToken::new();
        let g1 = stops.register("crawl", &root);
        let g2 = stops.register("crawl", &root);
        let other = stops.register("index", &root);

        assert_eq!(stops.stop("crawl"), 2);
        assert!(g1.token().is_cancelled());
        assert!(g2.token().is_cancelled());
        assert!(!other.token().is_cancelled());
    }

    #[test]
    fn early_stop_applies_to_next_start_only() {
        let stops = StopRegistry::new();
        let root = CancellationToken::new();
        assert_eq!(stops.stop("crawl"), 0);

        let first = stops.register("crawl", &root);
        assert!(first.token().is_cancelled());
        drop(first);

        let second = stops.register("crawl", &root);
        assert!(!second.token().is_cancelled());
    }

    #[test]
    fn guard_drop_unregisters() {
        let stops = StopRegistry::new();
        let root = CancellationToken::new();
        let g = stops.register("crawl", &root);
        assert!(stops.is_running("crawl"));
        drop(g);
        assert!(!stops.is_running("crawl"));
    }

    #[test]
    fn clear_pending_forgets_early_stops() {
        let stops = StopRegistry::new();
        stops.stop("crawl");
        stops.clear_pending();
        let g = stops.register("crawl", &CancellationToken::new());
        assert!(!g.token().is_cancelled());
    }

    #[test]
    fn parent_cancellation_reaches_bodies() {
        let stops = StopRegistry::new();
        let root = CancellationToken::new();
        let g = stops.register("crawl", &root);
        root.cancel();
        assert!(g.token().is_cancelled());
    }
}
