//! Composite readiness latch.
//!
//! The broker is ready once every registered probe reports ready. Watchers
//! are notified on every change of the combined state. Probes are passive;
//! whoever flips one calls [`ReadyManager::reevaluate`] afterwards, on the
//! same thread that drives the rest of the broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

/// One readiness condition.
pub trait ReadyProbe: Send + Sync {
    fn name(&self) -> &str;
    fn is_ready(&self) -> bool;
}

/// A probe that is explicitly set ready or unready.
#[derive(Debug)]
pub struct SimpleProbe {
    name: String,
    ready: AtomicBool,
}

impl SimpleProbe {
    pub fn new(name: impl Into<String>) -> Self {
        SimpleProbe {
            name: name.into(),
            ready: AtomicBool::new(false),
        }
    }

    /// Returns `true` if the state changed.
    pub fn set_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::AcqRel)
    }

    /// Returns `true` if the state changed.
    pub fn set_unready(&self) -> bool {
        self.ready.swap(false, Ordering::AcqRel)
    }
}

impl ReadyProbe for SimpleProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Watcher invoked with the new combined state.
pub type ReadyWatcher = Box<dyn FnMut(bool)>;

/// Combines a fixed set of probes into one ready state.
pub struct ReadyManager {
    probes: Vec<Arc<dyn ReadyProbe>>,
    watchers: Vec<ReadyWatcher>,
    is_ready: bool,
}

impl ReadyManager {
    pub fn new(probes: Vec<Arc<dyn ReadyProbe>>) -> Self {
        let is_ready = Self::combined_state(&probes);

        ReadyManager {
            probes,
            watchers: Vec::new(),
            is_ready,
        }
    }

    fn combined_state(probes: &[Arc<dyn ReadyProbe>]) -> bool {
        probes.iter().all(|p| p.is_ready())
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    /// Register a watcher, optionally calling it with the current state
    /// right away.
    pub fn add_watcher(&mut self, mut watcher: ReadyWatcher, call_now: bool) {
        if call_now {
            watcher(self.is_ready);
        }

        self.watchers.push(watcher);
    }

    /// Recompute the combined state after some probe changed; watchers are
    /// notified iff the combined state changed.
    pub fn reevaluate(&mut self) {
        let state = Self::combined_state(&self.probes);

        if std::mem::replace(&mut self.is_ready, state) != state {
            for watcher in &mut self.watchers {
                watcher(state);
            }
        }
    }

    pub fn probe(&self, idx: usize) -> Option<&Arc<dyn ReadyProbe>> {
        self.probes.get(idx)
    }

    /// Log the state of every probe.
    pub fn dump(&self) {
        for probe in &self.probes {
            info!(
                "probe \"{}\": {}ready",
                probe.name(),
                if probe.is_ready() { "" } else { "not " }
            );
        }
    }
}
