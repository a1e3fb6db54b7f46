//! In-flight run registry
//!
//! At most one run per archive base name. A second request for a name that
//! is already running is refused without touching its directories. The slot
//! is released when the returned guard is dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

/// Base names of runs currently in progress
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    names: Mutex<HashSet<String>>,
}

impl InFlightRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `base_name`, or `None` if a run for it is already in flight.
    pub fn try_acquire(self: &Arc<Self>, base_name: &str) -> Option<InFlightGuard> {
        if !self.lock().insert(base_name.to_string()) {
            debug!(base_name, "run already in flight");
            return None;
        }
        Some(InFlightGuard {
            registry: Arc::clone(self),
            base_name: base_name.to_string(),
        })
    }

    pub fn is_in_flight(&self, base_name: &str) -> bool {
        self.lock().contains(base_name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock leaves the set itself consistent.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.names.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holds a registry slot; releases it on drop
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    base_name: String,
}

impl InFlightGuard {
    pub fn base_name(&self) -> &str {
        &self.base_name
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.base_name);
    }
}
