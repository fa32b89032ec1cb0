use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use super::ControllerEntry;
use crate::platform::ServiceId;

/// Stable reference to a registry entry, safe to hold after the entry is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(u64);

impl EntryHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Matched controllers in match order.
pub struct ControllerRegistry {
    entries: Mutex<Vec<Arc<ControllerEntry>>>,
    next_handle: AtomicU64,
    default_latency_us: u64,
}

impl ControllerRegistry {
    pub fn new(default_latency_us: u64) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            default_latency_us,
        }
    }

    fn entries_lock(&self) -> MutexGuard<'_, Vec<Arc<ControllerEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a controller, or return its existing entry.
    pub fn add(&self, controller: ServiceId) -> Arc<ControllerEntry> {
        let mut entries = self.entries_lock();
        if let Some(existing) = entries.iter().find(|e| e.controller() == controller) {
            debug!("{}: already registered", controller);
            return existing.clone();
        }

        let handle = EntryHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(ControllerEntry::new(
            handle,
            controller,
            self.default_latency_us,
        ));
        entries.push(entry.clone());
        info!("{}: registered as {}", controller, handle);
        entry
    }

    pub fn lookup(&self, controller: ServiceId) -> Option<Arc<ControllerEntry>> {
        self.entries_lock()
            .iter()
            .find(|e| e.controller() == controller)
            .cloned()
    }

    pub fn get(&self, handle: EntryHandle) -> Option<Arc<ControllerEntry>> {
        self.entries_lock()
            .iter()
            .find(|e| e.handle() == handle)
            .cloned()
    }

    /// Unregister a controller and release its resources.
    ///
    /// Teardown runs after the registry lock is dropped, under the entry lock,
    /// so an in-flight sweep or PM callback either finishes first or sees the
    /// entry torn down.
    pub fn remove(&self, controller: ServiceId) -> bool {
        let removed = {
            let mut entries = self.entries_lock();
            entries
                .iter()
                .position(|e| e.controller() == controller)
                .map(|i| entries.remove(i))
        };
        match removed {
            Some(entry) => {
                entry.teardown();
                info!("{}: unregistered", controller);
                true
            }
            None => {
                debug!("{}: not registered", controller);
                false
            }
        }
    }

    /// Snapshot of the current entries, in match order.
    pub fn entries(&self) -> Vec<Arc<ControllerEntry>> {
        self.entries_lock().clone()
    }

    /// Unregister everything.
    pub fn clear(&self) {
        let drained: Vec<_> = self.entries_lock().drain(..).collect();
        for entry in drained {
            entry.teardown();
        }
    }

    pub fn len(&self) -> usize {
        self.entries_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
