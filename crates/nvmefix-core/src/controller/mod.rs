//! Per-controller bookkeeping and the APST configuration state machine

mod configure;
mod registry;

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;

use serde::Serialize;
use strum::{Display, IntoStaticStr};
use tracing::debug;

use crate::nvme::Quirks;
use crate::platform::{DmaBuffer, PmProxyHandle, ServiceId};
use crate::pm::PowerState;

pub use configure::*;
pub use registry::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display, IntoStaticStr)]
pub enum ControllerState {
    /// Not yet identified, or the last identify failed
    #[default]
    Unprocessed,
    Identifying,
    /// APST left alone: quirk, zero budget, no support or a failed Set Features
    ApstIneligible,
    Configuring,
    Configured,
    /// Removed from the registry, all resources released
    TornDown,
}

/// Mutable per-controller data, guarded by the entry lock.
pub struct EntryState {
    pub state: ControllerState,
    pub processed: bool,
    pub quirks: Quirks,
    pub ps_max_latency_us: u64,
    /// Power-state table registered with the PM proxy
    pub power_states: Vec<PowerState>,
    pub apste: bool,
    pub identify: Option<Box<dyn DmaBuffer>>,
    pub pm: Option<Box<dyn PmProxyHandle>>,
    pub last_active: Option<Instant>,
    /// Ordinal the PM proxy last reported
    pub power_ordinal: Option<usize>,
}

impl EntryState {
    fn new(ps_max_latency_us: u64) -> Self {
        Self {
            state: ControllerState::Unprocessed,
            processed: false,
            quirks: Quirks::empty(),
            ps_max_latency_us,
            power_states: Vec::new(),
            apste: false,
            identify: None,
            pm: None,
            last_active: None,
            power_ordinal: None,
        }
    }

    /// APST may be configured: no quirk forbids it and the budget is non-zero.
    pub fn apst_allowed(&self) -> bool {
        !self.quirks.contains(Quirks::NO_APST) && self.ps_max_latency_us > 0
    }

    pub fn is_torn_down(&self) -> bool {
        self.state == ControllerState::TornDown
    }
}

/// One matched NVMe controller.
///
/// Owned by the [`ControllerRegistry`]; everything else refers to it through
/// its [`EntryHandle`].
pub struct ControllerEntry {
    handle: EntryHandle,
    controller: ServiceId,
    state: Mutex<EntryState>,
}

impl ControllerEntry {
    pub fn new(handle: EntryHandle, controller: ServiceId, ps_max_latency_us: u64) -> Self {
        Self {
            handle,
            controller,
            state: Mutex::new(EntryState::new(ps_max_latency_us)),
        }
    }

    pub fn handle(&self) -> EntryHandle {
        self.handle
    }

    pub fn controller(&self) -> ServiceId {
        self.controller
    }

    /// Take the entry lock. A panic in another holder does not wedge the entry.
    pub fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the entry lock unless someone else holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, EntryState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.lock().state
    }

    /// Release everything the entry owns. Idempotent.
    ///
    /// The entry is marked torn down and emptied under its lock. The proxy is
    /// then detached from the controller, stopped and released with the lock
    /// dropped, since stopping waits for power callbacks that take the lock.
    pub fn teardown(&self) {
        let pm = {
            let mut state = self.lock();
            state.power_states.clear();
            state.identify = None;
            state.apste = false;
            state.state = ControllerState::TornDown;
            state.pm.take()
        };
        if let Some(pm) = pm {
            if !self.controller.is_null() {
                pm.deregister_interest(self.controller);
            }
            pm.stop();
            drop(pm);
        }
        debug!("{}: torn down", self.controller);
    }
}
