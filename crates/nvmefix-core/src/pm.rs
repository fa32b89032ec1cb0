//! Power-management proxy
//!
//! A proxy joins each controller's power tree once the controller is
//! configured. It gates the host's requests to drop power on recent activity
//! and, for controllers without APST, selects the NVMe power state itself.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::controller::{ControllerRegistry, EntryHandle};
use crate::nvme::{FeatureId, IdentifyController, NvmeDriver};

bitflags! {
    /// `IOPMPowerFlags` subset used in the power-state table
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(from = "u64", into = "u64")]
    pub struct PowerFlags: u64 {
        const POWER_ON = 0x0000_0002;
        const DEVICE_USABLE = 0x0000_8000;
        const LOW_POWER = 0x0001_0000;
    }
}

impl From<u64> for PowerFlags {
    fn from(bits: u64) -> Self {
        PowerFlags::from_bits_retain(bits)
    }
}

impl From<PowerFlags> for u64 {
    fn from(flags: PowerFlags) -> Self {
        flags.bits()
    }
}

/// One row of the table registered with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerState {
    /// NVMe power state entered at this ordinal; `None` for off
    pub nvme_state: Option<u8>,
    pub capability: PowerFlags,
    pub max_power_mw: u32,
}

/// Power-state table for a controller: ordinal 0 is off, then one ordinal per
/// NVMe power state from the deepest up to PS0 at the highest ordinal.
pub fn power_state_table(ctrl: &IdentifyController) -> Vec<PowerState> {
    let off = PowerState {
        nvme_state: None,
        capability: PowerFlags::empty(),
        max_power_mw: 0,
    };
    std::iter::once(off)
        .chain(
            ctrl.power_states
                .iter()
                .enumerate()
                .rev()
                .map(|(ps, psd)| PowerState {
                    nvme_state: Some(ps as u8),
                    capability: if psd.is_non_operational() {
                        PowerFlags::POWER_ON | PowerFlags::LOW_POWER
                    } else {
                        PowerFlags::POWER_ON | PowerFlags::DEVICE_USABLE
                    },
                    max_power_mw: psd.max_power_mw(),
                }),
        )
        .collect()
}

/// Reply to a power-state change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAck {
    /// Change is complete
    Implied,
    /// Device is busy; the host should ask again later
    Busy,
}

/// Host callbacks for one controller's proxy object.
///
/// Holds a handle, not the entry: after the controller is unregistered every
/// callback finds nothing and acknowledges.
pub struct PmProxy {
    handle: EntryHandle,
    registry: Weak<ControllerRegistry>,
    driver: Arc<dyn NvmeDriver>,
    idle_period: Duration,
}

impl PmProxy {
    pub fn new(
        handle: EntryHandle,
        registry: Weak<ControllerRegistry>,
        driver: Arc<dyn NvmeDriver>,
        idle_period: Duration,
    ) -> Self {
        Self {
            handle,
            registry,
            driver,
            idle_period,
        }
    }

    pub fn handle(&self) -> EntryHandle {
        self.handle
    }

    /// `setPowerState`
    pub fn set_power_state(&self, ordinal: usize) -> PowerAck {
        let Some(entry) = self.registry.upgrade().and_then(|r| r.get(self.handle)) else {
            debug!("{}: setPowerState({}) for unknown entry", self.handle, ordinal);
            return PowerAck::Implied;
        };
        let controller = entry.controller();
        let state = entry.lock();
        if state.is_torn_down() {
            return PowerAck::Implied;
        }
        let Some(target) = state.power_states.get(ordinal).copied() else {
            warn!("{}: power ordinal {} out of range", controller, ordinal);
            return PowerAck::Implied;
        };

        if state.apste {
            let dropping = state.power_ordinal.is_some_and(|current| ordinal < current);
            let recent = state
                .last_active
                .is_some_and(|at| at.elapsed() < self.idle_period);
            if dropping && recent {
                debug!("{}: deferring drop to ordinal {}", controller, ordinal);
                return PowerAck::Busy;
            }
            return PowerAck::Implied;
        }

        if let Some(ps) = target.nvme_state {
            match self
                .driver
                .set_features(controller, FeatureId::PowerManagement, ps as u32, None)
            {
                Ok(_) => debug!("{}: entered PS{}", controller, ps),
                Err(e) => warn!("{}: failed to enter PS{}: {}", controller, ps, e),
            }
        }
        PowerAck::Implied
    }

    /// `powerStateDidChangeTo`
    pub fn power_state_did_change_to(&self, ordinal: usize) {
        if let Some(entry) = self.registry.upgrade().and_then(|r| r.get(self.handle)) {
            let mut state = entry.lock();
            if !state.is_torn_down() {
                state.power_ordinal = Some(ordinal);
            }
        }
    }
}
