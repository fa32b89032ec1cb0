//! Controller state machine
//!
//! `Unprocessed -> Identifying -> (ApstIneligible | Configuring) -> Configured`
//!
//! A failed identify puts the entry back to `Unprocessed`; the next sweep
//! tries again. Every other outcome is final for the life of the entry.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ControllerEntry, ControllerRegistry, ControllerState, EntryState};
use crate::config::{Config, LATENCY_PROPERTY};
use crate::error::{Error, Result};
use crate::memory::layout::{apst, identify};
use crate::nvme::{
    ApstPlan, FeatureId, IdentifyController, NvmeDriver, QuirkEntry, decode_apst_table,
    lookup_quirks,
};
use crate::platform::{Platform, ServiceId, find_property};
use crate::pm::{PmProxy, power_state_table};

/// PCI vendor id of Apple's own controllers
pub const APPLE_VID: u16 = 0x106b;

/// Everything the state machine needs besides the entry.
pub struct Configurator<'a> {
    pub platform: &'a dyn Platform,
    pub driver: &'a Arc<dyn NvmeDriver>,
    pub registry: &'a Arc<ControllerRegistry>,
    pub config: &'a Config,
    pub quirks: &'a [QuirkEntry],
}

impl Configurator<'_> {
    /// Drive one entry as far as it goes. Entries already processed, or
    /// torn down meanwhile, are left alone.
    pub fn process(&self, entry: &ControllerEntry) {
        let controller = entry.controller();
        let mut state = entry.lock();
        if state.processed || state.is_torn_down() {
            return;
        }

        state.state = ControllerState::Identifying;
        let ctrl = match self.identify(controller, &mut state) {
            Ok(ctrl) => ctrl,
            Err(e) => {
                warn!("{}: identify failed, will retry: {}", controller, e);
                state.state = ControllerState::Unprocessed;
                return;
            }
        };
        state.processed = true;
        info!(
            "{}: {:04x} {} (fw {}), {} power states, APSTA {}",
            controller,
            ctrl.vid,
            ctrl.model,
            ctrl.firmware,
            ctrl.npss as usize + 1,
            ctrl.supports_apst()
        );

        if ctrl.vid != APPLE_VID && self.driver.clear_msi_workaround(controller) {
            debug!("{}: cleared ANS2 MSI workaround", controller);
        }

        state.quirks = lookup_quirks(self.quirks, &ctrl);
        if let Some(latency) = find_property(
            self.platform,
            controller,
            LATENCY_PROPERTY,
            self.config.controller_search_depth,
        ) {
            debug!("{}: {} = {}", controller, LATENCY_PROPERTY, latency);
            state.ps_max_latency_us = latency;
        }

        if !state.apst_allowed() || !ctrl.supports_apst() {
            info!(
                "{}: APST not allowed (quirks {:?}, latency budget {} us, APSTA {})",
                controller,
                state.quirks,
                state.ps_max_latency_us,
                ctrl.apsta
            );
            state.state = ControllerState::ApstIneligible;
        } else {
            state.state = ControllerState::Configuring;
            match self.enable_apst(controller, &ctrl, &state) {
                Ok(plan) if !plan.is_enabled() => {
                    info!(
                        "{}: APST disabled, no state fits {} us",
                        controller, state.ps_max_latency_us
                    );
                    state.apste = false;
                    state.state = ControllerState::ApstIneligible;
                }
                Ok(plan) => {
                    state.apste = true;
                    state.state = ControllerState::Configured;
                    info!(
                        "{}: APST enabled, deepest target {:?}, worst latency {} us",
                        controller,
                        plan.max_ps(),
                        plan.worst_latency_us()
                    );
                    self.verify(controller);
                }
                Err(e) if e.is_device_failure() => {
                    warn!("{}: controller rejected APST: {}", controller, e);
                    state.state = ControllerState::ApstIneligible;
                }
                Err(e) => {
                    warn!("{}: failed to configure APST: {}", controller, e);
                    state.state = ControllerState::ApstIneligible;
                }
            }
        }

        if self.config.debug {
            if let Err(e) = self.dump_apst(controller, ctrl.npss) {
                warn!("{}: failed to dump APST table: {}", controller, e);
            }
        }

        self.attach_proxy(entry, &ctrl, &mut state);
    }

    fn identify(&self, controller: ServiceId, state: &mut EntryState) -> Result<IdentifyController> {
        if state.identify.is_none() {
            state.identify = self.platform.alloc_buffer(identify::SIZE);
        }
        let buffer = state
            .identify
            .as_deref_mut()
            .ok_or(Error::BufferAllocation(identify::SIZE))?;
        buffer.as_mut_slice().fill(0);
        self.driver.identify(controller, buffer)?;
        IdentifyController::parse(buffer.as_slice())
    }

    fn enable_apst(
        &self,
        controller: ServiceId,
        ctrl: &IdentifyController,
        state: &EntryState,
    ) -> Result<ApstPlan> {
        // An empty plan is still sent so the device ends up with APST off.
        let plan = ApstPlan::build(&ctrl.power_states, state.ps_max_latency_us, state.quirks);
        let mut buffer = self
            .platform
            .alloc_buffer(apst::SIZE)
            .ok_or(Error::BufferAllocation(apst::SIZE))?;
        let bytes = plan.to_bytes();
        buffer.as_mut_slice()[..bytes.len()].copy_from_slice(&bytes);

        self.driver.set_features(
            controller,
            FeatureId::AutonomousPowerStateTransition,
            plan.dword11(),
            Some(buffer.as_mut()),
        )?;
        Ok(plan)
    }

    /// Read APSTE back; a mismatch only warrants a warning.
    fn verify(&self, controller: ServiceId) {
        match self
            .driver
            .get_features(controller, FeatureId::AutonomousPowerStateTransition, None)
        {
            Ok(dword0) if dword0 & apst::ENABLE != 0 => debug!("{}: APST verified", controller),
            Ok(dword0) => warn!(
                "{}: APST enable not reflected by the device ({:#x})",
                controller, dword0
            ),
            Err(e) => warn!("{}: failed to read back APST state: {}", controller, e),
        }
    }

    fn dump_apst(&self, controller: ServiceId, npss: u8) -> Result<()> {
        let mut buffer = self
            .platform
            .alloc_buffer(apst::SIZE)
            .ok_or(Error::BufferAllocation(apst::SIZE))?;
        let dword0 = self.driver.get_features(
            controller,
            FeatureId::AutonomousPowerStateTransition,
            Some(buffer.as_mut()),
        )?;
        info!("{}: APSTE {}", controller, dword0 & apst::ENABLE);
        for entry in decode_apst_table(buffer.as_slice(), npss) {
            info!(
                "{}: PS{} -> PS{} after {} ms",
                controller, entry.state, entry.target_state, entry.idle_time_ms
            );
        }
        Ok(())
    }

    fn attach_proxy(&self, entry: &ControllerEntry, ctrl: &IdentifyController, state: &mut EntryState) {
        if state.pm.is_some() {
            return;
        }
        let states = power_state_table(ctrl);
        let proxy = Arc::new(PmProxy::new(
            entry.handle(),
            Arc::downgrade(self.registry),
            self.driver.clone(),
            self.config.idle_period(),
        ));
        match self
            .platform
            .attach_pm_proxy(entry.controller(), &states, proxy)
        {
            Some(handle) => {
                state.pm = Some(handle);
                state.power_states = states;
                debug!("{}: PM proxy attached", entry.controller());
            }
            None => warn!("{}: failed to attach PM proxy", entry.controller()),
        }
    }
}
