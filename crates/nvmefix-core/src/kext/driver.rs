use std::ffi::c_void;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{Kext, io_return};
use crate::error::{Error, Result};
use crate::memory::layout::identify;
use crate::nvme::{FeatureId, NvmeDriver};
use crate::platform::{DmaBuffer, ServiceId};

/// [`NvmeDriver`] that issues admin commands through the driver's own
/// request objects.
pub struct DriverAdmin {
    kext: Arc<Kext>,
}

impl DriverAdmin {
    /// The functions and required members of `kext` must be resolved before
    /// any command is issued.
    pub fn new(kext: Arc<Kext>) -> Self {
        Self { kext }
    }

    /// Borrow a request from the controller's pool for the duration of `f`.
    fn with_request<T>(
        &self,
        controller: ServiceId,
        stage: &'static str,
        f: impl FnOnce(*mut c_void) -> Result<T>,
    ) -> Result<T> {
        let functions = &self.kext.functions;
        let request = (functions.get_request.get())(controller.as_ptr(), 1);
        if request.is_null() {
            return Err(Error::Driver {
                controller,
                stage,
                status: io_return::NO_RESOURCES,
            });
        }
        trace!("{}: request {:p} for {}", controller, request, stage);

        if self.kext.members.controller.is_resolved() {
            // SAFETY: `request` is a live AppleNVMeRequest from GetRequest.
            unsafe { self.kext.members.controller.write(request, controller.as_ptr()) };
        }

        let result = f(request);
        (functions.return_request.get())(controller.as_ptr(), request);
        result
    }

    fn check(controller: ServiceId, stage: &'static str, status: i32) -> Result<()> {
        if status == io_return::SUCCESS {
            Ok(())
        } else {
            Err(Error::Driver {
                controller,
                stage,
                status,
            })
        }
    }

    fn features(
        &self,
        controller: ServiceId,
        fid: FeatureId,
        dword11: Option<u32>,
        buffer: Option<&mut dyn DmaBuffer>,
        set: bool,
    ) -> Result<u32> {
        let stage = if set { "set features" } else { "get features" };
        let functions = &self.kext.functions;
        let members = &self.kext.members;

        self.with_request(controller, stage, |request| {
            let build = if set {
                &functions.build_set_features
            } else {
                &functions.build_get_features
            };
            (build.get())(request, fid.id());

            if let Some(dword11) = dword11 {
                // SAFETY: `request` is live and owned by us until returned.
                unsafe {
                    let mut command = members.command.read(request);
                    command.cdw11 = dword11;
                    members.command.write(request, command);
                }
            }

            let descriptor = buffer.map(|b| (b.descriptor(), b.len()));
            if let Some((descriptor, len)) = descriptor {
                // SAFETY: as above; the descriptor outlives the request.
                unsafe { members.prp_descriptor.write(request, descriptor) };
                let status = (functions.generate_iovm_segments.get())(request, 0, len as u64);
                if let Err(e) = Self::check(controller, stage, status) {
                    // SAFETY: as above.
                    unsafe { members.prp_descriptor.write(request, std::ptr::null_mut()) };
                    return Err(e);
                }
            }

            let status = (functions.process_sync_request.get())(controller.as_ptr(), request);
            if descriptor.is_some() {
                // SAFETY: as above.
                unsafe { members.prp_descriptor.write(request, std::ptr::null_mut()) };
            }
            Self::check(controller, stage, status)?;

            let nvme_status = (functions.get_status.get())(request);
            if nvme_status != 0 {
                return Err(Error::NvmeStatus {
                    controller,
                    stage,
                    status: nvme_status,
                });
            }

            // SAFETY: as above.
            let dword0 = unsafe { members.result.read(request) };
            debug!("{}: {} {} -> {:#x}", controller, stage, fid, dword0);
            Ok(dword0)
        })
    }
}

impl NvmeDriver for DriverAdmin {
    fn identify(&self, controller: ServiceId, buffer: &mut dyn DmaBuffer) -> Result<()> {
        if buffer.len() < identify::SIZE {
            return Err(Error::BufferAllocation(identify::SIZE));
        }
        let issue = &self.kext.functions.issue_identify_command;
        self.with_request(controller, "identify", |request| {
            let status = (issue.get())(controller.as_ptr(), buffer.descriptor(), request, 0);
            Self::check(controller, "identify", status)
        })
    }

    fn get_features(
        &self,
        controller: ServiceId,
        fid: FeatureId,
        buffer: Option<&mut dyn DmaBuffer>,
    ) -> Result<u32> {
        self.features(controller, fid, None, buffer, false)
    }

    fn set_features(
        &self,
        controller: ServiceId,
        fid: FeatureId,
        dword11: u32,
        buffer: Option<&mut dyn DmaBuffer>,
    ) -> Result<u32> {
        self.features(controller, fid, Some(dword11), buffer, true)
    }

    fn clear_msi_workaround(&self, controller: ServiceId) -> bool {
        let member = &self.kext.members.msi_workaround;
        if !member.is_resolved() || controller.is_null() {
            return false;
        }
        // SAFETY: `controller` is a live IONVMeController.
        unsafe { member.write(controller.as_ptr(), 0) };
        true
    }
}
