//! Binding to the IONVMeFamily driver image
//!
//! Holds the symbols the plugin calls, the private members it touches and the
//! live [`NvmeDriver`](crate::nvme::NvmeDriver) built on both.

mod driver;

use std::ffi::c_void;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::nvme::NvmeCommand;
use crate::offset::{MemberId, MemberRef, OffsetStrategy};
use crate::patch::{Func, KernelPatcher, SymbolRef};

pub use driver::DriverAdmin;

/// Bundle identifier of the patched driver
pub const BUNDLE_ID: &str = "com.apple.iokit.IONVMeFamily";

pub const KEXT_PATH: &str =
    "/System/Library/Extensions/IONVMeFamily.kext/Contents/MacOS/IONVMeFamily";

/// Mangled names in the driver image
pub mod symbols {
    pub const CONTROLLER_VTABLE: &str = "__ZTV16IONVMeController";
    /// Inherited by the controller; its vtable slot is located by address
    pub const SERVICE_ACTIVITY_TICKLE: &str = "__ZN9IOService13activityTickleEmm";

    pub const ISSUE_IDENTIFY_COMMAND: &str =
        "__ZN16IONVMeController20IssueIdentifyCommandEP18IOMemoryDescriptorP16AppleNVMeRequestj";
    pub const PROCESS_SYNC_NVME_REQUEST: &str =
        "__ZN16IONVMeController22ProcessSyncNVMeRequestEP16AppleNVMeRequest";
    pub const GET_REQUEST: &str = "__ZN16IONVMeController10GetRequestEj";
    pub const RETURN_REQUEST: &str = "__ZN16IONVMeController13ReturnRequestEP16AppleNVMeRequest";
    pub const CONTROLLER_FILTER_INTERRUPT_REQUEST: &str =
        "__ZN16IONVMeController22FilterInterruptRequestEP28IOFilterInterruptEventSource";

    pub const REQUEST_BUILD_GET_FEATURES: &str = "__ZN16AppleNVMeRequest23BuildCommandGetFeaturesEh";
    pub const REQUEST_BUILD_SET_FEATURES: &str =
        "__ZN16AppleNVMeRequest29BuildCommandSetFeaturesCommonEh";
    pub const REQUEST_GET_STATUS: &str = "__ZN16AppleNVMeRequest9GetStatusEv";
    pub const REQUEST_GET_OPCODE: &str = "__ZN16AppleNVMeRequest9GetOpcodeEv";
    pub const REQUEST_GENERATE_IOVM_SEGMENTS: &str = "__ZN16AppleNVMeRequest20GenerateIOVMSegmentsEyy";
}

/// `IOReturn` codes
pub mod io_return {
    pub const SUCCESS: i32 = 0;
    pub const ERROR: i32 = 0xe000_02bc_u32 as i32;
    pub const NO_RESOURCES: i32 = 0xe000_02be_u32 as i32;
}

pub type IssueIdentifyCommandFn = extern "C" fn(*mut c_void, *mut c_void, *mut c_void, u64) -> i32;
pub type ProcessSyncNvmeRequestFn = extern "C" fn(*mut c_void, *mut c_void) -> i32;
pub type GetRequestFn = extern "C" fn(*mut c_void, u64) -> *mut c_void;
pub type ReturnRequestFn = extern "C" fn(*mut c_void, *mut c_void);
pub type ActivityTickleFn = extern "C" fn(*mut c_void, u64, u64) -> bool;
pub type FilterInterruptRequestFn = extern "C" fn(*mut c_void, *mut c_void) -> bool;
pub type BuildCommandFn = extern "C" fn(*mut c_void, u8);
pub type RequestU32Fn = extern "C" fn(*mut c_void) -> u32;
pub type GenerateIovmSegmentsFn = extern "C" fn(*mut c_void, u64, u64) -> i32;

/// Driver functions, resolved once per image load.
#[derive(Debug)]
pub struct KextFunctions {
    pub issue_identify_command: Func<IssueIdentifyCommandFn>,
    pub process_sync_request: Func<ProcessSyncNvmeRequestFn>,
    pub get_request: Func<GetRequestFn>,
    pub return_request: Func<ReturnRequestFn>,
    /// `IOService::activityTickle` as seen through the controller vtable
    pub activity_tickle: Func<ActivityTickleFn>,
    pub filter_interrupt_request: Func<FilterInterruptRequestFn>,
    pub build_get_features: Func<BuildCommandFn>,
    pub build_set_features: Func<BuildCommandFn>,
    pub get_status: Func<RequestU32Fn>,
    pub get_opcode: Func<RequestU32Fn>,
    pub generate_iovm_segments: Func<GenerateIovmSegmentsFn>,
}

impl KextFunctions {
    pub const fn new() -> Self {
        Self {
            issue_identify_command: Func::new(symbols::ISSUE_IDENTIFY_COMMAND),
            process_sync_request: Func::new(symbols::PROCESS_SYNC_NVME_REQUEST),
            get_request: Func::new(symbols::GET_REQUEST),
            return_request: Func::new(symbols::RETURN_REQUEST),
            activity_tickle: Func::anonymous(),
            filter_interrupt_request: Func::new(symbols::CONTROLLER_FILTER_INTERRUPT_REQUEST),
            build_get_features: Func::new(symbols::REQUEST_BUILD_GET_FEATURES),
            build_set_features: Func::new(symbols::REQUEST_BUILD_SET_FEATURES),
            get_status: Func::new(symbols::REQUEST_GET_STATUS),
            get_opcode: Func::new(symbols::REQUEST_GET_OPCODE),
            generate_iovm_segments: Func::new(symbols::REQUEST_GENERATE_IOVM_SEGMENTS),
        }
    }

    fn named(&self) -> [&SymbolRef; 10] {
        [
            self.issue_identify_command.symbol(),
            self.process_sync_request.symbol(),
            self.get_request.symbol(),
            self.return_request.symbol(),
            self.filter_interrupt_request.symbol(),
            self.build_get_features.symbol(),
            self.build_set_features.symbol(),
            self.get_status.symbol(),
            self.get_opcode.symbol(),
            self.generate_iovm_segments.symbol(),
        ]
    }

    /// Resolve every function of the admin command path.
    pub fn solve(&self, patcher: &dyn KernelPatcher) -> Result<()> {
        let required: [(&str, bool); 9] = [
            (self.issue_identify_command.name(), self.issue_identify_command.solve(patcher)),
            (self.process_sync_request.name(), self.process_sync_request.solve(patcher)),
            (self.get_request.name(), self.get_request.solve(patcher)),
            (self.return_request.name(), self.return_request.solve(patcher)),
            (self.build_get_features.name(), self.build_get_features.solve(patcher)),
            (self.build_set_features.name(), self.build_set_features.solve(patcher)),
            (self.get_status.name(), self.get_status.solve(patcher)),
            (self.get_opcode.name(), self.get_opcode.solve(patcher)),
            (
                self.generate_iovm_segments.name(),
                self.generate_iovm_segments.solve(patcher),
            ),
        ];
        if !self.filter_interrupt_request.solve(patcher) {
            debug!("FilterInterruptRequest unavailable, MSI workaround stays untouched");
        }

        match required.iter().find(|(_, solved)| !solved) {
            Some((name, _)) => Err(Error::SymbolNotFound(name.to_string())),
            None => Ok(()),
        }
    }

    /// Address of the accessor `name`, going through the cached symbols first.
    pub fn accessor_address(&self, patcher: &dyn KernelPatcher, name: &str) -> Option<u64> {
        match self.named().into_iter().find(|s| s.name() == name) {
            Some(symbol) => symbol.solve(patcher),
            None if patcher.image_base() != 0 => patcher.solve_symbol(name).filter(|&a| a != 0),
            None => None,
        }
    }
}

impl Default for KextFunctions {
    fn default() -> Self {
        Self::new()
    }
}

/// Private members of `AppleNVMeRequest` and `IONVMeController`
#[derive(Debug)]
pub struct KextMembers {
    /// Completion dword 0, stored right after the status dword
    pub result: MemberRef<u32>,
    pub controller: MemberRef<*mut c_void>,
    pub command: MemberRef<NvmeCommand>,
    pub prp_descriptor: MemberRef<*mut c_void>,
    pub msi_workaround: MemberRef<u8>,
}

impl KextMembers {
    pub const fn new() -> Self {
        Self {
            result: MemberRef::new(MemberId::RequestResult),
            controller: MemberRef::new(MemberId::RequestController),
            command: MemberRef::new(MemberId::RequestCommand),
            prp_descriptor: MemberRef::new(MemberId::RequestPrpDescriptor),
            msi_workaround: MemberRef::new(MemberId::ControllerMsiWorkaround),
        }
    }

    fn resolve_one<T>(
        member: &MemberRef<T>,
        functions: &KextFunctions,
        patcher: &dyn KernelPatcher,
        strategy: &dyn OffsetStrategy,
    ) -> bool {
        let accessor = strategy
            .accessor(member.id())
            .and_then(|name| functions.accessor_address(patcher, name));
        let resolved = member.resolve(strategy, accessor);
        match member.offset() {
            Some(offset) => debug!("{} at {:#x} ({})", member.id(), offset, strategy.name()),
            None => debug!("{} not found by {}", member.id(), strategy.name()),
        }
        resolved
    }

    /// Discover all offsets with `strategy`. Members already known are kept.
    pub fn solve(
        &self,
        functions: &KextFunctions,
        patcher: &dyn KernelPatcher,
        strategy: &dyn OffsetStrategy,
    ) -> Result<()> {
        let result = Self::resolve_one(&self.result, functions, patcher, strategy);
        let command = Self::resolve_one(&self.command, functions, patcher, strategy);
        let prp = Self::resolve_one(&self.prp_descriptor, functions, patcher, strategy);

        if !Self::resolve_one(&self.controller, functions, patcher, strategy) {
            info!("Request controller member unknown, relying on GetRequest to set it");
        }
        if !Self::resolve_one(&self.msi_workaround, functions, patcher, strategy) {
            warn!("Failed to find ANS2MSIWorkaround offset");
        }

        for (id, ok) in [
            (MemberId::RequestResult, result),
            (MemberId::RequestCommand, command),
            (MemberId::RequestPrpDescriptor, prp),
        ] {
            if !ok {
                return Err(Error::MemberNotResolved(id.into()));
            }
        }
        Ok(())
    }
}

impl Default for KextMembers {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the plugin knows about one loaded driver image.
#[derive(Debug, Default)]
pub struct Kext {
    pub functions: KextFunctions,
    pub members: KextMembers,
}

impl Kext {
    pub const fn new() -> Self {
        Self {
            functions: KextFunctions::new(),
            members: KextMembers::new(),
        }
    }

    /// Resolve functions, then member offsets.
    pub fn solve(&self, patcher: &dyn KernelPatcher, strategy: &dyn OffsetStrategy) -> Result<()> {
        self.functions.solve(patcher)?;
        self.members.solve(&self.functions, patcher, strategy)
    }
}
