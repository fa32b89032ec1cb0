//! # nvmefix-core
//!
//! Fixes APST (Autonomous Power State Transition) management for third-party
//! NVMe controllers under the system IONVMeFamily driver.
//!
//! This crate provides:
//! - Symbol resolution and call interception in the loaded driver image
//! - Discovery of private member offsets by disassembling accessor functions
//! - NVMe identify parsing, the quirk table and APST table construction
//! - A per-controller configuration state machine and power-management proxy
//!
//! The host environment (patching framework, device tree, power management)
//! is reached through the traits in [`patch`] and [`platform`].
//!
//! ## Feature Flags
//!
//! - `debug-tools`: Enables offline reports on identify dumps and code dumps.
//!   This feature is intended for CLI tools and development, not production use.

pub mod config;
pub mod controller;
pub mod disasm;
pub mod error;
pub mod kext;
pub mod memory;
pub mod nvme;
pub mod offset;
pub mod patch;
pub mod platform;
pub mod plugin;
pub mod pm;
#[cfg(feature = "debug-tools")]
pub mod report;

#[cfg(test)]
pub(crate) mod mock;

pub use config::Config;
pub use controller::{ControllerEntry, ControllerRegistry, ControllerState, EntryHandle};
pub use disasm::{DecodedInstruction, Disassembler, IcedDisassembler};
pub use error::{Error, Result};
pub use kext::{DriverAdmin, Kext};
pub use memory::{CodeDump, ImageMemory, ReadMemory};
pub use nvme::{
    ApstPlan, FeatureId, IdentifyController, NvmeDriver, PowerStateDescriptor, QuirkEntry, Quirks,
};
pub use offset::{
    AccessorPattern, InstructionScan, MemberId, MemberRef, OffsetStrategy, StaticOffsets,
    builtin_patterns,
};
pub use patch::{Func, KernelPatcher, SymbolRef};
pub use platform::{DmaBuffer, Platform, PmProxyHandle, ServiceId};
pub use plugin::Plugin;
pub use pm::{PmProxy, PowerAck, PowerState};
