//! NVMe admin data structures and the command interface to the driver.

mod apst;
mod identify;
mod quirks;

use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr, IntoStaticStr};

use crate::error::Result;
use crate::platform::{DmaBuffer, ServiceId};

pub use apst::*;
pub use identify::*;
pub use quirks::*;

/// Admin command opcodes
pub mod opcode {
    pub const IDENTIFY: u8 = 0x06;
    pub const SET_FEATURES: u8 = 0x09;
    pub const GET_FEATURES: u8 = 0x0A;
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    FromRepr,
    IntoStaticStr,
    Display,
)]
#[repr(u8)]
pub enum FeatureId {
    #[strum(serialize = "Power Management")]
    PowerManagement = 0x02,
    #[strum(serialize = "Autonomous Power State Transition")]
    AutonomousPowerStateTransition = 0x0C,
}

impl FeatureId {
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::from_repr(value)
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Submission queue entry, 64 bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct NvmeCommand {
    pub opcode: u8,
    pub flags: u8,
    pub command_id: u16,
    pub nsid: u32,
    pub cdw2: [u32; 2],
    pub metadata: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(std::mem::size_of::<NvmeCommand>() == 64);

/// Admin commands the plugin issues through the driver.
pub trait NvmeDriver: Send + Sync {
    /// Identify Controller into `buffer` (at least 4096 bytes).
    fn identify(&self, controller: ServiceId, buffer: &mut dyn DmaBuffer) -> Result<()>;

    /// Get Features; returns completion dword 0.
    fn get_features(
        &self,
        controller: ServiceId,
        fid: FeatureId,
        buffer: Option<&mut dyn DmaBuffer>,
    ) -> Result<u32>;

    /// Set Features with `dword11`; returns completion dword 0.
    fn set_features(
        &self,
        controller: ServiceId,
        fid: FeatureId,
        dword11: u32,
        buffer: Option<&mut dyn DmaBuffer>,
    ) -> Result<u32>;

    /// Turn off the driver's private ANS2 MSI workaround flag for a
    /// controller. Returns whether the flag could be reached.
    fn clear_msi_workaround(&self, _controller: ServiceId) -> bool {
        false
    }
}
