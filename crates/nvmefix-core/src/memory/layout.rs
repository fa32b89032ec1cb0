//! Memory layout constants for NVMe admin data structures
//!
//! This module centralizes the byte offsets used when reading the Identify
//! Controller page and building feature payloads. Constants are organized by
//! structure type.

/// Identify Controller data structure (CNS 01h), 4096 bytes
pub mod identify {
    pub const SIZE: usize = 4096;

    pub const VID: usize = 0;
    pub const SSVID: usize = 2;
    pub const SN: usize = 4;
    pub const SN_LEN: usize = 20;
    pub const MN: usize = 24;
    pub const MN_LEN: usize = 40;
    pub const FR: usize = 64;
    pub const FR_LEN: usize = 8;
    pub const VER: usize = 80;
    pub const NPSS: usize = 263;
    pub const APSTA: usize = 265;

    /// Power state descriptors 0-31
    pub const PSD: usize = 2048;
    pub const PSD_COUNT: usize = 32;
}

/// Power State Descriptor, 32 bytes each
pub mod power_state {
    pub const SIZE: usize = 32;

    pub const MAX_POWER: usize = 0;
    pub const FLAGS: usize = 3;
    pub const ENTRY_LAT: usize = 4;
    pub const EXIT_LAT: usize = 8;
    pub const IDLE_POWER: usize = 16;
    pub const ACTIVE_POWER: usize = 20;

    /// Max power is expressed in 0.0001 W instead of 0.01 W
    pub const FLAG_MAX_POWER_SCALE: u8 = 1 << 0;
    /// Non-operational state: the controller processes no I/O in it
    pub const FLAG_NON_OP_STATE: u8 = 1 << 1;
}

/// Autonomous Power State Transition data structure (Feature 0Ch)
pub mod apst {
    /// One little-endian qword per power state
    pub const ENTRY_SIZE: usize = 8;
    pub const ENTRIES: usize = 32;
    pub const SIZE: usize = ENTRY_SIZE * ENTRIES;

    /// Idle Transition Power State, bits 3..7
    pub const ITPS_SHIFT: u32 = 3;
    pub const ITPS_MASK: u64 = 0x1f;
    /// Idle Time Prior to Transition in milliseconds, bits 8..31
    pub const ITPT_SHIFT: u32 = 8;
    pub const ITPT_MAX: u64 = (1 << 24) - 1;

    /// Dword 11 bit enabling APST
    pub const ENABLE: u32 = 1 << 0;
}
