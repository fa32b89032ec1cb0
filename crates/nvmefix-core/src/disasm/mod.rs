//! Single-instruction decoding
//!
//! Offset discovery only needs a few fields of each instruction: its length,
//! the primary opcode byte, the raw ModRM fields and the displacement. The
//! [`Disassembler`] trait exposes exactly that so the decoding backend can be
//! swapped without touching the scanner.

mod iced;

use serde::{Deserialize, Serialize};

pub use iced::IcedDisassembler;

/// Longest legal x86 instruction
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Opcode map the primary opcode byte belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OpcodeMap {
    /// One-byte opcodes
    #[default]
    Primary,
    /// `0F xx`
    Secondary,
    /// `0F 38 xx`
    Escape38,
    /// `0F 3A xx`
    Escape3A,
    /// VEX/EVEX/XOP encoded, not inspected further
    Extended,
}

/// Raw ModRM fields, without REX extension bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            mode: byte >> 6,
            reg: (byte >> 3) & 0x7,
            rm: byte & 0x7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub len: usize,
    pub map: OpcodeMap,
    pub opcode: u8,
    pub modrm: Option<ModRm>,
    /// Sign-extended memory displacement, if the encoding carries one
    pub displacement: Option<i64>,
}

pub trait Disassembler: Send + Sync {
    /// Decode the instruction at the start of `code`, located at `ip`.
    ///
    /// Returns `None` for malformed or truncated input.
    fn decode(&self, code: &[u8], ip: u64) -> Option<DecodedInstruction>;
}
