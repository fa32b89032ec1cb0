use iced_x86::{Decoder, DecoderOptions, OpKind};

use super::{DecodedInstruction, Disassembler, ModRm, OpcodeMap};

/// x86-64 decoder backed by `iced-x86`.
///
/// iced validates and measures the instruction; opcode and ModRM fields are
/// then read from the raw bytes so they match the encoding exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcedDisassembler;

impl IcedDisassembler {
    pub fn new() -> Self {
        Self
    }
}

fn is_legacy_prefix(byte: u8) -> bool {
    matches!(
        byte,
        0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x66 | 0x67 | 0xF0 | 0xF2 | 0xF3
    )
}

/// Locate the primary opcode byte. Returns the map, the byte, and the index of
/// the byte following it.
fn split_opcode(raw: &[u8]) -> Option<(OpcodeMap, u8, usize)> {
    let mut i = 0;
    while i < raw.len() && is_legacy_prefix(raw[i]) {
        i += 1;
    }
    if raw.get(i).is_some_and(|b| b & 0xF0 == 0x40) {
        i += 1;
    }

    match *raw.get(i)? {
        // LES/LDS/BOUND do not exist in long mode, so these always start VEX/EVEX
        b @ (0xC4 | 0xC5 | 0x62) => Some((OpcodeMap::Extended, b, i + 1)),
        0x0F => match *raw.get(i + 1)? {
            0x38 => Some((OpcodeMap::Escape38, *raw.get(i + 2)?, i + 3)),
            0x3A => Some((OpcodeMap::Escape3A, *raw.get(i + 2)?, i + 3)),
            b => Some((OpcodeMap::Secondary, b, i + 2)),
        },
        b => Some((OpcodeMap::Primary, b, i + 1)),
    }
}

fn read_displacement(raw: &[u8], offset: usize, size: usize) -> Option<i64> {
    let bytes = raw.get(offset..offset + size)?;
    let value = match size {
        1 => bytes[0] as i8 as i64,
        2 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        4 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            i64::from_le_bytes(buf)
        }
        _ => return None,
    };
    Some(value)
}

impl Disassembler for IcedDisassembler {
    fn decode(&self, code: &[u8], ip: u64) -> Option<DecodedInstruction> {
        let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return None;
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return None;
        }

        let len = instruction.len();
        let raw = code.get(..len)?;
        let (map, opcode, after_opcode) = split_opcode(raw)?;

        let has_memory_operand =
            (0..instruction.op_count()).any(|i| instruction.op_kind(i) == OpKind::Memory);
        // mov al/eax/rax <-> moffs carries an absolute address and no ModRM
        let is_moffs = map == OpcodeMap::Primary && (0xA0..=0xA3).contains(&opcode);

        let modrm = if has_memory_operand && !is_moffs && map != OpcodeMap::Extended {
            raw.get(after_opcode).copied().map(ModRm::from_byte)
        } else {
            None
        };

        let offsets = decoder.get_constant_offsets(&instruction);
        let displacement = if offsets.has_displacement() {
            read_displacement(raw, offsets.displacement_offset(), offsets.displacement_size())
        } else {
            None
        };

        Some(DecodedInstruction {
            len,
            map,
            opcode,
            modrm,
            displacement,
        })
    }
}
