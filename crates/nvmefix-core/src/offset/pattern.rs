use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::disasm::{DecodedInstruction, OpcodeMap};
use crate::error::Result;
use crate::kext::symbols;
use crate::offset::MemberId;

/// Shape of the `mov reg, [base + disp]` load an accessor uses for a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessorPattern {
    pub member: MemberId,
    /// Mangled name of the accessor function to scan
    pub function: String,
    #[serde(default)]
    pub map: OpcodeMap,
    pub opcode: u8,
    /// ModRM reg field (destination register, or opcode extension)
    pub reg: u8,
    /// ModRM rm field (base register)
    pub rm: u8,
    /// Constant added to the displacement
    #[serde(default)]
    pub bias: i64,
}

impl AccessorPattern {
    pub fn matches(&self, insn: &DecodedInstruction) -> bool {
        insn.map == self.map
            && insn.opcode == self.opcode
            && insn
                .modrm
                .is_some_and(|modrm| modrm.reg == self.reg && modrm.rm == self.rm)
    }

    /// Member offset encoded by a matching instruction.
    pub fn offset_from(&self, insn: &DecodedInstruction) -> Option<u64> {
        let disp = insn.displacement?;
        u64::try_from(disp.checked_add(self.bias)?)
            .ok()
            .filter(|&offset| offset != 0)
    }
}

/// x86-64 register numbers as encoded in ModRM
pub mod reg {
    pub const RAX: u8 = 0;
    pub const RBX: u8 = 3;
    pub const RDI: u8 = 7;
}

/// Accessor patterns for the supported IONVMeFamily builds.
pub fn builtin_patterns() -> Vec<AccessorPattern> {
    vec![
        // mov eax, [rdi + status]; the result dword follows the status dword
        AccessorPattern {
            member: MemberId::RequestResult,
            function: symbols::REQUEST_GET_STATUS.to_string(),
            map: OpcodeMap::Primary,
            opcode: 0x8B,
            reg: reg::RAX,
            rm: reg::RDI,
            bias: 4,
        },
        // movzx eax, byte [rdi + command.opcode]
        AccessorPattern {
            member: MemberId::RequestCommand,
            function: symbols::REQUEST_GET_OPCODE.to_string(),
            map: OpcodeMap::Secondary,
            opcode: 0xB6,
            reg: reg::RAX,
            rm: reg::RDI,
            bias: 0,
        },
        // mov rdi, [rbx + prpDescriptor]
        AccessorPattern {
            member: MemberId::RequestPrpDescriptor,
            function: symbols::REQUEST_GENERATE_IOVM_SEGMENTS.to_string(),
            map: OpcodeMap::Primary,
            opcode: 0x8B,
            reg: reg::RDI,
            rm: reg::RBX,
            bias: 0,
        },
        // mov rax, [rbx + controller]
        AccessorPattern {
            member: MemberId::RequestController,
            function: symbols::REQUEST_GENERATE_IOVM_SEGMENTS.to_string(),
            map: OpcodeMap::Primary,
            opcode: 0x8B,
            reg: reg::RAX,
            rm: reg::RBX,
            bias: 0,
        },
        // cmp byte [rdi + ANS2MSIWorkaround], imm8
        AccessorPattern {
            member: MemberId::ControllerMsiWorkaround,
            function: symbols::CONTROLLER_FILTER_INTERRUPT_REQUEST.to_string(),
            map: OpcodeMap::Primary,
            opcode: 0x80,
            reg: 7,
            rm: reg::RDI,
            bias: 0,
        },
    ]
}

pub fn load_patterns<P: AsRef<Path>>(path: P) -> Result<Vec<AccessorPattern>> {
    let content = fs::read_to_string(&path)?;
    let data = serde_json::from_str(&content)?;
    Ok(data)
}

pub fn save_patterns<P: AsRef<Path>>(path: P, patterns: &[AccessorPattern]) -> Result<()> {
    let content = serde_json::to_string_pretty(patterns)?;
    fs::write(path, content)?;
    Ok(())
}
