use tracing::{debug, warn};

use crate::disasm::{Disassembler, MAX_INSTRUCTION_LEN};
use crate::memory::ReadMemory;
use crate::offset::{AccessorPattern, MemberId, OffsetStrategy};

/// Default bound on decoded instructions per accessor
pub const DEFAULT_MAX_INSTRUCTIONS: usize = 128;

/// Walk the instructions of the function at `start` and return the member
/// offset carried by the first one matching `pattern`.
///
/// This is a first-match scan: an earlier load with the same register shape
/// would be taken for the member. The accessors it is pointed at are known
/// not to contain one, and the offsets they yield are compared against known
/// good values per driver build, so the policy must not be changed to a
/// best-match heuristic.
///
/// A malformed instruction or unreadable code ends the scan without a result.
pub fn scan_accessor<R, D>(
    reader: &R,
    disassembler: &D,
    start: u64,
    pattern: &AccessorPattern,
    max_instructions: usize,
) -> Option<u64>
where
    R: ReadMemory + ?Sized,
    D: Disassembler + ?Sized,
{
    if start == 0 {
        return None;
    }

    let mut ip = start;
    for index in 0..max_instructions {
        let available = reader.available(ip).min(MAX_INSTRUCTION_LEN);
        if available == 0 {
            debug!("{}: ran off the image at {:#x}", pattern.member, ip);
            return None;
        }
        let code = match reader.read_bytes(ip, available) {
            Ok(code) => code,
            Err(e) => {
                warn!("{}: {}", pattern.member, e);
                return None;
            }
        };

        let Some(insn) = disassembler.decode(&code, ip) else {
            debug!(
                "{}: malformed instruction #{} at {:#x}, giving up",
                pattern.member, index, ip
            );
            return None;
        };

        if pattern.matches(&insn) {
            let offset = pattern.offset_from(&insn);
            debug!(
                "{}: matched instruction #{} at {:#x} -> {:?}",
                pattern.member, index, ip, offset
            );
            return offset;
        }

        ip += insn.len as u64;
    }

    debug!(
        "{}: no match within {} instructions of {:#x}",
        pattern.member, max_instructions, start
    );
    None
}

/// Discovers member offsets by disassembling accessor functions.
pub struct InstructionScan<R, D> {
    reader: R,
    disassembler: D,
    patterns: Vec<AccessorPattern>,
    max_instructions: usize,
}

impl<R: ReadMemory, D: Disassembler> InstructionScan<R, D> {
    pub fn new(reader: R, disassembler: D, patterns: Vec<AccessorPattern>) -> Self {
        Self {
            reader,
            disassembler,
            patterns,
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
        }
    }

    pub fn with_max_instructions(mut self, max_instructions: usize) -> Self {
        self.max_instructions = max_instructions;
        self
    }

    pub fn pattern(&self, member: MemberId) -> Option<&AccessorPattern> {
        self.patterns.iter().find(|p| p.member == member)
    }
}

impl<R: ReadMemory, D: Disassembler> OffsetStrategy for InstructionScan<R, D> {
    fn name(&self) -> &'static str {
        "instruction scan"
    }

    fn accessor(&self, member: MemberId) -> Option<&str> {
        self.pattern(member).map(|p| p.function.as_str())
    }

    fn discover(&self, member: MemberId, accessor: Option<u64>) -> Option<u64> {
        let pattern = self.pattern(member)?;
        scan_accessor(
            &self.reader,
            &self.disassembler,
            accessor?,
            pattern,
            self.max_instructions,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::{DecodedInstruction, IcedDisassembler};
    use crate::memory::MockMemoryBuilder;
    use crate::offset::builtin_patterns;

    /// Nine assorted instructions before the interesting load
    const PROLOGUE: &[&[u8]] = &[
        &[0x55],                         // push rbp
        &[0x48, 0x89, 0xE5],             // mov rbp, rsp
        &[0x53],                         // push rbx
        &[0x48, 0x83, 0xEC, 0x08],       // sub rsp, 8
        &[0x48, 0x89, 0xFB],             // mov rbx, rdi
        &[0x8B, 0x4F, 0x10],             // mov ecx, [rdi+0x10]
        &[0x85, 0xC9],                   // test ecx, ecx
        &[0x90],                         // nop
        &[0x48, 0x8B, 0x43, 0x20],       // mov rax, [rbx+0x20]
    ];

    fn status_pattern() -> AccessorPattern {
        let mut pattern = builtin_patterns()
            .into_iter()
            .find(|p| p.member == MemberId::RequestResult)
            .unwrap();
        pattern.bias = 0;
        pattern
    }

    fn code_with_load_at_tenth(load: &[u8]) -> Vec<u8> {
        let mut code: Vec<u8> = PROLOGUE.iter().flat_map(|i| i.iter().copied()).collect();
        code.extend_from_slice(load);
        code.extend_from_slice(&[0x5B, 0x5D, 0xC3]); // pop rbx; pop rbp; ret
        code
    }

    #[test]
    fn test_scan_finds_tenth_instruction() {
        // mov eax, [rdi+0x38] (disp32)
        let code = code_with_load_at_tenth(&[0x8B, 0x87, 0x38, 0x00, 0x00, 0x00]);
        let reader = MockMemoryBuilder::new()
            .base(0x4000)
            .write_bytes(0x100, &code)
            .build();

        let offset = scan_accessor(
            &reader,
            &IcedDisassembler,
            0x4100,
            &status_pattern(),
            DEFAULT_MAX_INSTRUCTIONS,
        );
        assert_eq!(offset, Some(0x38));
    }

    #[test]
    fn test_scan_respects_instruction_bound() {
        let code = code_with_load_at_tenth(&[0x8B, 0x87, 0x38, 0x00, 0x00, 0x00]);
        let reader = MockMemoryBuilder::new().write_bytes(0, &code).build();

        // Only nine instructions are decoded, the load is the tenth
        assert_eq!(
            scan_accessor(&reader, &IcedDisassembler, 0x1000, &status_pattern(), 9),
            None
        );
        assert_eq!(
            scan_accessor(&reader, &IcedDisassembler, 0x1000, &status_pattern(), 10),
            Some(0x38)
        );
    }

    #[test]
    fn test_scan_without_match_fails() {
        // Same shape, wrong base register: mov eax, [rsi+0x38]
        let mut code = code_with_load_at_tenth(&[0x8B, 0x86, 0x38, 0x00, 0x00, 0x00]);
        code.resize(0x400, 0x90);
        let reader = MockMemoryBuilder::new().write_bytes(0, &code).build();

        assert_eq!(
            scan_accessor(
                &reader,
                &IcedDisassembler,
                0x1000,
                &status_pattern(),
                DEFAULT_MAX_INSTRUCTIONS
            ),
            None
        );
    }

    #[test]
    fn test_scan_takes_first_match() {
        let mut code = vec![0x8B, 0x47, 0x10]; // mov eax, [rdi+0x10]
        code.extend_from_slice(&[0x8B, 0x87, 0x38, 0x00, 0x00, 0x00]);
        let reader = MockMemoryBuilder::new().write_bytes(0, &code).build();

        assert_eq!(
            scan_accessor(&reader, &IcedDisassembler, 0x1000, &status_pattern(), 4),
            Some(0x10)
        );
    }

    #[test]
    fn test_scan_aborts_on_malformed_instruction() {
        let mut code = vec![0x90, 0x06]; // nop; invalid in long mode
        code.extend_from_slice(&[0x8B, 0x87, 0x38, 0x00, 0x00, 0x00]);
        let reader = MockMemoryBuilder::new().write_bytes(0, &code).build();

        assert_eq!(
            scan_accessor(&reader, &IcedDisassembler, 0x1000, &status_pattern(), 128),
            None
        );
    }

    #[test]
    fn test_scan_null_start() {
        let reader = MockMemoryBuilder::new().with_size(16).build();
        assert_eq!(
            scan_accessor(&reader, &IcedDisassembler, 0, &status_pattern(), 128),
            None
        );
    }

    struct NopDisassembler;

    impl Disassembler for NopDisassembler {
        fn decode(&self, _code: &[u8], _ip: u64) -> Option<DecodedInstruction> {
            Some(DecodedInstruction {
                len: 1,
                map: crate::disasm::OpcodeMap::Primary,
                opcode: 0x90,
                modrm: None,
                displacement: None,
            })
        }
    }

    #[test]
    fn test_scan_stops_at_image_end() {
        let reader = MockMemoryBuilder::new().with_size(8).build();
        assert_eq!(
            scan_accessor(&reader, &NopDisassembler, 0x1000, &status_pattern(), 128),
            None
        );
    }

    #[test]
    fn test_instruction_scan_strategy() {
        let code = code_with_load_at_tenth(&[0x8B, 0x47, 0x38]); // disp8 form
        let reader = MockMemoryBuilder::new().write_bytes(0, &code).build();
        let scan = InstructionScan::new(reader, IcedDisassembler, builtin_patterns());

        // Built-in pattern adds 4: the result dword sits right after the status
        assert_eq!(
            scan.discover(MemberId::RequestResult, Some(0x1000)),
            Some(0x3C)
        );
        assert_eq!(scan.discover(MemberId::RequestResult, None), None);
        assert_eq!(
            scan.accessor(MemberId::RequestResult),
            Some(crate::kext::symbols::REQUEST_GET_STATUS)
        );
    }
}
