//! Thin layer over `iced-x86`: decoding a region, classifying and retargeting
//! address-relative instructions, block re-encoding and the general-purpose
//! register union used by the assembling passes.

use iced_x86::code_asm::{AsmRegister16, AsmRegister32, AsmRegister64, AsmRegister8, CodeAssembler};
use iced_x86::{
    BlockEncoder, BlockEncoderOptions, ConstantOffsets, Decoder, DecoderOptions, IcedError,
    Instruction, InstructionBlock, OpKind, Register,
};

pub const BITNESS: u32 = 64;

/// Decode `code` as if loaded at `ip`.
///
/// Bytes that do not decode become one-byte `db` records, so encoding the
/// result reproduces the input exactly.
pub fn decode(code: &[u8], ip: u64) -> Result<Vec<Instruction>, IcedError> {
    let mut decoder = Decoder::with_ip(BITNESS, code, ip, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut instruction = Instruction::default();

    while decoder.can_decode() {
        let position = decoder.position();
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            // `ip()` is derived from the next IP and the length, so the
            // length goes first.
            let mut byte = Instruction::with_declare_byte_1(code[position]);
            byte.set_len(1);
            byte.set_next_ip(ip + position as u64 + 1);
            instructions.push(byte);
            decoder.set_position(position + 1)?;
            decoder.set_ip(ip + position as u64 + 1);
            continue;
        }
        instructions.push(instruction);
    }

    Ok(instructions)
}

fn is_near_branch(instruction: &Instruction) -> bool {
    instruction.op_count() > 0
        && matches!(
            instruction.op0_kind(),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        )
}

/// Near branches and RIP-relative memory operands.
pub fn is_address_relative(instruction: &Instruction) -> bool {
    instruction.is_ip_rel_memory_operand() || is_near_branch(instruction)
}

/// Absolute address an address-relative instruction refers to.
pub fn target(instruction: &Instruction) -> Option<u64> {
    if instruction.is_ip_rel_memory_operand() {
        Some(instruction.ip_rel_memory_address())
    } else if is_near_branch(instruction) {
        Some(instruction.near_branch_target())
    } else {
        None
    }
}

/// Point an address-relative instruction at `address`, keeping the width of
/// its original operand.
pub fn set_target(instruction: &mut Instruction, address: u64) {
    if instruction.is_ip_rel_memory_operand() {
        if instruction.memory_displ_size() == 4 {
            instruction.set_memory_displacement32(address as u32);
        } else {
            instruction.set_memory_displacement64(address);
        }
        return;
    }
    match instruction.op0_kind() {
        OpKind::NearBranch16 => instruction.set_near_branch16(address as u16),
        OpKind::NearBranch32 => instruction.set_near_branch32(address as u32),
        OpKind::NearBranch64 => instruction.set_near_branch64(address),
        _ => {}
    }
}

/// Output of [`encode_block`].
#[derive(Debug, Clone)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    /// Offset of each input instruction relative to the block's base, or
    /// `u32::MAX` when the encoder had to replace it with a longer sequence.
    pub offsets: Vec<u32>,
}

/// Encode `instructions` as one block at `ip`.  Branches between
/// instructions of the block are re-linked by their original addresses.
pub fn encode_block(instructions: &[Instruction], ip: u64) -> Result<Encoded, IcedError> {
    let block = InstructionBlock::new(instructions, ip);
    let result = BlockEncoder::encode(
        BITNESS,
        block,
        BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS,
    )?;
    Ok(Encoded {
        bytes: result.code_buffer,
        offsets: result.new_instruction_offsets,
    })
}

/// Immediate and displacement positions of the single instruction encoded at
/// the start of `bytes`.
pub fn constant_offsets(bytes: &[u8], ip: u64) -> ConstantOffsets {
    let mut decoder = Decoder::with_ip(BITNESS, bytes, ip, DecoderOptions::NONE);
    let instruction = decoder.decode();
    decoder.get_constant_offsets(&instruction)
}

/// Full-width register index in encoding order (RAX = 0 ... R15 = 15).
pub fn gpr_index(register: Register) -> Option<u8> {
    let full = register.full_register();
    let index = (full as u32).checked_sub(Register::RAX as u32)?;
    (index < 16 && register.is_gpr()).then_some(index as u8)
}

// ---------------------------------------------------------------------------
// Register union
// ---------------------------------------------------------------------------

/// A general-purpose register tagged with its width, convertible to the
/// matching `code_asm` operand type.
#[derive(Debug, Clone, Copy)]
pub enum GpRegister {
    Byte(AsmRegister8),
    Word(AsmRegister16),
    Dword(AsmRegister32),
    Qword(AsmRegister64),
}

impl GpRegister {
    pub fn from_register(register: Register) -> Option<GpRegister> {
        use iced_x86::code_asm::registers::gpr16::*;
        use iced_x86::code_asm::registers::gpr32::*;
        use iced_x86::code_asm::registers::gpr64::*;
        use iced_x86::code_asm::registers::gpr8::*;

        let reg = match register {
            Register::AL => GpRegister::Byte(al),
            Register::CL => GpRegister::Byte(cl),
            Register::DL => GpRegister::Byte(dl),
            Register::BL => GpRegister::Byte(bl),
            Register::AH => GpRegister::Byte(ah),
            Register::CH => GpRegister::Byte(ch),
            Register::DH => GpRegister::Byte(dh),
            Register::BH => GpRegister::Byte(bh),
            Register::SPL => GpRegister::Byte(spl),
            Register::BPL => GpRegister::Byte(bpl),
            Register::SIL => GpRegister::Byte(sil),
            Register::DIL => GpRegister::Byte(dil),
            Register::R8L => GpRegister::Byte(r8b),
            Register::R9L => GpRegister::Byte(r9b),
            Register::R10L => GpRegister::Byte(r10b),
            Register::R11L => GpRegister::Byte(r11b),
            Register::R12L => GpRegister::Byte(r12b),
            Register::R13L => GpRegister::Byte(r13b),
            Register::R14L => GpRegister::Byte(r14b),
            Register::R15L => GpRegister::Byte(r15b),

            Register::AX => GpRegister::Word(ax),
            Register::CX => GpRegister::Word(cx),
            Register::DX => GpRegister::Word(dx),
            Register::BX => GpRegister::Word(bx),
            Register::SP => GpRegister::Word(sp),
            Register::BP => GpRegister::Word(bp),
            Register::SI => GpRegister::Word(si),
            Register::DI => GpRegister::Word(di),
            Register::R8W => GpRegister::Word(r8w),
            Register::R9W => GpRegister::Word(r9w),
            Register::R10W => GpRegister::Word(r10w),
            Register::R11W => GpRegister::Word(r11w),
            Register::R12W => GpRegister::Word(r12w),
            Register::R13W => GpRegister::Word(r13w),
            Register::R14W => GpRegister::Word(r14w),
            Register::R15W => GpRegister::Word(r15w),

            Register::EAX => GpRegister::Dword(eax),
            Register::ECX => GpRegister::Dword(ecx),
            Register::EDX => GpRegister::Dword(edx),
            Register::EBX => GpRegister::Dword(ebx),
            Register::ESP => GpRegister::Dword(esp),
            Register::EBP => GpRegister::Dword(ebp),
            Register::ESI => GpRegister::Dword(esi),
            Register::EDI => GpRegister::Dword(edi),
            Register::R8D => GpRegister::Dword(r8d),
            Register::R9D => GpRegister::Dword(r9d),
            Register::R10D => GpRegister::Dword(r10d),
            Register::R11D => GpRegister::Dword(r11d),
            Register::R12D => GpRegister::Dword(r12d),
            Register::R13D => GpRegister::Dword(r13d),
            Register::R14D => GpRegister::Dword(r14d),
            Register::R15D => GpRegister::Dword(r15d),

            Register::RAX => GpRegister::Qword(rax),
            Register::RCX => GpRegister::Qword(rcx),
            Register::RDX => GpRegister::Qword(rdx),
            Register::RBX => GpRegister::Qword(rbx),
            Register::RSP => GpRegister::Qword(rsp),
            Register::RBP => GpRegister::Qword(rbp),
            Register::RSI => GpRegister::Qword(rsi),
            Register::RDI => GpRegister::Qword(rdi),
            Register::R8 => GpRegister::Qword(r8),
            Register::R9 => GpRegister::Qword(r9),
            Register::R10 => GpRegister::Qword(r10),
            Register::R11 => GpRegister::Qword(r11),
            Register::R12 => GpRegister::Qword(r12),
            Register::R13 => GpRegister::Qword(r13),
            Register::R14 => GpRegister::Qword(r14),
            Register::R15 => GpRegister::Qword(r15),

            _ => return None,
        };
        Some(reg)
    }

    /// Width in bytes.
    pub fn width(self) -> u32 {
        match self {
            GpRegister::Byte(_) => 1,
            GpRegister::Word(_) => 2,
            GpRegister::Dword(_) => 4,
            GpRegister::Qword(_) => 8,
        }
    }

    pub fn qword(self) -> Option<AsmRegister64> {
        match self {
            GpRegister::Qword(reg) => Some(reg),
            _ => None,
        }
    }

    pub fn not(self, asm: &mut CodeAssembler) -> Result<(), IcedError> {
        match self {
            GpRegister::Byte(r) => asm.not(r),
            GpRegister::Word(r) => asm.not(r),
            GpRegister::Dword(r) => asm.not(r),
            GpRegister::Qword(r) => asm.not(r),
        }
    }

    /// `add reg, imm` with `imm` zero-extended to the register width.
    pub fn add_imm(self, asm: &mut CodeAssembler, imm: u8) -> Result<(), IcedError> {
        match self {
            GpRegister::Byte(r) => asm.add(r, imm as i8 as i32),
            GpRegister::Word(r) => asm.add(r, imm as i32),
            GpRegister::Dword(r) => asm.add(r, imm as i32),
            GpRegister::Qword(r) => asm.add(r, imm as i32),
        }
    }

    /// `xor reg, imm` with `imm` zero-extended to the register width.
    pub fn xor_imm(self, asm: &mut CodeAssembler, imm: u8) -> Result<(), IcedError> {
        match self {
            GpRegister::Byte(r) => asm.xor(r, imm as i8 as i32),
            GpRegister::Word(r) => asm.xor(r, imm as i32),
            GpRegister::Dword(r) => asm.xor(r, imm as i32),
            GpRegister::Qword(r) => asm.xor(r, imm as i32),
        }
    }

    pub fn rol_imm(self, asm: &mut CodeAssembler, count: u8) -> Result<(), IcedError> {
        match self {
            GpRegister::Byte(r) => asm.rol(r, count as i32),
            GpRegister::Word(r) => asm.rol(r, count as i32),
            GpRegister::Dword(r) => asm.rol(r, count as i32),
            GpRegister::Qword(r) => asm.rol(r, count as i32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Code, Mnemonic};

    #[test]
    fn decode_keeps_undecodable_bytes() {
        // nop; <0x06 is invalid in 64-bit mode>; ret
        let code = [0x90, 0x06, 0xC3];
        let instructions = decode(&code, 0x1000).expect("decode");
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[1].code(), Code::DeclareByte);
        assert_eq!(instructions[1].ip(), 0x1001);
        assert_eq!(instructions[2].mnemonic(), Mnemonic::Ret);

        let encoded = encode_block(&instructions, 0x1000).expect("encode");
        assert_eq!(encoded.bytes, code);
        assert_eq!(encoded.offsets, vec![0, 1, 2]);
    }

    #[test]
    fn leading_undecodable_byte_stays_at_base() {
        let code = [0x06, 0xC3];
        let instructions = decode(&code, 0x1000).expect("decode");
        assert_eq!(instructions[0].code(), Code::DeclareByte);
        assert_eq!(instructions[0].ip(), 0x1000);
        assert_eq!(instructions[0].next_ip(), 0x1001);
        assert_eq!(instructions[1].ip(), 0x1001);

        let encoded = encode_block(&instructions, 0x2000).expect("encode");
        assert_eq!(encoded.bytes, code);
    }

    #[test]
    fn classify_and_retarget_branch() {
        // jmp rel32 to 0x1100
        let code = [0xE9, 0xFB, 0x00, 0x00, 0x00];
        let mut instructions = decode(&code, 0x1000).expect("decode");
        let jmp = &mut instructions[0];
        assert!(is_address_relative(jmp));
        assert_eq!(target(jmp), Some(0x1100));

        set_target(jmp, 0x1200);
        assert_eq!(target(jmp), Some(0x1200));
        let encoded = encode_block(&instructions, 0x1000).expect("encode");
        let redecoded = decode(&encoded.bytes, 0x1000).expect("decode");
        assert_eq!(target(&redecoded[0]), Some(0x1200));
    }

    #[test]
    fn classify_and_retarget_rip_relative_memory() {
        // mov rax, [rip+0x10]
        let code = [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00];
        let mut instructions = decode(&code, 0x2000).expect("decode");
        assert!(is_address_relative(&instructions[0]));
        assert_eq!(target(&instructions[0]), Some(0x2017));

        set_target(&mut instructions[0], 0x5000);
        let encoded = encode_block(&instructions, 0x3000).expect("encode");
        let redecoded = decode(&encoded.bytes, 0x3000).expect("decode");
        assert_eq!(target(&redecoded[0]), Some(0x5000));
    }

    #[test]
    fn plain_instructions_are_not_address_relative() {
        // mov eax, 1; add rax, rcx
        let code = [0xB8, 0x01, 0x00, 0x00, 0x00, 0x48, 0x01, 0xC8];
        let instructions = decode(&code, 0).expect("decode");
        assert!(instructions.iter().all(|i| !is_address_relative(i)));
        assert!(instructions.iter().all(|i| target(i).is_none()));
    }

    #[test]
    fn immediate_positions() {
        // mov eax, 0x1234
        let offsets = constant_offsets(&[0xB8, 0x34, 0x12, 0x00, 0x00], 0);
        assert!(offsets.has_immediate());
        assert_eq!((offsets.immediate_offset(), offsets.immediate_size()), (1, 4));

        // mov rax, imm32 sign-extended: 4-byte field, 8-byte register
        let offsets = constant_offsets(&[0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00], 0);
        assert_eq!((offsets.immediate_offset(), offsets.immediate_size()), (3, 4));
    }

    #[test]
    fn register_union_widths() {
        assert_eq!(GpRegister::from_register(Register::AH).map(GpRegister::width), Some(1));
        assert_eq!(GpRegister::from_register(Register::R9W).map(GpRegister::width), Some(2));
        assert_eq!(GpRegister::from_register(Register::EDI).map(GpRegister::width), Some(4));
        assert_eq!(GpRegister::from_register(Register::R15).map(GpRegister::width), Some(8));
        assert!(GpRegister::from_register(Register::XMM0).is_none());
        assert!(GpRegister::from_register(Register::RAX).and_then(GpRegister::qword).is_some());
        assert!(GpRegister::from_register(Register::EAX).and_then(GpRegister::qword).is_none());
    }

    #[test]
    fn gpr_indices_are_canonical() {
        assert_eq!(gpr_index(Register::AL), Some(0));
        assert_eq!(gpr_index(Register::AH), Some(0));
        assert_eq!(gpr_index(Register::ECX), Some(1));
        assert_eq!(gpr_index(Register::RSP), Some(4));
        assert_eq!(gpr_index(Register::R15W), Some(15));
        assert_eq!(gpr_index(Register::XMM1), None);
    }
}
