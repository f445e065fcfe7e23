//! Instruction mutation.
//!
//! `mov reg, imm` keeps its shape but carries an encoded literal; a short
//! decode sequence inserted right after it restores the original value.
//! `mov r64, r64` becomes `push src; pop dst`.

use iced_x86::code_asm::CodeAssembler;
use iced_x86::{Instruction, Mnemonic, OpKind, Register};
use rand::Rng;
use tracing::{debug, info};

use super::{PassContext, Protection};
use crate::error::Result;
use crate::x86::{self, GpRegister};

/// Per-occurrence parameters of the literal encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiteralKey {
    pub add: u8,
    pub xor: u8,
    pub rot: u32,
}

impl LiteralKey {
    /// Draw fresh parameters for a `bits`-wide literal.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, bits: u32) -> LiteralKey {
        LiteralKey {
            add: rng.gen_range(1..=u8::MAX),
            xor: rng.gen_range(1..=u8::MAX),
            rot: rng.gen_range(1..bits),
        }
    }
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn rotate_right(value: u64, rot: u32, bits: u32) -> u64 {
    let value = value & mask(bits);
    ((value >> rot) | (value << (bits - rot))) & mask(bits)
}

fn rotate_left(value: u64, rot: u32, bits: u32) -> u64 {
    let value = value & mask(bits);
    ((value << rot) | (value >> (bits - rot))) & mask(bits)
}

/// `!((rotr(value, rot) ^ xor) - add)` in `bits` width.
pub fn encode_literal(value: u64, bits: u32, key: LiteralKey) -> u64 {
    let rotated = rotate_right(value, key.rot, bits);
    !((rotated ^ u64::from(key.xor)).wrapping_sub(u64::from(key.add)) & mask(bits)) & mask(bits)
}

/// What the inserted `not; add; xor; rol` sequence computes.
pub fn decode_literal(encoded: u64, bits: u32, key: LiteralKey) -> u64 {
    let value = !encoded & mask(bits);
    let value = value.wrapping_add(u64::from(key.add)) & mask(bits);
    let value = value ^ u64::from(key.xor);
    rotate_left(value, key.rot, bits)
}

/// Register width matching the immediate field exactly, or `None`.
fn literal_target(instruction: &Instruction, code: &[u8], offset: usize) -> Option<(GpRegister, usize)> {
    if instruction.mnemonic() != Mnemonic::Mov
        || instruction.op_count() != 2
        || instruction.op0_kind() != OpKind::Register
    {
        return None;
    }
    if !matches!(
        instruction.op1_kind(),
        OpKind::Immediate8 | OpKind::Immediate16 | OpKind::Immediate32 | OpKind::Immediate64
    ) {
        return None;
    }
    let register = instruction.op0_register();
    if register.full_register() == Register::RSP {
        return None;
    }
    let reg = GpRegister::from_register(register)?;
    let bytes = &code[offset..offset + instruction.len()];
    let constants = x86::constant_offsets(bytes, instruction.ip());
    if !constants.has_immediate() || constants.immediate_size() as u32 != reg.width() {
        return None;
    }
    Some((reg, offset + constants.immediate_offset()))
}

/// Source and destination of a `mov r64, r64` eligible for `push; pop`.
fn register_copy(instruction: &Instruction) -> Option<(Register, Register)> {
    if instruction.mnemonic() != Mnemonic::Mov
        || instruction.op_count() != 2
        || instruction.op0_kind() != OpKind::Register
        || instruction.op1_kind() != OpKind::Register
    {
        return None;
    }
    let (dst, src) = (instruction.op0_register(), instruction.op1_register());
    let plain = |r: Register| r.is_gpr64() && r != Register::RSP && r != Register::RBP;
    (plain(dst) && plain(src) && dst != src).then_some((dst, src))
}

pub struct Mutation;

impl Mutation {
    fn mutate_literal(
        cx: &mut PassContext<'_>,
        code: &mut [u8],
        instruction: &Instruction,
        reg: GpRegister,
        field: usize,
    ) -> Result<()> {
        let width = reg.width() as usize;
        let bits = reg.width() * 8;
        let key = LiteralKey::random(&mut *cx.rng, bits);

        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(&code[field..field + width]);
        let value = u64::from_le_bytes(raw);
        let encoded = encode_literal(value, bits, key);
        code[field..field + width].copy_from_slice(&encoded.to_le_bytes()[..width]);

        let end = cx.offset_of(instruction) + instruction.len() as u32;
        let mut asm = CodeAssembler::new(x86::BITNESS)?;
        asm.pushfq()?;
        reg.not(&mut asm)?;
        reg.add_imm(&mut asm, key.add)?;
        reg.xor_imm(&mut asm, key.xor)?;
        reg.rol_imm(&mut asm, key.rot as u8)?;
        asm.popfq()?;
        let bytes = cx.assemble(end, &mut asm)?;
        cx.insert(end, bytes);

        debug!(
            ip = format_args!("0x{:X}", instruction.ip()),
            value = format_args!("0x{value:X}"),
            encoded = format_args!("0x{encoded:X}"),
            "literal mutated"
        );
        Ok(())
    }

    fn split_copy(
        cx: &mut PassContext<'_>,
        instruction: &Instruction,
        dst: Register,
        src: Register,
    ) -> Result<()> {
        let (Some(dst64), Some(src64)) = (
            GpRegister::from_register(dst).and_then(GpRegister::qword),
            GpRegister::from_register(src).and_then(GpRegister::qword),
        ) else {
            return Ok(());
        };
        let offset = cx.offset_of(instruction);
        let mut asm = CodeAssembler::new(x86::BITNESS)?;
        asm.push(src64)?;
        asm.pop(dst64)?;
        let bytes = cx.assemble(offset, &mut asm)?;
        cx.replace(offset, instruction.len() as u32, bytes);
        debug!(ip = format_args!("0x{:X}", instruction.ip()), "register copy split");
        Ok(())
    }
}

impl Protection for Mutation {
    fn name(&self) -> &'static str {
        "mutation"
    }

    fn run(&mut self, cx: &mut PassContext<'_>, code: &mut [u8]) -> Result<()> {
        let instructions = cx.decode(code)?;
        let (mut literals, mut copies) = (0usize, 0usize);

        for instruction in &instructions {
            let offset = cx.offset_of(instruction) as usize;
            if let Some((reg, field)) = literal_target(instruction, code, offset) {
                Mutation::mutate_literal(cx, code, instruction, reg, field)?;
                literals += 1;
            } else if let Some((dst, src)) = register_copy(instruction) {
                Mutation::split_copy(cx, instruction, dst, src)?;
                copies += 1;
            }
        }

        info!(literals, copies, "mutation done");
        Ok(())
    }
}
