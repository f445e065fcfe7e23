//! Operand virtualization.
//!
//! Whitelisted register/immediate arithmetic is serialized into a private
//! bytecode and executed by the runtime's interpreter instead.  Each entry of
//! the bytecode blob is `[len] [payload ^ slot]`, where `slot` is the low byte
//! of the entry's offset inside the blob.

use iced_x86::code_asm::registers::gpr32::r8d;
use iced_x86::code_asm::registers::gpr64::{rax, rcx, rsp};
use iced_x86::code_asm::CodeAssembler;
use iced_x86::{Code, Instruction, MemoryOperand, OpKind, Register};
use tracing::{debug, info};

use super::{PassContext, Protection};
use crate::error::{Error, Result};
use crate::x86;

/// Name of the bytecode blob in the injector.  Later invocations of the
/// pass store theirs as `VMBytecode.1`, `VMBytecode.2` and so on.
pub const BYTECODE: &str = "VMBytecode";

/// Which byte of a 16-bit register pair an 8-bit operand names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegisterPart {
    Higher = 0,
    Lower = 1,
    None = 2,
}

/// `None` for byte registers the interpreter has no encoding for (SPL, BPL,
/// SIL, DIL and R8L to R15L).
fn register_part(register: Register) -> Option<RegisterPart> {
    match register {
        Register::AH | Register::CH | Register::DH | Register::BH => Some(RegisterPart::Higher),
        Register::AL | Register::CL | Register::DL | Register::BL => Some(RegisterPart::Lower),
        r if r.size() == 1 => None,
        _ => Some(RegisterPart::None),
    }
}

fn is_stack_register(register: Register) -> bool {
    matches!(register.full_register(), Register::RSP | Register::RBP)
}

fn is_immediate(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}

fn plain_register(register: Register) -> bool {
    x86::gpr_index(register).is_some()
        && register_part(register).is_some()
        && !is_stack_register(register)
}

/// Whether `instruction` can run on the interpreter.
pub fn eligible(instruction: &Instruction, whitelist: &[iced_x86::Mnemonic]) -> bool {
    if !whitelist.contains(&instruction.mnemonic()) || instruction.op_count() != 2 {
        return false;
    }
    if instruction.op0_kind() != OpKind::Register || !plain_register(instruction.op0_register()) {
        return false;
    }
    match instruction.op1_kind() {
        OpKind::Register => plain_register(instruction.op1_register()),
        kind => is_immediate(kind),
    }
}

/// Serialize one instruction.  The caller has checked [`eligible`].
pub fn serialize(instruction: &Instruction) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&(instruction.mnemonic() as u16).to_le_bytes());
    out.push(instruction.op_count() as u8);

    for operand in 0..instruction.op_count() {
        let kind = instruction.op_kind(operand);
        out.push(kind as u8);
        if kind == OpKind::Register {
            let register = instruction.op_register(operand);
            let index = x86::gpr_index(register).ok_or_else(|| unsupported(instruction))?;
            let part = register_part(register).ok_or_else(|| unsupported(instruction))?;
            out.push(register.size() as u8);
            out.push(index);
            out.push(part as u8);
        } else if is_immediate(kind) {
            out.push(8);
            out.extend_from_slice(&instruction.immediate(operand).to_le_bytes());
        } else {
            return Err(unsupported(instruction));
        }
    }
    Ok(out)
}

fn unsupported(instruction: &Instruction) -> Error {
    Error::UnsupportedInstruction {
        offset: instruction.ip() as u32,
        instruction: instruction.to_string(),
    }
}

/// Append `payload` to `bytecode` and return the entry's slot index.
pub fn append_entry(bytecode: &mut Vec<u8>, payload: &[u8]) -> Result<u32> {
    let index = bytecode.len() as u32;
    let len = u8::try_from(payload.len()).map_err(|_| Error::UnsupportedInstruction {
        offset: index,
        instruction: format!("{}-byte bytecode entry", payload.len()),
    })?;
    bytecode.push(len);
    bytecode.extend(payload.iter().map(|b| b ^ index as u8));
    Ok(index)
}

pub struct Virtualization;

impl Protection for Virtualization {
    fn name(&self) -> &'static str {
        "virtualization"
    }

    fn run(&mut self, cx: &mut PassContext<'_>, code: &mut [u8]) -> Result<()> {
        let instructions = cx.decode(code)?;
        let whitelist = cx.config().virtualize.clone();

        let mut bytecode = Vec::new();
        let mut converted = Vec::new();
        for instruction in instructions.iter().filter(|i| eligible(i, &whitelist)) {
            let index = append_entry(&mut bytecode, &serialize(instruction)?)?;
            converted.push((instruction, index));
        }
        if converted.is_empty() {
            info!("nothing to virtualize");
            return Ok(());
        }

        let symbols = cx.config().symbols.clone();
        let blob = cx.insert_blob(BYTECODE, &bytecode)?;
        let entry = cx.inject(&symbols.vm_entry)?;
        let dispatcher = cx.inject(&symbols.vm_dispatcher)?;
        let exit = cx.inject(&symbols.vm_exit)?;

        for &(instruction, index) in &converted {
            let offset = cx.offset_of(instruction);
            let mut asm = CodeAssembler::new(x86::BITNESS)?;
            asm.call(u64::from(entry))?;
            asm.mov(rcx, rax)?;
            asm.push(rcx)?;
            asm.sub(rsp, 0x20)?;
            asm.add_instruction(Instruction::with2(
                Code::Lea_r64_m,
                Register::RDX,
                MemoryOperand::with_base_displ(Register::RIP, i64::from(blob)),
            )?)?;
            asm.mov(r8d, index)?;
            asm.call(u64::from(dispatcher))?;
            asm.add(rsp, 0x20)?;
            asm.pop(rcx)?;
            asm.call(u64::from(exit))?;

            let bytes = cx.assemble(offset, &mut asm)?;
            cx.replace(offset, instruction.len() as u32, bytes);
            debug!(
                ip = format_args!("0x{:X}", instruction.ip()),
                slot = index,
                instruction = %instruction,
                "virtualized"
            );
        }

        info!(
            instructions = converted.len(),
            bytecode = bytecode.len(),
            "virtualization done"
        );
        Ok(())
    }
}
