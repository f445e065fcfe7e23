//! Control-flow flattening of straight-line runs.
//!
//! Each run is rebuilt around a dispatcher driven by RCX:
//!
//! ```text
//!     push rcx; pushfq; xor ecx, ecx; jmp D
//! Lk: popfq; <instruction k>; pushfq; inc rcx; jmp D      ; blocks shuffled
//! D:  cmp rcx, n; je X; cmp rcx, 0; je L0; ...
//! X:  popfq; pop rcx
//! ```
//!
//! RCX and the flags are restored on exit, so a run may not touch RCX or the
//! stack pointer.

use std::collections::BTreeSet;

use iced_x86::code_asm::registers::gpr32::ecx;
use iced_x86::code_asm::registers::gpr64::rcx;
use iced_x86::code_asm::{CodeAssembler, CodeLabel};
use iced_x86::{Code, FlowControl, Instruction, InstructionInfoFactory, Register};
use rand::seq::SliceRandom;
use tracing::{debug, info};

use super::{PassContext, Protection};
use crate::error::Result;
use crate::x86;

/// Shortest run worth flattening.
const MIN_RUN: usize = 2;

pub struct ControlFlow;

/// Whether `instruction` can live inside a flattened block.
fn flattenable(instruction: &Instruction, info: &mut InstructionInfoFactory) -> bool {
    if instruction.flow_control() != FlowControl::Next
        || instruction.code() == Code::DeclareByte
        || instruction.is_invalid()
    {
        return false;
    }
    !info.info(instruction).used_registers().iter().any(|used| {
        matches!(
            used.register().full_register(),
            Register::RCX | Register::RSP
        )
    })
}

/// Offsets inside the region that something branches or points to.
fn targets(instructions: &[Instruction], base: u64, len: u64) -> BTreeSet<u32> {
    instructions
        .iter()
        .filter_map(x86::target)
        .filter(|&target| (base..base + len).contains(&target))
        .map(|target| (target - base) as u32)
        .collect()
}

/// Maximal runs of flattenable instructions that nothing enters except at
/// their first instruction.
fn runs(
    instructions: &[Instruction],
    base: u64,
    entries: &BTreeSet<u32>,
) -> Vec<Vec<Instruction>> {
    let mut info = InstructionInfoFactory::new();
    let mut runs = Vec::new();
    let mut current: Vec<Instruction> = Vec::new();

    for instruction in instructions {
        let offset = (instruction.ip() - base) as u32;
        if !flattenable(instruction, &mut info) {
            runs.push(std::mem::take(&mut current));
            continue;
        }
        if entries.contains(&offset) {
            runs.push(std::mem::take(&mut current));
        }
        current.push(*instruction);
    }
    runs.push(current);
    runs.retain(|run| run.len() >= MIN_RUN);
    runs
}

impl ControlFlow {
    fn flatten(cx: &mut PassContext<'_>, run: &[Instruction]) -> Result<()> {
        let (first, last) = match (run.first(), run.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(()),
        };
        let start = cx.offset_of(first);
        let len = (last.next_ip() - first.ip()) as u32;

        let mut order: Vec<usize> = (0..run.len()).collect();
        order.shuffle(&mut *cx.rng);

        let mut asm = CodeAssembler::new(x86::BITNESS)?;
        let mut dispatcher = asm.create_label();
        let mut exit = asm.create_label();
        let mut blocks: Vec<CodeLabel> = run.iter().map(|_| asm.create_label()).collect();

        asm.push(rcx)?;
        asm.pushfq()?;
        asm.xor(ecx, ecx)?;
        asm.jmp(dispatcher)?;

        for &index in &order {
            asm.set_label(&mut blocks[index])?;
            asm.popfq()?;
            asm.add_instruction(run[index])?;
            asm.pushfq()?;
            asm.inc(rcx)?;
            asm.jmp(dispatcher)?;
        }

        asm.set_label(&mut dispatcher)?;
        asm.cmp(rcx, run.len() as i32)?;
        asm.je(exit)?;
        for (index, &label) in blocks.iter().enumerate() {
            asm.cmp(rcx, index as i32)?;
            asm.je(label)?;
        }

        asm.set_label(&mut exit)?;
        asm.popfq()?;
        asm.pop(rcx)?;

        let bytes = cx.assemble(start, &mut asm)?;
        debug!(
            ip = format_args!("0x{:X}", first.ip()),
            instructions = run.len(),
            from = len,
            to = bytes.len(),
            "run flattened"
        );
        cx.replace(start, len, bytes);
        Ok(())
    }
}

impl Protection for ControlFlow {
    fn name(&self) -> &'static str {
        "control-flow"
    }

    fn run(&mut self, cx: &mut PassContext<'_>, code: &mut [u8]) -> Result<()> {
        let instructions = cx.decode(code)?;
        let base = cx.address(0);
        let mut entries = targets(&instructions, base, code.len() as u64);
        entries.extend(cx.anchors().iter().copied());

        let runs = runs(&instructions, base, &entries);
        for run in &runs {
            ControlFlow::flatten(cx, run)?;
        }
        info!(runs = runs.len(), "control flow flattened");
        Ok(())
    }
}
