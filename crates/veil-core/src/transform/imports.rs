//! Import-call obfuscation.
//!
//! `call [rip+IAT slot]` is replaced by a call to the runtime's `Resolve`
//! with the hashed library and function names, followed by `call rax`.

use iced_x86::code_asm::registers::gpr32::{ecx, edx};
use iced_x86::code_asm::registers::gpr64::{r8, r9, rax, rcx, rdx, rsp};
use iced_x86::code_asm::CodeAssembler;
use iced_x86::{Instruction, Mnemonic, OpKind};
use tracing::{debug, info};

use super::{PassContext, Protection};
use crate::error::Result;
use crate::pe::{ImportRef, ImportTable};
use crate::x86;

const DJB2_SEED: u32 = 5381;

/// Name hash the runtime resolver compares against: djb2 over the
/// lower-cased name, starting at its second character and including the
/// terminating NUL.
pub fn name_hash(name: &str) -> u32 {
    name.to_ascii_lowercase()
        .bytes()
        .skip(1)
        .chain(std::iter::once(0))
        .fold(DJB2_SEED, |hash, c| {
            hash.wrapping_mul(33).wrapping_add(u32::from(c))
        })
}

/// The import an indirect `call` goes through, if any.
fn imported_call<'t>(instruction: &Instruction, imports: &'t ImportTable) -> Option<&'t ImportRef> {
    if instruction.mnemonic() != Mnemonic::Call
        || instruction.op0_kind() != OpKind::Memory
        || !instruction.is_ip_rel_memory_operand()
    {
        return None;
    }
    let slot = u32::try_from(instruction.ip_rel_memory_address()).ok()?;
    imports.at(slot)
}

pub struct Imports;

impl Protection for Imports {
    fn name(&self) -> &'static str {
        "imports"
    }

    fn run(&mut self, cx: &mut PassContext<'_>, code: &mut [u8]) -> Result<()> {
        let instructions = cx.decode(code)?;
        let imports = cx.imports();
        let calls: Vec<(Instruction, ImportRef)> = instructions
            .iter()
            .filter_map(|i| imported_call(i, imports).map(|import| (*i, import.clone())))
            .collect();
        if calls.is_empty() {
            info!("no import calls");
            return Ok(());
        }

        let resolve_name = cx.config().symbols.resolve.clone();
        let resolve = cx.inject(&resolve_name)?;

        for (instruction, import) in &calls {
            let library = name_hash(&import.library);
            let function = name_hash(&import.function);
            let offset = cx.offset_of(instruction);

            let mut asm = CodeAssembler::new(x86::BITNESS)?;
            asm.push(rcx)?;
            asm.push(rdx)?;
            asm.push(r8)?;
            asm.push(r9)?;
            asm.sub(rsp, 0x20)?;
            asm.mov(ecx, library)?;
            asm.mov(edx, function)?;
            asm.call(u64::from(resolve))?;
            asm.add(rsp, 0x20)?;
            asm.pop(r9)?;
            asm.pop(r8)?;
            asm.pop(rdx)?;
            asm.pop(rcx)?;
            asm.call(rax)?;

            let bytes = cx.assemble(offset, &mut asm)?;
            cx.replace(offset, instruction.len() as u32, bytes);
            debug!(
                ip = format_args!("0x{:X}", instruction.ip()),
                library = %import.library,
                function = %import.function,
                "import call hidden"
            );
        }

        info!(calls = calls.len(), "imports obfuscated");
        Ok(())
    }
}
