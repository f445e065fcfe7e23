//! Protection passes.
//!
//! A pass reads the current code of the region and requests edits through
//! [`PassContext`].  It never moves bytes itself: insertions and replacements
//! are queued and the engine applies them, recomputing every branch and
//! RIP-relative operand afterwards.  A pass may overwrite bytes in place as
//! long as their count stays the same.

pub mod control_flow;
pub mod imports;
pub mod mutation;
pub mod virtualization;

use std::collections::BTreeSet;

use iced_x86::code_asm::CodeAssembler;
use iced_x86::Instruction;
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use crate::config::{PassKind, ProtectConfig};
use crate::engine::ledger::{Adjustment, Ledger};
use crate::error::{Error, Result};
use crate::inject::Injector;
use crate::pe::ImportTable;
use crate::runtime::RuntimeModule;
use crate::x86;

pub use control_flow::ControlFlow;
pub use imports::Imports;
pub use mutation::Mutation;
pub use virtualization::Virtualization;

pub trait Protection {
    fn name(&self) -> &'static str;

    fn run(&mut self, cx: &mut PassContext<'_>, code: &mut [u8]) -> Result<()>;
}

/// The passes for `config`, in pipeline order.
pub fn registry(config: &ProtectConfig) -> Vec<Box<dyn Protection>> {
    config.passes.iter().map(|&kind| pass(kind)).collect()
}

pub fn pass(kind: PassKind) -> Box<dyn Protection> {
    match kind {
        PassKind::Virtualization => Box::new(Virtualization),
        PassKind::Mutation => Box::new(Mutation),
        PassKind::ControlFlow => Box::new(ControlFlow),
        PassKind::Imports => Box::new(Imports),
    }
}

/// What a pass may see and request during one invocation.
pub struct PassContext<'a> {
    pub(crate) pass: &'static str,
    pub(crate) ledger: &'a mut Ledger,
    pub(crate) old_base: u32,
    pub(crate) new_base: u32,
    /// Current offsets the container references directly.
    pub(crate) anchors: &'a BTreeSet<u32>,
    pub(crate) injector: Option<&'a mut Injector>,
    pub(crate) runtime: Option<&'a dyn RuntimeModule>,
    pub(crate) imports: &'a ImportTable,
    pub(crate) config: &'a ProtectConfig,
    pub rng: &'a mut ChaCha20Rng,
}

impl<'a> PassContext<'a> {
    /// RVA the region had before it was moved.
    pub fn old_base(&self) -> u32 {
        self.old_base
    }

    /// RVA of the region being rewritten.
    pub fn new_base(&self) -> u32 {
        self.new_base
    }

    /// Address of `offset` in the code as the pass sees it.
    pub fn address(&self, offset: u32) -> u64 {
        u64::from(self.new_base) + u64::from(offset)
    }

    pub fn offset_of(&self, instruction: &Instruction) -> u32 {
        (instruction.ip() - u64::from(self.new_base)) as u32
    }

    pub fn decode(&self, code: &[u8]) -> Result<Vec<Instruction>> {
        Ok(x86::decode(code, u64::from(self.new_base))?)
    }

    pub fn anchors(&self) -> &BTreeSet<u32> {
        self.anchors
    }

    pub fn imports(&self) -> &ImportTable {
        self.imports
    }

    pub fn config(&self) -> &ProtectConfig {
        self.config
    }

    /// Queue `bytes` for insertion in front of the byte at `offset`.  They
    /// must have been assembled at [`PassContext::address`]`(offset)`.
    pub fn insert(&mut self, offset: u32, bytes: Vec<u8>) {
        let at = self.address(offset);
        self.ledger.push(Adjustment::insert(offset, bytes, at));
    }

    /// Queue replacing the `len` bytes at `offset` with `bytes`.
    pub fn replace(&mut self, offset: u32, len: u32, bytes: Vec<u8>) {
        let at = self.address(offset);
        self.ledger.push(Adjustment::replace(offset, len, bytes, at));
    }

    /// Assemble `asm` for the position `offset`.
    pub fn assemble(&self, offset: u32, asm: &mut CodeAssembler) -> Result<Vec<u8>> {
        Ok(asm.assemble(self.address(offset))?)
    }

    fn injector(&mut self) -> Result<&mut Injector> {
        self.injector
            .as_deref_mut()
            .ok_or(Error::MissingRuntime(self.pass))
    }

    /// Copy a runtime routine into the injector and return its RVA.
    pub fn inject(&mut self, name: &str) -> Result<u32> {
        let runtime = self.runtime.ok_or(Error::MissingRuntime(self.pass))?;
        let imports = self.imports;
        self.injector()?.inject(name, runtime, imports)
    }

    /// Store a locally built blob in the injector and return its RVA.  Every
    /// call stores a new entry, suffixing `name` when it is already taken.
    pub fn insert_blob(&mut self, name: &str, bytes: &[u8]) -> Result<u32> {
        let (stored, rva) = self.injector()?.insert_fresh(name, bytes)?;
        debug!(pass = self.pass, name = %stored, "blob stored");
        Ok(rva)
    }

    pub fn insert_stub(&mut self, name: &str, asm: CodeAssembler) -> Result<u32> {
        self.injector()?.insert_stub(name, asm)
    }
}
