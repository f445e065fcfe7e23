//! The injector: a fixed-size section that holds helper routines.
//!
//! Routines are either built locally (bytecode blobs, assembled stubs) or
//! copied out of the companion runtime module and relinked so that the copy
//! depends on nothing but the protected image itself.

use std::collections::{BTreeMap, BTreeSet};

use iced_x86::code_asm::CodeAssembler;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pe::writer::{
    add_section, overwrite_section, IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA,
    IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE,
};
use crate::pe::{ImportTable, PeFile};
use crate::runtime::{RuntimeModule, SymbolKind};
use crate::x86;

/// Entries start on this boundary.
const ENTRY_ALIGNMENT: usize = 16;
/// Filler between entries.
const INT3: u8 = 0xCC;

pub const INJECTOR_CHARACTERISTICS: u32 = IMAGE_SCN_CNT_CODE
    | IMAGE_SCN_CNT_INITIALIZED_DATA
    | IMAGE_SCN_MEM_EXECUTE
    | IMAGE_SCN_MEM_READ
    | IMAGE_SCN_MEM_WRITE;

#[derive(Debug)]
pub struct Injector {
    section: usize,
    rva: u32,
    capacity: usize,
    contents: Vec<u8>,
    symbols: BTreeMap<String, u32>,
    /// Names whose injection is in progress.
    pending: BTreeSet<String>,
}

impl Injector {
    /// Append an empty injector section named `name` to `pe`.
    pub fn attach(pe: &mut PeFile, name: &str, capacity: usize) -> Result<Injector> {
        let section = add_section(pe, name, &vec![0u8; capacity], INJECTOR_CHARACTERISTICS)?;
        let rva = pe.sections[section].virtual_address;
        debug!(name, rva = format_args!("0x{rva:08X}"), capacity, "injector attached");
        Ok(Injector::new(section, rva, capacity))
    }

    pub fn new(section: usize, rva: u32, capacity: usize) -> Injector {
        Injector {
            section,
            rva,
            capacity,
            contents: Vec::new(),
            symbols: BTreeMap::new(),
            pending: BTreeSet::new(),
        }
    }

    pub fn rva(&self) -> u32 {
        self.rva
    }

    /// Bytes in use, alignment padding included.
    pub fn used(&self) -> usize {
        self.contents.len()
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.symbols.get(name).copied()
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&str, u32)> {
        self.symbols.iter().map(|(name, &rva)| (name.as_str(), rva))
    }

    fn next_offset(&self) -> usize {
        self.contents.len().next_multiple_of(ENTRY_ALIGNMENT)
    }

    /// RVA the next entry will receive.
    pub fn next_rva(&self) -> u32 {
        self.rva + self.next_offset() as u32
    }

    /// Store `bytes` under `name` and return their RVA.  A name that is
    /// already present keeps its first contents.
    pub fn insert(&mut self, name: &str, bytes: &[u8]) -> Result<u32> {
        if let Some(rva) = self.lookup(name) {
            return Ok(rva);
        }
        let offset = self.next_offset();
        let available = self.capacity.saturating_sub(offset);
        if bytes.len() > available {
            return Err(Error::InjectorFull {
                name: name.to_string(),
                needed: bytes.len(),
                available,
            });
        }
        self.contents.resize(offset, INT3);
        self.contents.extend_from_slice(bytes);

        let rva = self.rva + offset as u32;
        self.symbols.insert(name.to_string(), rva);
        debug!(name, rva = format_args!("0x{rva:08X}"), len = bytes.len(), "injected");
        Ok(rva)
    }

    /// Store `bytes` as a new entry even if `name` is taken, suffixing the
    /// name with a counter.  Returns the name used and the RVA.
    pub fn insert_fresh(&mut self, name: &str, bytes: &[u8]) -> Result<(String, u32)> {
        let fresh = (0..)
            .map(|n| if n == 0 { name.to_string() } else { format!("{name}.{n}") })
            .find(|candidate| !self.symbols.contains_key(candidate))
            .unwrap_or_else(|| name.to_string());
        let rva = self.insert(&fresh, bytes)?;
        Ok((fresh, rva))
    }

    /// Assemble `asm` at the next free address and store it under `name`.
    pub fn insert_stub(&mut self, name: &str, mut asm: CodeAssembler) -> Result<u32> {
        if let Some(rva) = self.lookup(name) {
            return Ok(rva);
        }
        let bytes = asm.assemble(u64::from(self.next_rva()))?;
        self.insert(name, &bytes)
    }

    /// Copy the runtime routine `name` into the section, relinking its
    /// outside references, and return its RVA.  Dependencies are injected
    /// first.
    pub fn inject(
        &mut self,
        name: &str,
        runtime: &dyn RuntimeModule,
        imports: &ImportTable,
    ) -> Result<u32> {
        if let Some(rva) = self.lookup(name) {
            return Ok(rva);
        }
        if !self.pending.insert(name.to_string()) {
            return Err(Error::CyclicInjection(name.to_string()));
        }
        let result = self.inject_symbol(name, runtime, imports);
        self.pending.remove(name);
        result
    }

    fn inject_symbol(
        &mut self,
        name: &str,
        runtime: &dyn RuntimeModule,
        imports: &ImportTable,
    ) -> Result<u32> {
        let symbol = runtime
            .symbol(name)
            .ok_or_else(|| Error::UnresolvedSymbol(name.to_string()))?;
        let bytes = runtime.bytes(&symbol)?;
        if symbol.kind == SymbolKind::Data {
            return self.insert(name, &bytes);
        }

        let start = u64::from(symbol.rva);
        let span = start..start + bytes.len() as u64;
        let mut instructions = x86::decode(&bytes, start)?;
        for instruction in &mut instructions {
            let Some(target) = x86::target(instruction) else {
                continue;
            };
            if span.contains(&target) {
                continue;
            }
            let target_rva = u32::try_from(target).map_err(|_| Error::UnresolvedAddress(u32::MAX))?;
            let relinked = self.relink(target_rva, runtime, imports)?;
            x86::set_target(instruction, u64::from(relinked));
        }

        let at = self.next_rva();
        let encoded = x86::encode_block(&instructions, u64::from(at))?;
        self.insert(name, &encoded.bytes)
    }

    /// Where an outside reference of a runtime routine points once copied.
    fn relink(
        &mut self,
        target: u32,
        runtime: &dyn RuntimeModule,
        imports: &ImportTable,
    ) -> Result<u32> {
        if let Some(import) = runtime.import_at(target) {
            return imports
                .slot_of(&import.library, &import.function)
                .ok_or(Error::UnresolvedImport {
                    library: import.library,
                    function: import.function,
                });
        }
        let dependency = runtime
            .symbol_containing(target)
            .ok_or(Error::UnresolvedAddress(target))?;
        let base = self.inject(&dependency.name, runtime, imports)?;
        Ok(base + (target - dependency.rva))
    }

    /// Write the contents into the injector section.
    pub fn flush(&self, pe: &mut PeFile) -> Result<()> {
        overwrite_section(pe, self.section, &self.contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::fixture::ImageBuilder;
    use crate::pe::imports::tests::idata;
    use crate::pe::parser::IMAGE_DIRECTORY_ENTRY_IMPORT;
    use crate::runtime::tests::companion;
    use crate::runtime::{PeRuntime, Symbol};
    use iced_x86::code_asm::registers::gpr32::eax;
    use iced_x86::{Mnemonic, OpKind};

    /// A target image importing `Sleep` from KERNEL32, plus its import table.
    fn target() -> (PeFile, ImportTable, u32) {
        let mut builder = ImageBuilder::new();
        builder.code(".text", &[0xC3; 0x10]);
        let base = builder.next_rva();
        let (bytes, iat) = idata(base);
        builder.data(".idata", &bytes);
        builder.directory(IMAGE_DIRECTORY_ENTRY_IMPORT, base, 40);
        let pe = PeFile::parse(builder.build()).expect("parse");
        let imports = ImportTable::parse(&pe).expect("imports");
        (pe, imports, iat)
    }

    #[test]
    fn insert_is_idempotent() {
        let mut injector = Injector::new(0, 0x9000, 0x100);
        let first = injector.insert("VMBytecode", &[1, 2, 3]).expect("insert");
        let used = injector.used();
        let again = injector.insert("VMBytecode", &[9; 40]).expect("insert");
        assert_eq!(first, again);
        assert_eq!(injector.used(), used);

        let second = injector.insert("Other", &[4]).expect("insert");
        assert_eq!(second, 0x9010);
    }

    #[test]
    fn insert_fresh_never_reuses_an_entry() {
        let mut injector = Injector::new(0, 0x9000, 0x100);
        let (first, at) = injector.insert_fresh("VMBytecode", &[1, 2, 3]).expect("insert");
        assert_eq!((first.as_str(), at), ("VMBytecode", 0x9000));
        let (second, at) = injector.insert_fresh("VMBytecode", &[4, 5]).expect("insert");
        assert_eq!((second.as_str(), at), ("VMBytecode.1", 0x9010));
        assert_eq!(&injector.contents[0x10..], &[4, 5]);
        assert_eq!(injector.lookup("VMBytecode"), Some(0x9000));
    }

    #[test]
    fn insert_respects_capacity() {
        let mut injector = Injector::new(0, 0x9000, 0x20);
        injector.insert("a", &[0; 0x11]).expect("fits");
        let err = injector.insert("b", &[0; 0x10]).expect_err("full");
        assert!(matches!(
            err,
            Error::InjectorFull { needed: 0x10, available: 0, .. }
        ));
    }

    #[test]
    fn insert_stub_assembles_in_place() {
        let mut injector = Injector::new(0, 0x9000, 0x100);
        injector.insert("pad", &[0x90]).expect("insert");
        let mut asm = CodeAssembler::new(64).expect("asm");
        asm.mov(eax, 5).expect("mov");
        asm.ret().expect("ret");
        let rva = injector.insert_stub("stub", asm).expect("stub");
        assert_eq!(rva, 0x9010);
        assert_eq!(&injector.contents[0x10..], &[0xB8, 5, 0, 0, 0, 0xC3]);
    }

    #[test]
    fn inject_relinks_calls_data_and_imports() {
        let runtime = PeRuntime::from_pe(companion()).expect("runtime");
        let (_, imports, iat) = target();
        let mut injector = Injector::new(0, 0x9000, 0x1000);

        let caller = injector.inject("Caller", &runtime, &imports).expect("inject");
        let helper = injector.lookup("sub_00001020").expect("helper injected");
        let data = injector.lookup(".data").expect("data injected");
        assert!(caller > helper && helper > data);

        let at = (caller - injector.rva) as usize;
        let code = x86::decode(&injector.contents[at..], u64::from(caller)).expect("decode");
        assert_eq!(code[0].mnemonic(), Mnemonic::Call);
        assert_eq!(code[0].near_branch_target(), u64::from(helper));

        let at = (helper - injector.rva) as usize;
        let code = x86::decode(&injector.contents[at..], u64::from(helper)).expect("decode");
        assert_eq!(x86::target(&code[0]), Some(u64::from(data)));
        assert_eq!(code[1].mnemonic(), Mnemonic::Call);
        assert_eq!(code[1].op0_kind(), OpKind::Memory);
        assert_eq!(x86::target(&code[1]), Some(u64::from(iat + 8)));

        let used = injector.used();
        assert_eq!(injector.inject("Caller", &runtime, &imports).expect("cached"), caller);
        assert_eq!(injector.used(), used);
    }

    #[test]
    fn inject_without_matching_import_fails() {
        let runtime = PeRuntime::from_pe(companion()).expect("runtime");
        let mut injector = Injector::new(0, 0x9000, 0x1000);
        let err = injector
            .inject("Caller", &runtime, &ImportTable::default())
            .expect_err("Sleep is not imported");
        assert!(matches!(err, Error::UnresolvedImport { function, .. } if function == "Sleep"));
    }

    #[test]
    fn unknown_symbol_fails() {
        let runtime = PeRuntime::from_pe(companion()).expect("runtime");
        let mut injector = Injector::new(0, 0x9000, 0x1000);
        assert!(matches!(
            injector.inject("VMEntry", &runtime, &ImportTable::default()),
            Err(Error::UnresolvedSymbol(name)) if name == "VMEntry"
        ));
    }

    /// Two routines calling each other.
    struct Mutual;

    impl RuntimeModule for Mutual {
        fn symbol(&self, name: &str) -> Option<Symbol> {
            let rva = match name {
                "Ping" => 0x1000,
                "Pong" => 0x1010,
                _ => return None,
            };
            Some(Symbol {
                name: name.to_string(),
                rva,
                size: 5,
                section: ".text".to_string(),
                kind: SymbolKind::Code,
            })
        }

        fn symbol_containing(&self, rva: u32) -> Option<Symbol> {
            match rva {
                0x1000..=0x1004 => self.symbol("Ping"),
                0x1010..=0x1014 => self.symbol("Pong"),
                _ => None,
            }
        }

        fn bytes(&self, symbol: &Symbol) -> Result<Vec<u8>> {
            let other: u32 = if symbol.rva == 0x1000 { 0x1010 } else { 0x1000 };
            let rel = (other as i32 - (symbol.rva as i32 + 5)).to_le_bytes();
            Ok(vec![0xE9, rel[0], rel[1], rel[2], rel[3]])
        }

        fn import_at(&self, _rva: u32) -> Option<crate::pe::ImportRef> {
            None
        }
    }

    #[test]
    fn mutual_recursion_is_reported() {
        let mut injector = Injector::new(0, 0x9000, 0x100);
        assert!(matches!(
            injector.inject("Ping", &Mutual, &ImportTable::default()),
            Err(Error::CyclicInjection(name)) if name == "Ping"
        ));
        assert_eq!(injector.used(), 0);
    }

    #[test]
    fn flush_writes_section_contents() {
        let (mut pe, _, _) = target();
        let mut injector = Injector::attach(&mut pe, ".veil0", 0x200).expect("attach");
        injector.insert("blob", &[0xAB; 4]).expect("insert");
        injector.flush(&mut pe).expect("flush");
        let rva = injector.rva();
        assert_eq!(pe.read_virtual(rva, 5).expect("read"), vec![0xAB, 0xAB, 0xAB, 0xAB, 0]);
        assert_eq!(pe.sections.last().map(|s| s.name_str()), Some(".veil0"));
    }
}
