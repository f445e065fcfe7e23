//! Companion runtime module: the DLL whose routines get copied into the
//! injector section.
//!
//! Symbols come from the export table and the exception directory rather than
//! debug information.  Functions without an export name are addressable as
//! `sub_XXXXXXXX`; non-executable sections resolve as a single data symbol
//! named after the section.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::pe::exception::parse_runtime_functions;
use crate::pe::exports::parse_exports;
use crate::pe::{ImportRef, ImportTable, PeFile, SectionHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Code,
    Data,
}

/// A routine or data blob inside the runtime module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub rva: u32,
    pub size: u32,
    pub section: String,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn contains(&self, rva: u32) -> bool {
        (self.rva..self.rva + self.size).contains(&rva)
    }
}

/// Lookups the injector needs to copy routines out of a helper module.
pub trait RuntimeModule {
    fn symbol(&self, name: &str) -> Option<Symbol>;

    /// The symbol whose extent covers `rva`.
    fn symbol_containing(&self, rva: u32) -> Option<Symbol>;

    fn bytes(&self, symbol: &Symbol) -> Result<Vec<u8>>;

    /// The import bound to the module's own IAT slot at `rva`.
    fn import_at(&self, rva: u32) -> Option<ImportRef>;
}

/// [`RuntimeModule`] over a PE32+ DLL.
#[derive(Debug)]
pub struct PeRuntime {
    pe: PeFile,
    /// Functions keyed by start RVA.
    functions: BTreeMap<u32, Symbol>,
    imports: ImportTable,
}

impl PeRuntime {
    pub fn from_path(path: impl AsRef<Path>) -> Result<PeRuntime> {
        let data = fs::read(path.as_ref())?;
        PeRuntime::from_pe(PeFile::parse(data)?)
    }

    pub fn from_pe(pe: PeFile) -> Result<PeRuntime> {
        pe.require_pe64()?;

        let mut names = BTreeMap::new();
        for export in parse_exports(&pe)? {
            names.entry(export.rva).or_insert(export.name);
        }

        // Known function bounds from the exception directory.
        let mut ends = BTreeMap::new();
        for function in parse_runtime_functions(&pe)? {
            ends.entry(function.begin).or_insert(function.end);
        }

        let starts: Vec<u32> = names
            .keys()
            .chain(ends.keys())
            .copied()
            .filter(|&rva| executable_section(&pe, rva).is_some())
            .collect::<BTreeSet<u32>>()
            .into_iter()
            .collect();

        let mut functions = BTreeMap::new();
        for (i, &start) in starts.iter().enumerate() {
            let Some(section) = executable_section(&pe, start) else {
                continue;
            };
            let section_end = section.virtual_address + section.virtual_size;
            let next = starts
                .get(i + 1)
                .copied()
                .filter(|&next| next <= section_end)
                .unwrap_or(section_end);
            let end = ends.get(&start).copied().unwrap_or(next).min(section_end);
            let name = names
                .get(&start)
                .cloned()
                .unwrap_or_else(|| format!("sub_{start:08X}"));
            functions.insert(
                start,
                Symbol {
                    name,
                    rva: start,
                    size: end.saturating_sub(start),
                    section: section.name_str().to_string(),
                    kind: SymbolKind::Code,
                },
            );
        }

        let imports = ImportTable::parse(&pe)?;
        debug!(
            functions = functions.len(),
            imports = imports.len(),
            "runtime module loaded"
        );
        Ok(PeRuntime {
            pe,
            functions,
            imports,
        })
    }

    pub fn functions(&self) -> impl Iterator<Item = &Symbol> {
        self.functions.values()
    }

    fn data_symbol(section: &SectionHeader) -> Symbol {
        Symbol {
            name: section.name_str().to_string(),
            rva: section.virtual_address,
            size: if section.virtual_size != 0 {
                section.virtual_size
            } else {
                section.size_of_raw_data
            },
            section: section.name_str().to_string(),
            kind: SymbolKind::Data,
        }
    }
}

fn executable_section(pe: &PeFile, rva: u32) -> Option<&SectionHeader> {
    pe.sections
        .iter()
        .find(|s| s.contains_rva(rva) && s.is_executable())
}

impl RuntimeModule for PeRuntime {
    fn symbol(&self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.functions.values().find(|s| s.name == name) {
            return Some(symbol.clone());
        }
        self.pe
            .sections
            .iter()
            .find(|s| !s.is_executable() && s.name_str() == name)
            .map(PeRuntime::data_symbol)
    }

    fn symbol_containing(&self, rva: u32) -> Option<Symbol> {
        let section = self.pe.sections.iter().find(|s| s.contains_rva(rva))?;
        if !section.is_executable() {
            return Some(PeRuntime::data_symbol(section));
        }
        self.functions
            .range(..=rva)
            .next_back()
            .map(|(_, symbol)| symbol)
            .filter(|symbol| symbol.contains(rva))
            .cloned()
    }

    fn bytes(&self, symbol: &Symbol) -> Result<Vec<u8>> {
        Ok(self.pe.read_virtual(symbol.rva, symbol.size as usize)?)
    }

    fn import_at(&self, rva: u32) -> Option<ImportRef> {
        self.imports.at(rva).cloned()
    }
}
