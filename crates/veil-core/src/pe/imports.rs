//! Import directory parsing.
//!
//! Walks `IMAGE_IMPORT_DESCRIPTOR` entries and their name tables to map each
//! import-address-table slot to the `(library, function)` it is bound to.

use std::collections::BTreeMap;

use super::parser::{read_cstring, read_u32, read_u64, PeError, PeFile, IMAGE_DIRECTORY_ENTRY_IMPORT};

/// Size of one `IMAGE_IMPORT_DESCRIPTOR`.
const IMPORT_DESC_SIZE: usize = 20;
/// Import-by-ordinal flag of a PE32+ thunk.
const ORDINAL_FLAG_64: u64 = 0x8000_0000_0000_0000;

/// What an IAT slot is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    pub library: String,
    pub function: String,
}

/// Named imports of an image, keyed by IAT slot RVA.
#[derive(Debug, Clone, Default)]
pub struct ImportTable {
    slots: BTreeMap<u32, ImportRef>,
}

impl ImportTable {
    /// Parse the import directory of a PE32+ image.  Ordinal imports carry no
    /// name and are skipped.
    pub fn parse(pe: &PeFile) -> Result<ImportTable, PeError> {
        let mut slots = BTreeMap::new();
        let Some(dir) = pe.directory(IMAGE_DIRECTORY_ENTRY_IMPORT) else {
            return Ok(ImportTable { slots });
        };
        let table = pe
            .rva_to_offset(dir.virtual_address)
            .ok_or(PeError::UnmappedRva(dir.virtual_address))?;

        for i in 0..dir.size as usize / IMPORT_DESC_SIZE {
            let desc = table + i * IMPORT_DESC_SIZE;
            let int_rva = read_u32(&pe.data, desc)?;
            let name_rva = read_u32(&pe.data, desc + 12)?;
            let iat_rva = read_u32(&pe.data, desc + 16)?;
            if int_rva == 0 && name_rva == 0 && iat_rva == 0 {
                break;
            }

            let name_offset = pe.rva_to_offset(name_rva).ok_or(PeError::UnmappedRva(name_rva))?;
            let library = read_cstring(&pe.data, name_offset);
            if library.is_empty() {
                continue;
            }

            // Bound images overwrite the IAT, so prefer the name table.
            let lookup_rva = if int_rva != 0 { int_rva } else { iat_rva };
            let mut lookup = pe
                .rva_to_offset(lookup_rva)
                .ok_or(PeError::UnmappedRva(lookup_rva))?;
            let mut slot = iat_rva;
            loop {
                let thunk = read_u64(&pe.data, lookup)?;
                if thunk == 0 {
                    break;
                }
                if thunk & ORDINAL_FLAG_64 == 0 {
                    let hint_name = thunk as u32;
                    let offset = pe.rva_to_offset(hint_name).ok_or(PeError::UnmappedRva(hint_name))?;
                    // Skip the 2-byte hint.
                    let function = read_cstring(&pe.data, offset + 2);
                    if !function.is_empty() {
                        slots.insert(
                            slot,
                            ImportRef {
                                library: library.clone(),
                                function,
                            },
                        );
                    }
                }
                lookup += 8;
                slot += 8;
            }
        }

        Ok(ImportTable { slots })
    }

    /// The import bound to the slot at `rva`.
    pub fn at(&self, rva: u32) -> Option<&ImportRef> {
        self.slots.get(&rva)
    }

    /// Find the slot bound to `function` from `library` (library names
    /// compare case-insensitively).  Falls back to any library exporting a
    /// function of that name, since runtime modules may link against a
    /// different forwarder DLL than the target.
    pub fn slot_of(&self, library: &str, function: &str) -> Option<u32> {
        self.slots
            .iter()
            .find(|(_, r)| r.function == function && r.library.eq_ignore_ascii_case(library))
            .or_else(|| self.slots.iter().find(|(_, r)| r.function == function))
            .map(|(&slot, _)| slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &ImportRef)> {
        self.slots.iter().map(|(&slot, r)| (slot, r))
    }
}
