//! Base relocation table.
//!
//! The table is a sequence of blocks, each an 8-byte header
//! (`page_rva: u32`, `block_size: u32`) followed by `u16` entries holding a
//! 4-bit type and a 12-bit page offset.

use super::parser::{read_u16, read_u32, PeError, PeFile, IMAGE_DIRECTORY_ENTRY_BASERELOC};

/// Padding entry; carries no address.
pub const IMAGE_REL_BASED_ABSOLUTE: u8 = 0;
/// 32-bit absolute address.
pub const IMAGE_REL_BASED_HIGHLOW: u8 = 3;
/// 64-bit absolute address.
pub const IMAGE_REL_BASED_DIR64: u8 = 10;

const BLOCK_HEADER_SIZE: usize = 8;

/// One base relocation: the RVA of the patched slot and its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub rva: u32,
    pub kind: u8,
}

impl Relocation {
    /// Decode a raw table entry belonging to the block at `page_rva`.
    pub fn from_entry(page_rva: u32, entry: u16) -> Relocation {
        Relocation {
            rva: page_rva + u32::from(entry & 0x0FFF),
            kind: (entry >> 12) as u8,
        }
    }

    /// Width in bytes of the patched value, for the kinds the engine
    /// rewrites.
    pub fn width(&self) -> Option<usize> {
        match self.kind {
            IMAGE_REL_BASED_HIGHLOW => Some(4),
            IMAGE_REL_BASED_DIR64 => Some(8),
            _ => None,
        }
    }
}

/// All non-padding relocations of an image, in table order.
pub fn parse_relocations(pe: &PeFile) -> Result<Vec<Relocation>, PeError> {
    let Some(dir) = pe.directory(IMAGE_DIRECTORY_ENTRY_BASERELOC) else {
        return Ok(Vec::new());
    };
    let start = pe
        .rva_to_offset(dir.virtual_address)
        .ok_or(PeError::UnmappedRva(dir.virtual_address))?;
    let table = pe
        .data
        .get(start..start + dir.size as usize)
        .ok_or(PeError::TruncatedFile)?;
    parse_blocks(table)
}

/// Decode a raw relocation table.
pub fn parse_blocks(table: &[u8]) -> Result<Vec<Relocation>, PeError> {
    let mut relocations = Vec::new();
    let mut cursor = 0;
    while cursor + BLOCK_HEADER_SIZE <= table.len() {
        let page_rva = read_u32(table, cursor)?;
        let block_size = read_u32(table, cursor + 4)? as usize;
        if block_size < BLOCK_HEADER_SIZE {
            break;
        }
        let end = cursor + block_size;
        if end > table.len() {
            return Err(PeError::TruncatedFile);
        }
        for at in (cursor + BLOCK_HEADER_SIZE..end).step_by(2) {
            let relocation = Relocation::from_entry(page_rva, read_u16(table, at)?);
            if relocation.kind != IMAGE_REL_BASED_ABSOLUTE {
                relocations.push(relocation);
            }
        }
        cursor = end;
    }
    Ok(relocations)
}
