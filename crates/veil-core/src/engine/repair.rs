//! Container repair after a region has moved.
//!
//! Runs on the serialized-and-reparsed image and rewrites every
//! address-bearing table entry that pointed into the old region.

use tracing::{debug, warn};

use super::MovedRegion;
use crate::error::Result;
use crate::pe::exception::{parse_runtime_functions, write_runtime_functions};
use crate::pe::exports::export_address_slots;
use crate::pe::parser::{read_u32, read_u64};
use crate::pe::reloc::parse_relocations;
use crate::pe::writer::{put_u32, put_u64};
use crate::pe::{PeError, PeFile};

/// Patch absolute addresses (HighLow and Dir64 relocations) that pointed
/// into the old region.  Returns how many were rewritten.
pub fn relocations(pe: &mut PeFile, moved: &MovedRegion) -> Result<usize> {
    let image_base = pe.image_base();
    let mut patched = 0;

    for relocation in parse_relocations(pe)? {
        let Some(width) = relocation.width() else {
            continue;
        };
        if moved.contains_old(relocation.rva) {
            warn!(
                rva = format_args!("0x{:08X}", relocation.rva),
                "relocation inside moved code left unpatched"
            );
            continue;
        }
        let offset = pe
            .rva_to_offset(relocation.rva)
            .ok_or(PeError::UnmappedRva(relocation.rva))?;
        let value = if width == 8 {
            read_u64(&pe.data, offset)?
        } else {
            u64::from(read_u32(&pe.data, offset)?)
        };
        let Some(rva) = value
            .checked_sub(image_base)
            .and_then(|rva| u32::try_from(rva).ok())
        else {
            continue;
        };
        let Some(new_rva) = moved.remap(rva)? else {
            continue;
        };

        let new_value = image_base + u64::from(new_rva);
        if width == 8 {
            put_u64(&mut pe.data, offset, new_value);
        } else {
            put_u32(&mut pe.data, offset, new_value as u32);
        }
        debug!(
            at = format_args!("0x{:08X}", relocation.rva),
            from = format_args!("0x{value:X}"),
            to = format_args!("0x{new_value:X}"),
            "relocation patched"
        );
        patched += 1;
    }
    Ok(patched)
}

/// Move exception records that began in the old region and keep the table
/// sorted by begin address.
pub fn exceptions(pe: &mut PeFile, moved: &MovedRegion) -> Result<usize> {
    let mut functions = parse_runtime_functions(pe)?;
    let mut patched = 0;

    for function in &mut functions {
        let Some(begin) = moved.remap(function.begin)? else {
            continue;
        };
        match moved.remap_end(function.end)? {
            Some(end) => function.end = end,
            None => warn!(
                begin = format_args!("0x{:08X}", function.begin),
                "function extends past the moved region"
            ),
        }
        function.begin = begin;
        patched += 1;
    }

    if patched > 0 {
        functions.sort_by_key(|function| function.begin);
        write_runtime_functions(pe, &functions)?;
    }
    Ok(patched)
}

/// Point export-address-table entries at the moved code.
pub fn exports(pe: &mut PeFile, moved: &MovedRegion) -> Result<usize> {
    let mut patched = 0;
    for (slot, rva) in export_address_slots(pe)? {
        let Some(new_rva) = moved.remap(rva)? else {
            continue;
        };
        let offset = pe.rva_to_offset(slot).ok_or(PeError::UnmappedRva(slot))?;
        put_u32(&mut pe.data, offset, new_rva);
        patched += 1;
    }
    Ok(patched)
}
