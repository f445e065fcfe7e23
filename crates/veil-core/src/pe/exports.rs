//! Export directory parsing.

use super::parser::{read_cstring, read_u16, read_u32, PeError, PeFile, IMAGE_DIRECTORY_ENTRY_EXPORT};

/// A named export that resolves to code or data inside the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub rva: u32,
}

/// Read the named exports of an image.  Forwarders (exports whose RVA points
/// back into the export directory) are skipped.
pub fn parse_exports(pe: &PeFile) -> Result<Vec<Export>, PeError> {
    let Some(dir) = pe.directory(IMAGE_DIRECTORY_ENTRY_EXPORT) else {
        return Ok(Vec::new());
    };
    let (dir_start, dir_end) = (dir.virtual_address, dir.virtual_address + dir.size);
    let base = pe.rva_to_offset(dir_start).ok_or(PeError::UnmappedRva(dir_start))?;

    let function_count = read_u32(&pe.data, base + 20)?;
    let name_count = read_u32(&pe.data, base + 24)? as usize;
    let functions = offset_of(pe, read_u32(&pe.data, base + 28)?)?;
    let names = offset_of(pe, read_u32(&pe.data, base + 32)?)?;
    let ordinals = offset_of(pe, read_u32(&pe.data, base + 36)?)?;

    let mut exports = Vec::with_capacity(name_count);
    for i in 0..name_count {
        let name_offset = offset_of(pe, read_u32(&pe.data, names + i * 4)?)?;
        let ordinal = read_u16(&pe.data, ordinals + i * 2)? as u32;
        if ordinal >= function_count {
            return Err(PeError::TruncatedFile);
        }
        let rva = read_u32(&pe.data, functions + ordinal as usize * 4)?;
        if (dir_start..dir_end).contains(&rva) {
            continue;
        }
        exports.push(Export {
            name: read_cstring(&pe.data, name_offset),
            rva,
        });
    }
    Ok(exports)
}

/// Every entry of the export address table as `(slot RVA, function RVA)`,
/// named or not.  Empty and forwarder entries are skipped.
pub fn export_address_slots(pe: &PeFile) -> Result<Vec<(u32, u32)>, PeError> {
    let Some(dir) = pe.directory(IMAGE_DIRECTORY_ENTRY_EXPORT) else {
        return Ok(Vec::new());
    };
    let (dir_start, dir_end) = (dir.virtual_address, dir.virtual_address + dir.size);
    let base = offset_of(pe, dir_start)?;
    let function_count = read_u32(&pe.data, base + 20)?;
    let table_rva = read_u32(&pe.data, base + 28)?;
    let table = offset_of(pe, table_rva)?;

    let mut slots = Vec::new();
    for i in 0..function_count {
        let rva = read_u32(&pe.data, table + i as usize * 4)?;
        if rva == 0 || (dir_start..dir_end).contains(&rva) {
            continue;
        }
        slots.push((table_rva + i * 4, rva));
    }
    Ok(slots)
}

fn offset_of(pe: &PeFile, rva: u32) -> Result<usize, PeError> {
    pe.rva_to_offset(rva).ok_or(PeError::UnmappedRva(rva))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pe::fixture::{put_u16, put_u32, ImageBuilder};

    /// An export directory for RVA `base` naming `(name, rva)` pairs, plus one
    /// forwarder named `Fwd`.
    pub(crate) fn edata(base: u32, symbols: &[(&str, u32)]) -> Vec<u8> {
        let count = symbols.len() + 1;
        let functions = 0x28;
        let names = functions + count * 4;
        let ordinals = names + count * 4;
        let mut strings = ordinals + count * 2;
        let mut buf = vec![0u8; strings + count * 32 + 16];

        put_u32(&mut buf, 20, count as u32);
        put_u32(&mut buf, 24, count as u32);
        put_u32(&mut buf, 28, base + functions as u32);
        put_u32(&mut buf, 32, base + names as u32);
        put_u32(&mut buf, 36, base + ordinals as u32);

        let forwarder = base + (buf.len() - 16) as u32;
        let all = symbols
            .iter()
            .copied()
            .chain(std::iter::once(("Fwd", forwarder)));
        for (i, (name, rva)) in all.enumerate() {
            put_u32(&mut buf, functions + i * 4, rva);
            put_u32(&mut buf, names + i * 4, base + strings as u32);
            put_u16(&mut buf, ordinals + i * 2, i as u16);
            buf[strings..strings + name.len()].copy_from_slice(name.as_bytes());
            strings += name.len() + 1;
        }
        buf
    }

    #[test]
    fn parse_named_exports_skipping_forwarders() {
        let mut builder = ImageBuilder::new();
        builder.code(".text", &[0xC3; 0x20]);
        let base = builder.next_rva();
        let bytes = edata(base, &[("VMEntry", 0x1000), ("Resolve", 0x1010)]);
        builder.data(".edata", &bytes);
        builder.directory(IMAGE_DIRECTORY_ENTRY_EXPORT, base, bytes.len() as u32);
        let pe = PeFile::parse(builder.build()).expect("parse");

        let exports = parse_exports(&pe).expect("exports");
        assert_eq!(
            exports,
            vec![
                Export { name: "VMEntry".into(), rva: 0x1000 },
                Export { name: "Resolve".into(), rva: 0x1010 },
            ]
        );

        let slots = export_address_slots(&pe).expect("slots");
        assert_eq!(slots, vec![(base + 0x28, 0x1000), (base + 0x2C, 0x1010)]);
    }
}
