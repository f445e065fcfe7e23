//! PE writer.
//!
//! Serializes a [`PeFile`] back to bytes and performs the structural edits
//! the engine needs: appending sections, overwriting section contents in
//! place and patching values addressed by RVA.

use super::parser::{PeError, PeFile, SectionHeader, PE32PLUS_MAGIC, SECTION_HEADER_SIZE};

// ---------------------------------------------------------------------------
// Section characteristic constants
// ---------------------------------------------------------------------------

/// IMAGE_SCN_MEM_READ
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
/// IMAGE_SCN_MEM_WRITE
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;
/// IMAGE_SCN_MEM_EXECUTE
pub const IMAGE_SCN_MEM_EXECUTE: u32 = super::parser::IMAGE_SCN_MEM_EXECUTE;
/// IMAGE_SCN_CNT_CODE
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
/// IMAGE_SCN_CNT_INITIALIZED_DATA
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;

// ---------------------------------------------------------------------------
// Little-endian write helpers
// ---------------------------------------------------------------------------

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Round `value` up to a multiple of `alignment` (a power of two, or zero
/// for no alignment).
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialize a [`PeFile`] back to a byte vector.
///
/// Starts from `pe.data` (so the DOS stub, rich header, overlay and section
/// contents survive) and rewrites the COFF header, optional header, data
/// directories and section table from the parsed model.
pub fn write_pe(pe: &PeFile) -> Vec<u8> {
    let mut buf = pe.data.clone();

    let coff = pe.pe_offset + 4;
    let opt = coff + 20;

    put_u16(&mut buf, coff, pe.coff_header.machine);
    put_u16(&mut buf, coff + 2, pe.coff_header.number_of_sections);
    put_u16(&mut buf, coff + 16, pe.coff_header.size_of_optional_header);
    put_u16(&mut buf, coff + 18, pe.coff_header.characteristics);

    let header = &pe.optional_header;
    put_u16(&mut buf, opt, header.magic);
    put_u32(&mut buf, opt + 16, header.entry_point);
    if header.magic == PE32PLUS_MAGIC {
        put_u64(&mut buf, opt + 24, header.image_base);
        put_u32(&mut buf, opt + 108, header.number_of_rva_and_sizes);
    } else {
        put_u32(&mut buf, opt + 28, header.image_base as u32);
        put_u32(&mut buf, opt + 92, header.number_of_rva_and_sizes);
    }
    put_u32(&mut buf, opt + 32, header.section_alignment);
    put_u32(&mut buf, opt + 36, header.file_alignment);
    put_u32(&mut buf, opt + 56, header.size_of_image);
    put_u32(&mut buf, opt + 60, header.size_of_headers);

    let dirs = opt + header.data_directory_offset();
    for (i, dir) in pe.data_directories.iter().enumerate() {
        let base = dirs + i * 8;
        if base + 8 <= buf.len() {
            put_u32(&mut buf, base, dir.virtual_address);
            put_u32(&mut buf, base + 4, dir.size);
        }
    }

    let table = opt + pe.coff_header.size_of_optional_header as usize;
    for (i, section) in pe.sections.iter().enumerate() {
        let base = table + i * SECTION_HEADER_SIZE;
        if base + SECTION_HEADER_SIZE > buf.len() {
            buf.resize(base + SECTION_HEADER_SIZE, 0);
        }
        buf[base..base + 8].copy_from_slice(&section.name);
        put_u32(&mut buf, base + 8, section.virtual_size);
        put_u32(&mut buf, base + 12, section.virtual_address);
        put_u32(&mut buf, base + 16, section.size_of_raw_data);
        put_u32(&mut buf, base + 20, section.pointer_to_raw_data);
        // Relocation/line-number fields (24..36) keep whatever the input
        // had; new entries start zeroed.
        put_u32(&mut buf, base + 36, section.characteristics);
    }

    for section in &pe.sections {
        let end = section.pointer_to_raw_data as usize + section.size_of_raw_data as usize;
        if end > buf.len() {
            buf.resize(end, 0);
        }
    }

    buf
}

// ---------------------------------------------------------------------------
// Section edits
// ---------------------------------------------------------------------------

/// RVA a newly appended section receives: the end of the last section's
/// virtual extent, rounded up to section alignment.
pub fn next_section_rva(pe: &PeFile) -> u32 {
    let alignment = pe.optional_header.section_alignment;
    match pe.sections.last() {
        Some(last) => align_up(
            last.virtual_address + last.virtual_size.max(last.size_of_raw_data),
            alignment,
        ),
        None => align_up(pe.optional_header.size_of_headers, alignment),
    }
}

/// Append a section holding `data` and return its index.
///
/// Grows the header area by one file-alignment block when the section table
/// has no room, shifting every section's raw data forward.
pub fn add_section(
    pe: &mut PeFile,
    name: &str,
    data: &[u8],
    characteristics: u32,
) -> Result<usize, PeError> {
    if name.len() > 8 {
        return Err(PeError::SectionNameTooLong(name.to_string()));
    }

    let file_alignment = pe.optional_header.file_alignment;
    let table = pe.pe_offset + 24 + pe.coff_header.size_of_optional_header as usize;
    let needed = table + (pe.sections.len() + 1) * SECTION_HEADER_SIZE;
    if needed > pe.optional_header.size_of_headers as usize {
        grow_headers(pe, align_up(needed as u32, file_alignment));
    }

    let raw_offset = match pe.sections.last() {
        Some(last) => align_up(last.pointer_to_raw_data + last.size_of_raw_data, file_alignment),
        None => align_up(pe.optional_header.size_of_headers, file_alignment),
    };
    let raw_size = align_up(data.len() as u32, file_alignment);
    let virtual_address = next_section_rva(pe);
    let virtual_size = data.len() as u32;

    let mut section_name = [0u8; 8];
    section_name[..name.len()].copy_from_slice(name.as_bytes());

    pe.sections.push(SectionHeader {
        name: section_name,
        virtual_size,
        virtual_address,
        size_of_raw_data: raw_size,
        pointer_to_raw_data: raw_offset,
        characteristics,
    });
    pe.coff_header.number_of_sections += 1;
    pe.optional_header.size_of_image = align_up(
        virtual_address + virtual_size,
        pe.optional_header.section_alignment,
    );

    let start = raw_offset as usize;
    let end = start + raw_size as usize;
    if pe.data.len() < end {
        pe.data.resize(end, 0);
    }
    pe.data[start..start + data.len()].copy_from_slice(data);
    pe.data[start + data.len()..end].fill(0);

    Ok(pe.sections.len() - 1)
}

fn grow_headers(pe: &mut PeFile, new_headers_size: u32) {
    let shift = (new_headers_size - pe.optional_header.size_of_headers) as usize;
    let old_len = pe.data.len();
    pe.data.resize(old_len + shift, 0);

    // Highest raw offset first so a move never clobbers unmoved data.
    let mut order: Vec<usize> = (0..pe.sections.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(pe.sections[i].pointer_to_raw_data));
    for i in order {
        let section = &mut pe.sections[i];
        let from = section.pointer_to_raw_data as usize;
        let size = section.size_of_raw_data as usize;
        if from < old_len && size > 0 {
            let size = size.min(old_len - from);
            pe.data.copy_within(from..from + size, from + shift);
        }
        section.pointer_to_raw_data += shift as u32;
    }

    let old_headers = pe.optional_header.size_of_headers as usize;
    pe.data[old_headers..old_headers + shift].fill(0);
    pe.optional_header.size_of_headers = new_headers_size;
}

/// Overwrite a section's file-backed contents with `data`, zero-filling the
/// rest of its raw size.  Header sizes are left untouched.
pub fn overwrite_section(pe: &mut PeFile, index: usize, data: &[u8]) -> Result<(), PeError> {
    let section = *pe.sections.get(index).ok_or(PeError::NoSuchSection(index))?;
    let start = section.pointer_to_raw_data as usize;
    let end = start + section.size_of_raw_data as usize;
    if data.len() > section.size_of_raw_data as usize || end > pe.data.len() {
        return Err(PeError::TruncatedFile);
    }
    pe.data[start..start + data.len()].copy_from_slice(data);
    pe.data[start + data.len()..end].fill(0);
    Ok(())
}

/// Write `bytes` at `rva`.
pub fn patch_bytes(pe: &mut PeFile, rva: u32, bytes: &[u8]) -> Result<(), PeError> {
    let offset = pe.rva_to_offset(rva).ok_or(PeError::UnmappedRva(rva))?;
    let slot = pe
        .data
        .get_mut(offset..offset + bytes.len())
        .ok_or(PeError::TruncatedFile)?;
    slot.copy_from_slice(bytes);
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::fixture::ImageBuilder;

    fn sample() -> PeFile {
        let mut builder = ImageBuilder::new();
        builder.code(".text", &[0x90; 0x30]);
        PeFile::parse(builder.build()).expect("parse")
    }

    #[test]
    fn write_pe_roundtrip_preserves_original() {
        let pe = sample();
        assert_eq!(write_pe(&pe), pe.data);
    }

    #[test]
    fn write_pe_reflects_entry_point_change() {
        let mut pe = sample();
        pe.optional_header.entry_point = 0x1010;
        let reparsed = PeFile::parse(write_pe(&pe)).expect("reparse");
        assert_eq!(reparsed.entry_point(), 0x1010);
    }

    #[test]
    fn next_section_rva_follows_last_section() {
        let pe = sample();
        assert_eq!(next_section_rva(&pe), 0x2000);
    }

    #[test]
    fn add_section_lays_out_and_roundtrips() {
        let mut pe = sample();
        let payload = [0xFEu8; 48];
        let index = add_section(&mut pe, ".veil1", &payload, IMAGE_SCN_CNT_CODE)
            .expect("add_section");
        assert_eq!(index, 1);

        let added = pe.sections[1];
        assert_eq!(added.virtual_address, 0x2000);
        assert_eq!(added.virtual_size, 48);
        assert_eq!(added.pointer_to_raw_data, 0x600);
        assert_eq!(added.size_of_raw_data, 0x200);
        assert_eq!(pe.optional_header.size_of_image, 0x3000);

        let reparsed = PeFile::parse(write_pe(&pe)).expect("reparse");
        assert_eq!(reparsed.sections.len(), 2);
        assert_eq!(reparsed.sections[1].name_str(), ".veil1");
        assert!(reparsed.section_data(&reparsed.sections[1]).starts_with(&payload));
    }

    #[test]
    fn add_section_name_too_long_returns_error() {
        let mut pe = sample();
        assert_eq!(
            add_section(&mut pe, ".toolongname", &[0], 0),
            Err(PeError::SectionNameTooLong(".toolongname".into()))
        );
    }

    #[test]
    fn add_section_grows_full_header_area() {
        let mut pe = sample();
        // The fixture's section table has room for 15 entries in 0x400 bytes.
        for i in 0..15 {
            add_section(&mut pe, &format!(".s{i}"), &[i as u8; 4], 0).expect("add");
        }
        assert!(pe.optional_header.size_of_headers > 0x400);
        let reparsed = PeFile::parse(write_pe(&pe)).expect("reparse");
        assert_eq!(reparsed.sections.len(), 16);
        let text = reparsed.find_section(".text").expect(".text");
        assert_eq!(reparsed.section_data(text)[0], 0x90);
        let last = reparsed.sections.last().expect("last");
        assert_eq!(reparsed.section_data(last)[..4], [14u8; 4]);
    }

    #[test]
    fn overwrite_section_zero_fills() {
        let mut pe = sample();
        overwrite_section(&mut pe, 0, &[0xE9, 1, 2, 3, 4]).expect("overwrite");
        let data = pe.section_data(&pe.sections[0]);
        assert_eq!(&data[..5], &[0xE9, 1, 2, 3, 4]);
        assert!(data[5..].iter().all(|&b| b == 0));
        assert_eq!(pe.sections[0].virtual_size, 0x30);

        assert_eq!(
            overwrite_section(&mut pe, 0, &[0u8; 0x201]),
            Err(PeError::TruncatedFile)
        );
        assert_eq!(overwrite_section(&mut pe, 7, &[]), Err(PeError::NoSuchSection(7)));
    }

    #[test]
    fn patch_bytes_by_rva() {
        let mut pe = sample();
        patch_bytes(&mut pe, 0x1004, &[0xAA, 0xBB]).expect("patch");
        assert_eq!(pe.read_virtual(0x1003, 4).unwrap(), vec![0x90, 0xAA, 0xBB, 0x90]);
        assert_eq!(
            patch_bytes(&mut pe, 0x8000, &[0]),
            Err(PeError::UnmappedRva(0x8000))
        );
    }
}
