//! Minimal PE (Portable Executable) parser.
//!
//! Reads PE32 and PE32+ headers, data directories and the section table from
//! an owned byte buffer.  Only the structure the rewriting engine needs is
//! decoded; everything else stays in `data` and is carried through
//! serialization untouched.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while reading or editing a PE image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeError {
    /// The first two bytes are not `MZ` (0x5A4D).
    #[error("invalid DOS signature (expected 0x5A4D)")]
    InvalidDosSignature,
    /// The four bytes at `e_lfanew` are not `PE\0\0` (0x00004550).
    #[error("invalid PE signature (expected 0x00004550)")]
    InvalidPeSignature,
    /// The input buffer is too short to contain a required structure.
    #[error("file is truncated")]
    TruncatedFile,
    /// The `Machine` field in the COFF header is not a supported value.
    #[error("unsupported machine type: 0x{0:04X}")]
    UnsupportedMachine(u16),
    /// The optional-header magic is neither PE32 nor PE32+.
    #[error("unknown optional header magic: 0x{0:04X}")]
    UnknownOptionalMagic(u16),
    /// The image is valid but not a 64-bit (PE32+, AMD64) image.
    #[error("image is not a PE32+ x86-64 image")]
    NotPe64,
    /// An RVA does not fall inside any section's file-backed data.
    #[error("RVA 0x{0:08X} is not backed by file data")]
    UnmappedRva(u32),
    /// Section names are at most eight bytes.
    #[error("section name {0:?} is longer than 8 bytes")]
    SectionNameTooLong(String),
    /// A section index does not exist.
    #[error("no section at index {0}")]
    NoSuchSection(usize),
}

// ---------------------------------------------------------------------------
// Little-endian read helpers
// ---------------------------------------------------------------------------

/// Read a `u16` at `offset` (little-endian).
pub(crate) fn read_u16(data: &[u8], offset: usize) -> Result<u16, PeError> {
    let bytes = data
        .get(offset..offset.checked_add(2).ok_or(PeError::TruncatedFile)?)
        .ok_or(PeError::TruncatedFile)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a `u32` at `offset` (little-endian).
pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32, PeError> {
    let bytes = data
        .get(offset..offset.checked_add(4).ok_or(PeError::TruncatedFile)?)
        .ok_or(PeError::TruncatedFile)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(buf))
}

/// Read a `u64` at `offset` (little-endian).
pub(crate) fn read_u64(data: &[u8], offset: usize) -> Result<u64, PeError> {
    let bytes = data
        .get(offset..offset.checked_add(8).ok_or(PeError::TruncatedFile)?)
        .ok_or(PeError::TruncatedFile)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

/// Read a NUL-terminated ASCII string starting at `offset`.
pub(crate) fn read_cstring(data: &[u8], offset: usize) -> String {
    let Some(tail) = data.get(offset..) else {
        return String::new();
    };
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    String::from_utf8_lossy(&tail[..end]).into_owned()
}

// ---------------------------------------------------------------------------
// Well-known constants
// ---------------------------------------------------------------------------

/// `MZ` -- DOS header magic.
pub(crate) const DOS_MAGIC: u16 = 0x5A4D;
/// `PE\0\0` -- PE signature.
pub(crate) const PE_SIGNATURE: u32 = 0x0000_4550;

/// Optional-header magic for PE32 (32-bit).
pub const PE32_MAGIC: u16 = 0x010B;
/// Optional-header magic for PE32+ (64-bit).
pub const PE32PLUS_MAGIC: u16 = 0x020B;

/// IMAGE_FILE_MACHINE_I386
pub const MACHINE_I386: u16 = 0x014C;
/// IMAGE_FILE_MACHINE_AMD64
pub const MACHINE_AMD64: u16 = 0x8664;

// Data directory indices.
pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const IMAGE_DIRECTORY_ENTRY_EXCEPTION: usize = 3;
pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;

/// Size of one section-table entry.
pub(crate) const SECTION_HEADER_SIZE: usize = 40;

/// IMAGE_SCN_MEM_EXECUTE
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;

// ---------------------------------------------------------------------------
// Structures
// ---------------------------------------------------------------------------

/// COFF file header (the subset we track).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// Optional header fields shared by PE32 and PE32+.  `image_base` is always
/// widened to `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalHeader {
    pub magic: u16,
    pub entry_point: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub number_of_rva_and_sizes: u32,
}

impl OptionalHeader {
    /// File offset (relative to the optional header) of the data directory
    /// array.
    pub(crate) fn data_directory_offset(&self) -> usize {
        if self.magic == PE32_MAGIC {
            96
        } else {
            112
        }
    }
}

/// A single entry in the data-directory table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// A single section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Raw 8-byte name (may or may not be NUL-terminated).
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Section name with trailing NULs trimmed.
    pub fn name_str(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }

    /// Whether `rva` lies inside the section's virtual extent.
    pub fn contains_rva(&self, rva: u32) -> bool {
        let extent = self.virtual_size.max(self.size_of_raw_data);
        rva >= self.virtual_address && (rva - self.virtual_address) < extent
    }

    pub fn is_executable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_EXECUTE != 0
    }
}

// ---------------------------------------------------------------------------
// PeFile
// ---------------------------------------------------------------------------

/// A parsed PE file held entirely in memory.
#[derive(Debug, Clone)]
pub struct PeFile {
    /// The raw bytes of the entire file.
    pub data: Vec<u8>,
    /// Absolute file offset of the PE signature (`e_lfanew`).
    pub pe_offset: usize,
    pub coff_header: CoffHeader,
    pub optional_header: OptionalHeader,
    pub sections: Vec<SectionHeader>,
    pub data_directories: Vec<DataDirectory>,
}

impl PeFile {
    /// Parse a PE file from a raw byte buffer.
    pub fn parse(data: Vec<u8>) -> Result<PeFile, PeError> {
        if read_u16(&data, 0)? != DOS_MAGIC {
            return Err(PeError::InvalidDosSignature);
        }
        let pe_offset = read_u32(&data, 0x3C)? as usize;
        if read_u32(&data, pe_offset)? != PE_SIGNATURE {
            return Err(PeError::InvalidPeSignature);
        }

        let coff_header = parse_coff_header(&data, pe_offset + 4)?;
        let opt_offset = pe_offset + 24;
        let optional_header = parse_optional_header(&data, opt_offset)?;

        let dir_base = opt_offset + optional_header.data_directory_offset();
        let data_directories = (0..optional_header.number_of_rva_and_sizes as usize)
            .map(|i| {
                Ok(DataDirectory {
                    virtual_address: read_u32(&data, dir_base + i * 8)?,
                    size: read_u32(&data, dir_base + i * 8 + 4)?,
                })
            })
            .collect::<Result<Vec<_>, PeError>>()?;

        let table = opt_offset + coff_header.size_of_optional_header as usize;
        let sections = (0..coff_header.number_of_sections as usize)
            .map(|i| parse_section_header(&data, table + i * SECTION_HEADER_SIZE))
            .collect::<Result<Vec<_>, PeError>>()?;

        Ok(PeFile {
            data,
            pe_offset,
            coff_header,
            optional_header,
            sections,
            data_directories,
        })
    }

    // -- helpers ------------------------------------------------------------

    /// Returns `true` for a PE32+ image.
    pub fn is_64bit(&self) -> bool {
        self.optional_header.magic == PE32PLUS_MAGIC
    }

    /// Fail unless this is a PE32+ AMD64 image, the only kind the rewriting
    /// engine handles.
    pub fn require_pe64(&self) -> Result<(), PeError> {
        if self.is_64bit() && self.coff_header.machine == MACHINE_AMD64 {
            Ok(())
        } else {
            Err(PeError::NotPe64)
        }
    }

    pub fn image_base(&self) -> u64 {
        self.optional_header.image_base
    }

    pub fn entry_point(&self) -> u32 {
        self.optional_header.entry_point
    }

    /// Look up a section by its (ASCII) name, e.g. `".text"`.
    pub fn find_section(&self, name: &str) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.name_str() == name)
    }

    /// Index of the section whose virtual extent contains `rva`.
    pub fn section_index_of(&self, rva: u32) -> Option<usize> {
        self.sections.iter().position(|s| s.contains_rva(rva))
    }

    /// Convert an RVA to a raw file offset.
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        let section = self.sections.iter().find(|s| s.contains_rva(rva))?;
        Some(section.pointer_to_raw_data as usize + (rva - section.virtual_address) as usize)
    }

    /// The file-backed bytes of a section, clamped to the buffer.
    pub fn section_data(&self, section: &SectionHeader) -> &[u8] {
        let start = section.pointer_to_raw_data as usize;
        let end = start + section.size_of_raw_data as usize;
        let clamped_end = end.min(self.data.len());
        &self.data[start.min(clamped_end)..clamped_end]
    }

    /// Read `len` bytes starting at `rva`.  Bytes past the section's raw data
    /// (the zero-initialised tail of its virtual extent) read as zero.
    pub fn read_virtual(&self, rva: u32, len: usize) -> Result<Vec<u8>, PeError> {
        let index = self.section_index_of(rva).ok_or(PeError::UnmappedRva(rva))?;
        let section = &self.sections[index];
        let raw = self.section_data(section);
        let start = (rva - section.virtual_address) as usize;
        let mut out = vec![0u8; len];
        if start < raw.len() {
            let avail = (raw.len() - start).min(len);
            out[..avail].copy_from_slice(&raw[start..start + avail]);
        }
        Ok(out)
    }

    /// Return the data directory at `index` if present and non-empty.
    pub fn directory(&self, index: usize) -> Option<&DataDirectory> {
        self.data_directories
            .get(index)
            .filter(|d| d.virtual_address != 0 && d.size != 0)
    }
}

fn parse_coff_header(data: &[u8], offset: usize) -> Result<CoffHeader, PeError> {
    let machine = read_u16(data, offset)?;
    if machine != MACHINE_I386 && machine != MACHINE_AMD64 {
        return Err(PeError::UnsupportedMachine(machine));
    }
    Ok(CoffHeader {
        machine,
        number_of_sections: read_u16(data, offset + 2)?,
        size_of_optional_header: read_u16(data, offset + 16)?,
        characteristics: read_u16(data, offset + 18)?,
    })
}

fn parse_optional_header(data: &[u8], offset: usize) -> Result<OptionalHeader, PeError> {
    let magic = read_u16(data, offset)?;
    let (image_base, rva_count_offset) = match magic {
        PE32_MAGIC => (read_u32(data, offset + 28)? as u64, 92),
        PE32PLUS_MAGIC => (read_u64(data, offset + 24)?, 108),
        other => return Err(PeError::UnknownOptionalMagic(other)),
    };
    Ok(OptionalHeader {
        magic,
        entry_point: read_u32(data, offset + 16)?,
        image_base,
        section_alignment: read_u32(data, offset + 32)?,
        file_alignment: read_u32(data, offset + 36)?,
        size_of_image: read_u32(data, offset + 56)?,
        size_of_headers: read_u32(data, offset + 60)?,
        number_of_rva_and_sizes: read_u32(data, offset + rva_count_offset)?,
    })
}

fn parse_section_header(data: &[u8], base: usize) -> Result<SectionHeader, PeError> {
    let raw = data
        .get(base..base + SECTION_HEADER_SIZE)
        .ok_or(PeError::TruncatedFile)?;
    let mut name = [0u8; 8];
    name.copy_from_slice(&raw[..8]);
    Ok(SectionHeader {
        name,
        virtual_size: read_u32(raw, 8)?,
        virtual_address: read_u32(raw, 12)?,
        size_of_raw_data: read_u32(raw, 16)?,
        pointer_to_raw_data: read_u32(raw, 20)?,
        characteristics: read_u32(raw, 36)?,
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::fixture::{put_u16, ImageBuilder};

    fn sample() -> Vec<u8> {
        let mut builder = ImageBuilder::new();
        builder.code(".text", &[0xCC, 0xC3]);
        builder.data(".rdata", &[1, 2, 3, 4]);
        builder.directory(IMAGE_DIRECTORY_ENTRY_IMPORT, 0x2000, 0x28);
        builder.build()
    }

    #[test]
    fn parse_pe64_headers() {
        let pe = PeFile::parse(sample()).expect("parse should succeed");
        assert_eq!(pe.coff_header.machine, MACHINE_AMD64);
        assert_eq!(pe.coff_header.number_of_sections, 2);
        assert_eq!(pe.optional_header.entry_point, 0x1000);
        assert_eq!(pe.image_base(), 0x1_4000_0000);
        assert_eq!(pe.optional_header.section_alignment, 0x1000);
        assert_eq!(pe.optional_header.file_alignment, 0x200);
        assert!(pe.is_64bit());
        assert!(pe.require_pe64().is_ok());
    }

    #[test]
    fn parse_sections_and_directories() {
        let pe = PeFile::parse(sample()).expect("parse should succeed");
        let text = pe.find_section(".text").expect(".text");
        assert_eq!(text.virtual_address, 0x1000);
        assert!(text.is_executable());
        let rdata = pe.find_section(".rdata").expect(".rdata");
        assert_eq!(rdata.virtual_address, 0x2000);
        assert!(!rdata.is_executable());

        let import = pe.directory(IMAGE_DIRECTORY_ENTRY_IMPORT).expect("import dir");
        assert_eq!(import.virtual_address, 0x2000);
        assert!(pe.directory(IMAGE_DIRECTORY_ENTRY_BASERELOC).is_none());
    }

    #[test]
    fn rva_translation() {
        let pe = PeFile::parse(sample()).expect("parse should succeed");
        assert_eq!(pe.rva_to_offset(0x1000), Some(0x400));
        assert_eq!(pe.rva_to_offset(0x1001), Some(0x401));
        assert_eq!(pe.section_index_of(0x2002), Some(1));
        assert_eq!(pe.rva_to_offset(0x9000), None);
        assert_eq!(pe.read_virtual(0x1000, 3).unwrap(), vec![0xCC, 0xC3, 0x00]);
        assert_eq!(pe.read_virtual(0x9000, 1), Err(PeError::UnmappedRva(0x9000)));
    }

    #[test]
    fn invalid_signatures_rejected() {
        let mut data = sample();
        data[0] = 0;
        assert_eq!(PeFile::parse(data).unwrap_err(), PeError::InvalidDosSignature);

        let mut data = sample();
        data[0x80] = 0;
        assert_eq!(PeFile::parse(data).unwrap_err(), PeError::InvalidPeSignature);

        assert_eq!(
            PeFile::parse(vec![0x4D, 0x5A]).unwrap_err(),
            PeError::TruncatedFile
        );
    }

    #[test]
    fn unsupported_machine_rejected() {
        let mut data = sample();
        put_u16(&mut data, 0x84, 0xBEEF);
        assert_eq!(
            PeFile::parse(data).unwrap_err(),
            PeError::UnsupportedMachine(0xBEEF)
        );
    }

    #[test]
    fn pe32_image_is_not_pe64() {
        let mut data = sample();
        // Flip the magic and keep the remaining layout; the PE32 reader only
        // needs the fields at their PE32 offsets to be in bounds.
        put_u16(&mut data, 0x98, PE32_MAGIC);
        put_u16(&mut data, 0x84, MACHINE_I386);
        let pe = PeFile::parse(data).expect("parse should succeed");
        assert!(!pe.is_64bit());
        assert_eq!(pe.require_pe64(), Err(PeError::NotPe64));
    }

    #[test]
    fn section_name_with_full_8_bytes() {
        let header = SectionHeader {
            name: *b"longname",
            virtual_size: 0,
            virtual_address: 0,
            size_of_raw_data: 0,
            pointer_to_raw_data: 0,
            characteristics: 0,
        };
        assert_eq!(header.name_str(), "longname");
    }

    #[test]
    fn pe_error_display() {
        assert_eq!(
            PeError::UnsupportedMachine(0x1234).to_string(),
            "unsupported machine type: 0x1234"
        );
        assert_eq!(
            PeError::UnmappedRva(0x10).to_string(),
            "RVA 0x00000010 is not backed by file data"
        );
    }
}
