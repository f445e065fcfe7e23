//! Synthetic PE32+ images for unit tests.

use super::parser::{DOS_MAGIC, MACHINE_AMD64, PE32PLUS_MAGIC, PE_SIGNATURE};
use super::writer::{
    IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ,
};

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) const IMAGE_BASE: u64 = 0x1_4000_0000;
const HEADERS_SIZE: u32 = 0x400;
const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;

struct PendingSection {
    name: String,
    data: Vec<u8>,
    virtual_size: u32,
    characteristics: u32,
}

/// Builds a PE32+ image: headers at 0x400 bytes, sections laid out in order
/// at `0x1000`, `0x2000`, ... (each rounded up to section alignment).
pub(crate) struct ImageBuilder {
    sections: Vec<PendingSection>,
    entry_point: u32,
    directories: [(u32, u32); 16],
}

impl ImageBuilder {
    pub(crate) fn new() -> Self {
        Self {
            sections: Vec::new(),
            entry_point: 0x1000,
            directories: [(0, 0); 16],
        }
    }

    pub(crate) fn code(&mut self, name: &str, data: &[u8]) -> u32 {
        self.section(
            name,
            data,
            data.len() as u32,
            IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
        )
    }

    pub(crate) fn data(&mut self, name: &str, data: &[u8]) -> u32 {
        self.section(
            name,
            data,
            data.len() as u32,
            IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
        )
    }

    /// Append a section and return its RVA.
    pub(crate) fn section(
        &mut self,
        name: &str,
        data: &[u8],
        virtual_size: u32,
        characteristics: u32,
    ) -> u32 {
        let rva = self.next_rva();
        self.sections.push(PendingSection {
            name: name.to_string(),
            data: data.to_vec(),
            virtual_size,
            characteristics,
        });
        rva
    }

    pub(crate) fn directory(&mut self, index: usize, rva: u32, size: u32) {
        self.directories[index] = (rva, size);
    }

    /// RVA the next appended section will receive.
    pub(crate) fn next_rva(&self) -> u32 {
        let mut rva = SECTION_ALIGNMENT;
        for s in &self.sections {
            rva += align(s.virtual_size.max(s.data.len() as u32).max(1), SECTION_ALIGNMENT);
        }
        rva
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let pe_offset = 0x80usize;
        let coff = pe_offset + 4;
        let opt = coff + 20;
        let opt_size: u16 = 112 + 16 * 8;
        let table = opt + opt_size as usize;

        let raw_total: u32 = self
            .sections
            .iter()
            .map(|s| align(s.data.len() as u32, FILE_ALIGNMENT))
            .sum();
        let mut buf = vec![0u8; (HEADERS_SIZE + raw_total) as usize];

        put_u16(&mut buf, 0, DOS_MAGIC);
        put_u32(&mut buf, 0x3C, pe_offset as u32);
        put_u32(&mut buf, pe_offset, PE_SIGNATURE);

        put_u16(&mut buf, coff, MACHINE_AMD64);
        put_u16(&mut buf, coff + 2, self.sections.len() as u16);
        put_u16(&mut buf, coff + 16, opt_size);
        put_u16(&mut buf, coff + 18, 0x0022);

        put_u16(&mut buf, opt, PE32PLUS_MAGIC);
        put_u32(&mut buf, opt + 16, self.entry_point);
        put_u64(&mut buf, opt + 24, IMAGE_BASE);
        put_u32(&mut buf, opt + 32, SECTION_ALIGNMENT);
        put_u32(&mut buf, opt + 36, FILE_ALIGNMENT);
        put_u32(&mut buf, opt + 56, self.next_rva());
        put_u32(&mut buf, opt + 60, HEADERS_SIZE);
        put_u32(&mut buf, opt + 108, 16);
        for (i, (rva, size)) in self.directories.iter().enumerate() {
            put_u32(&mut buf, opt + 112 + i * 8, *rva);
            put_u32(&mut buf, opt + 112 + i * 8 + 4, *size);
        }

        let mut rva = SECTION_ALIGNMENT;
        let mut raw = HEADERS_SIZE;
        for (i, s) in self.sections.iter().enumerate() {
            let entry = table + i * 40;
            let raw_size = align(s.data.len() as u32, FILE_ALIGNMENT);
            buf[entry..entry + s.name.len()].copy_from_slice(s.name.as_bytes());
            put_u32(&mut buf, entry + 8, s.virtual_size);
            put_u32(&mut buf, entry + 12, rva);
            put_u32(&mut buf, entry + 16, raw_size);
            put_u32(&mut buf, entry + 20, raw);
            put_u32(&mut buf, entry + 36, s.characteristics);
            buf[raw as usize..raw as usize + s.data.len()].copy_from_slice(&s.data);

            rva += align(s.virtual_size.max(s.data.len() as u32).max(1), SECTION_ALIGNMENT);
            raw += raw_size;
        }
        buf
    }
}

fn align(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}
