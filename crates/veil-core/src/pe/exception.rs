//! x64 exception directory: an array of 12-byte `RUNTIME_FUNCTION` records.

use super::parser::{read_u32, PeError, PeFile, IMAGE_DIRECTORY_ENTRY_EXCEPTION};
use super::writer::put_u32;

pub const RUNTIME_FUNCTION_SIZE: usize = 12;

/// Begin/end RVAs of one function and the RVA of its unwind info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub begin: u32,
    pub end: u32,
    pub unwind_info: u32,
}

impl RuntimeFunction {
    pub fn read(bytes: &[u8]) -> Result<RuntimeFunction, PeError> {
        Ok(RuntimeFunction {
            begin: read_u32(bytes, 0)?,
            end: read_u32(bytes, 4)?,
            unwind_info: read_u32(bytes, 8)?,
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        put_u32(out, 0, self.begin);
        put_u32(out, 4, self.end);
        put_u32(out, 8, self.unwind_info);
    }

    pub fn contains(&self, rva: u32) -> bool {
        (self.begin..self.end).contains(&rva)
    }
}

/// File offset and record count of the exception directory.
fn table_bounds(pe: &PeFile) -> Result<Option<(usize, usize)>, PeError> {
    let Some(dir) = pe.directory(IMAGE_DIRECTORY_ENTRY_EXCEPTION) else {
        return Ok(None);
    };
    let start = pe
        .rva_to_offset(dir.virtual_address)
        .ok_or(PeError::UnmappedRva(dir.virtual_address))?;
    let count = dir.size as usize / RUNTIME_FUNCTION_SIZE;
    if start + count * RUNTIME_FUNCTION_SIZE > pe.data.len() {
        return Err(PeError::TruncatedFile);
    }
    Ok(Some((start, count)))
}

/// Read every record of the exception directory.
pub fn parse_runtime_functions(pe: &PeFile) -> Result<Vec<RuntimeFunction>, PeError> {
    let Some((start, count)) = table_bounds(pe)? else {
        return Ok(Vec::new());
    };
    pe.data[start..start + count * RUNTIME_FUNCTION_SIZE]
        .chunks_exact(RUNTIME_FUNCTION_SIZE)
        .map(RuntimeFunction::read)
        .collect()
}

/// Overwrite the exception directory in place.  `functions` must have the
/// same record count the directory already holds.
pub fn write_runtime_functions(pe: &mut PeFile, functions: &[RuntimeFunction]) -> Result<(), PeError> {
    let Some((start, count)) = table_bounds(pe)? else {
        return if functions.is_empty() {
            Ok(())
        } else {
            Err(PeError::TruncatedFile)
        };
    };
    if functions.len() != count {
        return Err(PeError::TruncatedFile);
    }
    let table = &mut pe.data[start..start + count * RUNTIME_FUNCTION_SIZE];
    for (record, function) in table.chunks_exact_mut(RUNTIME_FUNCTION_SIZE).zip(functions) {
        function.write(record);
    }
    Ok(())
}
