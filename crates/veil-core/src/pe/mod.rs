//! PE container support: parsing, serialization and the tables the rewriting
//! engine repairs.

pub mod exception;
pub mod exports;
pub mod imports;
pub mod parser;
pub mod reloc;
pub mod writer;

#[cfg(test)]
pub(crate) mod fixture;

pub use imports::{ImportRef, ImportTable};
pub use parser::{PeError, PeFile, SectionHeader};
