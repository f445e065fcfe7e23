use thiserror::Error;

use crate::pe::PeError;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can abort a protection run.  No variant is recoverable:
/// the caller must discard the in-memory image and write nothing.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed image: {0}")]
    Format(#[from] PeError),

    #[error("unsupported instruction at offset 0x{offset:X}: {instruction}")]
    UnsupportedInstruction { offset: u32, instruction: String },

    #[error("encoding failed: {0}")]
    Encoding(#[from] iced_x86::IcedError),

    #[error("instruction at 0x{ip:X} could not be re-encoded in place")]
    Unencodable { ip: u64 },

    #[error("adjustments at 0x{first:X} and 0x{second:X} overlap")]
    OverlappingAdjustments { first: u32, second: u32 },

    #[error("adjustment at 0x{offset:X} lies outside the {len}-byte region")]
    AdjustmentOutOfRange { offset: u32, len: usize },

    #[error("no current offset for original offset 0x{0:X}")]
    UnmappedOffset(u32),

    #[error("region at RVA 0x{0:08X} is not inside an executable section")]
    NoCodeRegion(u32),

    #[error("injector region full: {name} needs {needed} bytes, {available} left")]
    InjectorFull {
        name: String,
        needed: usize,
        available: usize,
    },

    #[error("runtime module has no symbol {0:?}")]
    UnresolvedSymbol(String),

    #[error("runtime routine at RVA 0x{0:08X} is not covered by any symbol")]
    UnresolvedAddress(u32),

    #[error("target image does not import {function} from {library}")]
    UnresolvedImport { library: String, function: String },

    #[error("runtime routine {0:?} depends on itself")]
    CyclicInjection(String),

    #[error("a runtime module is required for {0}")]
    MissingRuntime(&'static str),

    #[error("unknown protection pass {0:?}")]
    UnknownPass(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
