//! veil: a protection engine for x86-64 PE images.
//!
//! The executable section holding the entry point is moved into a new
//! section, rewritten by a pipeline of passes (operand virtualization,
//! literal mutation, control-flow flattening and import hiding) and the image
//! tables that point into it are repaired.
//!
//! ```no_run
//! use veil_core::{Compiler, PassKind, ProtectConfig};
//!
//! let config = ProtectConfig {
//!     passes: vec![PassKind::Mutation, PassKind::ControlFlow],
//!     ..ProtectConfig::default()
//! };
//! let data = std::fs::read("app.exe")?;
//! let mut compiler = Compiler::from_bytes(data, config, None)?;
//! compiler.protect()?;
//! compiler.save("app.protected.exe")?;
//! # Ok::<(), veil_core::Error>(())
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod inject;
pub mod pe;
pub mod runtime;
pub mod transform;
pub mod x86;

pub use config::{PassKind, ProtectConfig, RuntimeSymbols};
pub use engine::{Compiler, MovedRegion, ProtectReport};
pub use error::{Error, Result};
pub use pe::{PeError, PeFile};
pub use runtime::{PeRuntime, RuntimeModule, Symbol, SymbolKind};
