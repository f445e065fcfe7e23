//! Protection run configuration.

use std::fmt;
use std::str::FromStr;

use iced_x86::Mnemonic;

use crate::error::Error;

/// The protection passes, in the order they can be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Virtualization,
    Mutation,
    ControlFlow,
    Imports,
}

impl PassKind {
    pub const ALL: [PassKind; 4] = [
        PassKind::Virtualization,
        PassKind::Mutation,
        PassKind::ControlFlow,
        PassKind::Imports,
    ];

    /// Passes that inject helper routines from a runtime module.
    pub fn needs_runtime(self) -> bool {
        matches!(self, PassKind::Virtualization | PassKind::Imports)
    }

    pub fn name(self) -> &'static str {
        match self {
            PassKind::Virtualization => "virtualization",
            PassKind::Mutation => "mutation",
            PassKind::ControlFlow => "control-flow",
            PassKind::Imports => "imports",
        }
    }
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PassKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "virtualization" | "vm" => Ok(PassKind::Virtualization),
            "mutation" => Ok(PassKind::Mutation),
            "control-flow" | "controlflow" | "cff" => Ok(PassKind::ControlFlow),
            "imports" => Ok(PassKind::Imports),
            other => Err(Error::UnknownPass(other.to_string())),
        }
    }
}

/// Names of the helper routines the passes inject from the runtime module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSymbols {
    pub vm_entry: String,
    pub vm_dispatcher: String,
    pub vm_exit: String,
    pub resolve: String,
}

impl Default for RuntimeSymbols {
    fn default() -> Self {
        Self {
            vm_entry: "VMEntry".to_string(),
            vm_dispatcher: "VMDispatcher".to_string(),
            vm_exit: "VMExit".to_string(),
            resolve: "Resolve".to_string(),
        }
    }
}

/// Configuration for one protection run.
#[derive(Debug, Clone)]
pub struct ProtectConfig {
    /// Pipeline order.  Different orders give different (still correct)
    /// output.
    pub passes: Vec<PassKind>,
    /// RNG seed; `None` draws one from the OS.
    pub seed: Option<u64>,
    /// Size of the injector section in bytes.
    pub injector_capacity: usize,
    /// Section receiving injected helpers.
    pub injector_section: String,
    /// Section receiving the rewritten code.
    pub code_section: String,
    /// Mnemonics the virtualization pass may convert.
    pub virtualize: Vec<Mnemonic>,
    pub symbols: RuntimeSymbols,
}

impl Default for ProtectConfig {
    fn default() -> Self {
        Self {
            passes: PassKind::ALL.to_vec(),
            seed: None,
            injector_capacity: 0x2000,
            injector_section: ".veil0".to_string(),
            code_section: ".veil1".to_string(),
            virtualize: vec![Mnemonic::Add, Mnemonic::Sub],
            symbols: RuntimeSymbols::default(),
        }
    }
}

impl ProtectConfig {
    /// Parse a comma-separated pass list such as `"mutation,cff"`.
    pub fn parse_passes(list: &str) -> Result<Vec<PassKind>, Error> {
        list.split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_order() {
        let config = ProtectConfig::default();
        assert_eq!(
            config.passes,
            vec![
                PassKind::Virtualization,
                PassKind::Mutation,
                PassKind::ControlFlow,
                PassKind::Imports
            ]
        );
        assert_eq!(config.injector_capacity, 0x2000);
        assert_eq!(config.virtualize, vec![Mnemonic::Add, Mnemonic::Sub]);
    }

    #[test]
    fn parse_pass_list() {
        let passes = ProtectConfig::parse_passes("Mutation, cff,vm").expect("parse");
        assert_eq!(
            passes,
            vec![PassKind::Mutation, PassKind::ControlFlow, PassKind::Virtualization]
        );
        assert!(ProtectConfig::parse_passes("").expect("empty").is_empty());
        assert!(matches!(
            ProtectConfig::parse_passes("mutation,packer"),
            Err(Error::UnknownPass(name)) if name == "packer"
        ));
    }
}
