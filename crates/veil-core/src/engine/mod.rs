//! The rewriting engine.
//!
//! [`Compiler::process`] moves one executable section into a fresh section,
//! runs the configured passes over the moved copy and leaves a jump stub at
//! the old entry point.  Between passes every branch and RIP-relative operand
//! is recomputed from a reference table, so passes only ever describe edits
//! and never fix addresses themselves.
//!
//! Three coordinate systems are in play during a pass:
//!
//! * original offsets, as decoded from the input section,
//! * pre-pass offsets, what the pass saw,
//! * post-adjust offsets, after the ledger has been applied.
//!
//! The [`OffsetMap`] carries original offsets to the current ones across the
//! whole pipeline.

pub mod ledger;
pub mod offsets;
pub mod repair;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use iced_x86::code_asm::CodeAssembler;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::{debug, info, warn};

use crate::config::ProtectConfig;
use crate::error::{Error, Result};
use crate::inject::Injector;
use crate::pe::exception::parse_runtime_functions;
use crate::pe::exports::parse_exports;
use crate::pe::parser::{read_u32, read_u64};
use crate::pe::reloc::parse_relocations;
use crate::pe::writer::{
    add_section, next_section_rva, overwrite_section, patch_bytes, write_pe, IMAGE_SCN_CNT_CODE,
    IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ,
};
use crate::pe::{ImportTable, PeError, PeFile};
use crate::runtime::RuntimeModule;
use crate::transform::{self, PassContext, Protection};
use crate::x86;

pub use ledger::{Adjustment, Ledger, Translation};
pub use offsets::OffsetMap;

const CODE_CHARACTERISTICS: u32 = IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ;

/// Where a region went and how its instructions were laid out there.
#[derive(Debug, Clone)]
pub struct MovedRegion {
    pub old_base: u32,
    pub old_size: u32,
    pub new_base: u32,
    pub new_size: u32,
    pub map: OffsetMap,
}

impl MovedRegion {
    pub fn contains_old(&self, rva: u32) -> bool {
        rva >= self.old_base && rva - self.old_base < self.old_size
    }

    /// New RVA of the instruction that started at `rva`, or `None` when `rva`
    /// lies outside the old region.
    pub fn remap(&self, rva: u32) -> Result<Option<u32>> {
        if !self.contains_old(rva) {
            return Ok(None);
        }
        let offset = self.map.get(rva - self.old_base)?;
        Ok(Some(self.new_base + offset))
    }

    /// Like [`MovedRegion::remap`], but the end of the region is accepted as
    /// well.  For exclusive end addresses.
    pub fn remap_end(&self, rva: u32) -> Result<Option<u32>> {
        if rva == self.old_base + self.old_size {
            return Ok(Some(self.new_base + self.map.get(self.old_size)?));
        }
        self.remap(rva)
    }
}

/// Outcome of a successful [`Compiler::process`] call.
#[derive(Debug, Clone)]
pub struct ProtectReport {
    pub section: String,
    pub seed: u64,
    pub passes: Vec<&'static str>,
    pub region: MovedRegion,
    /// Injector bytes in use, alignment included.
    pub injected: usize,
    pub relocations: usize,
    pub exceptions: usize,
    pub exports: usize,
}

/// The code being rewritten, at its new base.
struct Region {
    old_base: u32,
    new_base: u32,
    code: Vec<u8>,
    map: OffsetMap,
    /// Original offsets the container points at directly.
    anchors: BTreeSet<u32>,
}

impl Region {
    fn base(&self) -> u64 {
        u64::from(self.new_base)
    }

    /// Offset of `target` if it lies inside the current code.
    fn offset_of(&self, target: u64) -> Option<u32> {
        let base = self.base();
        (target >= base && target - base < self.code.len() as u64).then(|| (target - base) as u32)
    }

    /// Absolute post-adjust address of the pre-pass offset `offset`.
    fn resolve(&self, ledger: &Ledger, offset: u32) -> u64 {
        match ledger.translate(offset) {
            Translation::Kept(post) => self.base() + u64::from(post),
            Translation::Destroyed(start) => {
                warn!(
                    offset = format_args!("0x{offset:X}"),
                    "reference into replaced code redirected to the replacement"
                );
                self.base() + u64::from(start)
            }
        }
    }

    /// Move `target` along with the code if it points into it.
    fn retarget(&self, ledger: &Ledger, target: u64) -> u64 {
        match self.offset_of(target) {
            Some(offset) => self.resolve(ledger, offset),
            None => target,
        }
    }

    /// Post-adjust source offset to absolute target, for every surviving
    /// address-relative instruction of the current code.
    fn calc_references(&self, ledger: &Ledger) -> Result<BTreeMap<u32, u64>> {
        let mut references = BTreeMap::new();
        for instruction in x86::decode(&self.code, self.base())? {
            let Some(target) = x86::target(&instruction) else {
                continue;
            };
            let offset = (instruction.ip() - self.base()) as u32;
            let Some(source) = ledger.translate_source(offset) else {
                continue;
            };
            references.insert(source, self.retarget(ledger, target));
        }
        Ok(references)
    }

    /// Add references for inserted code that points outside itself.
    fn fix_adjustments(
        &self,
        landed: &[ledger::Landed],
        ledger: &Ledger,
        references: &mut BTreeMap<u32, u64>,
    ) -> Result<()> {
        for adjustment in landed {
            let span = adjustment.assembled_at..adjustment.assembled_at + adjustment.bytes.len() as u64;
            for instruction in x86::decode(&adjustment.bytes, adjustment.assembled_at)? {
                let Some(target) = x86::target(&instruction) else {
                    continue;
                };
                if span.contains(&target) {
                    continue;
                }
                let source = adjustment.offset + (instruction.ip() - adjustment.assembled_at) as u32;
                references.insert(source, self.retarget(ledger, target));
            }
        }
        Ok(())
    }

    /// Re-encode `adjusted` with every reference resolved and carry the
    /// offset map over to the encoded layout.
    fn reassemble(
        &mut self,
        ledger: &Ledger,
        adjusted: Vec<u8>,
        references: &BTreeMap<u32, u64>,
    ) -> Result<()> {
        let base = self.base();
        let mut instructions = x86::decode(&adjusted, base)?;
        for instruction in &mut instructions {
            let offset = (instruction.ip() - base) as u32;
            if let Some(&target) = references.get(&offset) {
                if x86::is_address_relative(instruction) {
                    x86::set_target(instruction, target);
                }
            }
        }

        let encoded = x86::encode_block(&instructions, base)?;
        let starts: HashMap<u32, u32> = instructions
            .iter()
            .zip(&encoded.offsets)
            .map(|(instruction, &new)| ((instruction.ip() - base) as u32, new))
            .collect();
        let end = adjusted.len() as u32;
        let new_end = encoded.bytes.len() as u32;

        self.map.remap(|original, current| {
            let post = match ledger.translate(current) {
                Translation::Kept(post) => post,
                Translation::Destroyed(_) => {
                    debug!(original = format_args!("0x{original:X}"), "instruction replaced");
                    return Ok(None);
                }
            };
            if post == end {
                return Ok(Some(new_end));
            }
            match starts.get(&post) {
                Some(&u32::MAX) => Err(Error::Unencodable {
                    ip: base + u64::from(post),
                }),
                Some(&new) => Ok(Some(new)),
                None => {
                    warn!(
                        original = format_args!("0x{original:X}"),
                        "offset no longer starts an instruction"
                    );
                    Ok(None)
                }
            }
        })?;

        self.code = encoded.bytes;
        Ok(())
    }

    /// Re-encode the freshly moved code so that references leaving it still
    /// reach their original targets.
    fn normalize(&mut self) -> Result<()> {
        let delta = u64::from(self.new_base - self.old_base);
        let mut references = BTreeMap::new();
        for instruction in x86::decode(&self.code, self.base())? {
            let Some(target) = x86::target(&instruction) else {
                continue;
            };
            if self.offset_of(target).is_none() {
                let offset = (instruction.ip() - self.base()) as u32;
                references.insert(offset, target.wrapping_sub(delta));
            }
        }
        let code = self.code.clone();
        self.reassemble(&Ledger::new(), code, &references)
    }
}

/// Drives the protection of one image.
pub struct Compiler {
    pe: PeFile,
    config: ProtectConfig,
    runtime: Option<Box<dyn RuntimeModule>>,
    imports: ImportTable,
    injector: Option<Injector>,
    rng: ChaCha20Rng,
    seed: u64,
}

impl Compiler {
    /// Take ownership of `pe`.  The injector section is appended right away
    /// when a configured pass needs runtime helpers.
    pub fn new(
        mut pe: PeFile,
        config: ProtectConfig,
        runtime: Option<Box<dyn RuntimeModule>>,
    ) -> Result<Compiler> {
        pe.require_pe64()?;
        let imports = ImportTable::parse(&pe)?;
        let seed = config.seed.unwrap_or_else(rand::random);

        let injector = if config.passes.iter().any(|pass| pass.needs_runtime()) {
            Some(Injector::attach(
                &mut pe,
                &config.injector_section,
                config.injector_capacity,
            )?)
        } else {
            None
        };

        info!(
            seed,
            imports = imports.len(),
            sections = pe.sections.len(),
            "image loaded"
        );
        Ok(Compiler {
            pe,
            config,
            runtime,
            imports,
            injector,
            rng: ChaCha20Rng::seed_from_u64(seed),
            seed,
        })
    }

    pub fn from_bytes(
        data: Vec<u8>,
        config: ProtectConfig,
        runtime: Option<Box<dyn RuntimeModule>>,
    ) -> Result<Compiler> {
        Compiler::new(PeFile::parse(data)?, config, runtime)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn pe(&self) -> &PeFile {
        &self.pe
    }

    pub fn injector(&self) -> Option<&Injector> {
        self.injector.as_ref()
    }

    /// Protect the executable section holding the entry point.
    pub fn protect(&mut self) -> Result<ProtectReport> {
        let entry = self.pe.entry_point();
        let index = self
            .pe
            .section_index_of(entry)
            .filter(|&index| self.pe.sections[index].is_executable())
            .ok_or(Error::NoCodeRegion(entry))?;
        self.process(index)
    }

    /// Move section `index` into a new section, run every configured pass
    /// over it and repair the container.
    pub fn process(&mut self, index: usize) -> Result<ProtectReport> {
        let section = *self
            .pe
            .sections
            .get(index)
            .ok_or(PeError::NoSuchSection(index))?;
        if !section.is_executable() {
            return Err(Error::NoCodeRegion(section.virtual_address));
        }
        let name = section.name_str().to_string();
        let old_base = section.virtual_address;
        let size = if section.virtual_size != 0 {
            section.virtual_size
        } else {
            section.size_of_raw_data
        };
        let code = self.pe.read_virtual(old_base, size as usize)?;
        let new_base = next_section_rva(&self.pe);
        info!(
            section = %name,
            old_base = format_args!("0x{old_base:08X}"),
            new_base = format_args!("0x{new_base:08X}"),
            size,
            "processing region"
        );

        let instructions = x86::decode(&code, u64::from(old_base))?;
        let starts = instructions
            .iter()
            .map(|instruction| {
                instruction
                    .ip()
                    .checked_sub(u64::from(old_base))
                    .and_then(|offset| u32::try_from(offset).ok())
                    .ok_or(Error::Unencodable { ip: instruction.ip() })
            })
            .collect::<Result<Vec<u32>>>()?;
        let map = OffsetMap::seed(starts.into_iter().chain(std::iter::once(size)));
        let mut region = Region {
            old_base,
            new_base,
            code,
            map,
            anchors: self.anchors(old_base, size)?,
        };
        region.normalize()?;

        let mut passes = Vec::new();
        for mut pass in transform::registry(&self.config) {
            self.execute(&mut region, pass.as_mut())?;
            passes.push(pass.name());
        }

        let code_index = add_section(
            &mut self.pe,
            &self.config.code_section,
            &region.code,
            CODE_CHARACTERISTICS,
        )?;
        debug_assert_eq!(self.pe.sections[code_index].virtual_address, new_base);

        let moved = MovedRegion {
            old_base,
            old_size: size,
            new_base,
            new_size: region.code.len() as u32,
            map: region.map,
        };
        self.write_stub(index, &moved)?;
        if let Some(injector) = &self.injector {
            injector.flush(&mut self.pe)?;
        }

        let mut image = PeFile::parse(write_pe(&self.pe))?;
        let relocations = repair::relocations(&mut image, &moved)?;
        let exceptions = repair::exceptions(&mut image, &moved)?;
        let exports = repair::exports(&mut image, &moved)?;
        self.pe = PeFile::parse(image.data)?;

        let injected = self.injector.as_ref().map_or(0, Injector::used);
        info!(
            section = %name,
            from = size,
            to = moved.new_size,
            injected,
            relocations,
            exceptions,
            exports,
            "region protected"
        );
        Ok(ProtectReport {
            section: name,
            seed: self.seed,
            passes,
            region: moved,
            injected,
            relocations,
            exceptions,
            exports,
        })
    }

    /// Run one pass over `region` and bring every reference up to date.
    fn execute(&mut self, region: &mut Region, pass: &mut dyn Protection) -> Result<()> {
        let anchors: BTreeSet<u32> = region
            .anchors
            .iter()
            .filter_map(|&anchor| region.map.get(anchor).ok())
            .collect();
        let mut ledger = Ledger::new();
        let mut cx = PassContext {
            pass: pass.name(),
            ledger: &mut ledger,
            old_base: region.old_base,
            new_base: region.new_base,
            anchors: &anchors,
            injector: self.injector.as_mut(),
            runtime: self.runtime.as_deref(),
            imports: &self.imports,
            config: &self.config,
            rng: &mut self.rng,
        };
        pass.run(&mut cx, &mut region.code)?;

        if ledger.is_empty() {
            debug!(pass = pass.name(), "no edits");
            return Ok(());
        }

        ledger.validate(region.code.len())?;
        let mut references = region.calc_references(&ledger)?;
        let (adjusted, landed) = ledger.apply(&region.code)?;
        region.fix_adjustments(&landed, &ledger, &mut references)?;
        region.reassemble(&ledger, adjusted, &references)?;
        info!(
            pass = pass.name(),
            edits = ledger.len(),
            size = region.code.len(),
            "pass applied"
        );
        Ok(())
    }

    /// Original offsets inside `[base, base + size)` that the container
    /// references: the entry point, exception records, relocation targets
    /// and exports.
    fn anchors(&self, base: u32, size: u32) -> Result<BTreeSet<u32>> {
        let inside = |rva: u32| (rva >= base && rva - base < size).then(|| rva - base);
        let mut anchors = BTreeSet::new();

        anchors.extend(inside(self.pe.entry_point()));
        for function in parse_runtime_functions(&self.pe)? {
            anchors.extend(inside(function.begin));
            anchors.extend(inside(function.end));
        }

        let image_base = self.pe.image_base();
        for relocation in parse_relocations(&self.pe)? {
            let Some(width) = relocation.width() else {
                continue;
            };
            let Some(offset) = self.pe.rva_to_offset(relocation.rva) else {
                continue;
            };
            let value = if width == 8 {
                read_u64(&self.pe.data, offset)?
            } else {
                u64::from(read_u32(&self.pe.data, offset)?)
            };
            if let Some(rva) = value
                .checked_sub(image_base)
                .and_then(|rva| u32::try_from(rva).ok())
            {
                anchors.extend(inside(rva));
            }
        }

        for export in parse_exports(&self.pe)? {
            anchors.extend(inside(export.rva));
        }
        debug!(anchors = anchors.len(), "container anchors collected");
        Ok(anchors)
    }

    /// Blank the old section, leaving a jump to the moved entry point when
    /// the entry point was inside it.
    fn write_stub(&mut self, index: usize, moved: &MovedRegion) -> Result<()> {
        let size = self.pe.sections[index].size_of_raw_data as usize;
        overwrite_section(&mut self.pe, index, &vec![0u8; size])?;

        let entry = self.pe.entry_point();
        if let Some(target) = moved.remap(entry)? {
            let mut asm = CodeAssembler::new(x86::BITNESS)?;
            asm.jmp(u64::from(target))?;
            let jump = asm.assemble(u64::from(entry))?;
            patch_bytes(&mut self.pe, entry, &jump)?;
            debug!(
                entry = format_args!("0x{entry:08X}"),
                target = format_args!("0x{target:08X}"),
                "entry stub written"
            );
        }
        Ok(())
    }

    /// Serialize the protected image.
    pub fn into_image(self) -> Vec<u8> {
        write_pe(&self.pe)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, write_pe(&self.pe))?;
        Ok(())
    }
}
