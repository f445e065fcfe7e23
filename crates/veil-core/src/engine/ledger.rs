//! Pending byte-level edits for one pass.
//!
//! Offsets are expressed in the coordinate space of the code as it was when
//! the pass started ("pre-pass" coordinates).  Applying the ledger produces
//! the adjusted buffer; [`Ledger::translate`] maps a pre-pass offset into the
//! adjusted buffer.

use crate::error::{Error, Result};

const NOP: u8 = 0x90;

/// One pending edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjustment {
    pub offset: u32,
    /// `None` inserts `bytes` at `offset`.  `Some(n)` overwrites the `n`
    /// bytes at `offset` and inserts the surplus after them.
    pub replace: Option<u32>,
    pub bytes: Vec<u8>,
    /// Address the bytes were assembled for.
    pub assembled_at: u64,
}

impl Adjustment {
    pub fn insert(offset: u32, bytes: Vec<u8>, assembled_at: u64) -> Adjustment {
        Adjustment {
            offset,
            replace: None,
            bytes,
            assembled_at,
        }
    }

    pub fn replace(offset: u32, len: u32, bytes: Vec<u8>, assembled_at: u64) -> Adjustment {
        Adjustment {
            offset,
            replace: Some(len),
            bytes,
            assembled_at,
        }
    }

    /// Net growth of the buffer.  Short replacements are NOP-padded, so this
    /// is never negative.
    pub fn length(&self) -> u32 {
        let replaced = self.replace.unwrap_or(0);
        (self.bytes.len() as u32).max(replaced) - replaced
    }

    fn end(&self) -> u32 {
        self.offset + self.replace.unwrap_or(0)
    }

    fn padded(&self) -> Vec<u8> {
        let mut bytes = self.bytes.clone();
        if let Some(n) = self.replace {
            if bytes.len() < n as usize {
                bytes.resize(n as usize, NOP);
            }
        }
        bytes
    }
}

/// Where a pre-pass offset ends up after the ledger is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    Kept(u32),
    /// The offset fell strictly inside a replaced span.  Carries the offset
    /// of the replacement's first byte.
    Destroyed(u32),
}

impl Translation {
    pub fn offset(self) -> u32 {
        match self {
            Translation::Kept(offset) | Translation::Destroyed(offset) => offset,
        }
    }
}

/// An adjustment after application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Landed {
    /// Offset of the first byte in the adjusted buffer.
    pub offset: u32,
    /// Bytes as written, padding included.
    pub bytes: Vec<u8>,
    pub assembled_at: u64,
}

#[derive(Debug, Default)]
pub struct Ledger {
    adjustments: Vec<Adjustment>,
}

impl Ledger {
    pub fn new() -> Ledger {
        Ledger::default()
    }

    pub fn push(&mut self, adjustment: Adjustment) {
        self.adjustments.push(adjustment);
    }

    pub fn is_empty(&self) -> bool {
        self.adjustments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.adjustments.len()
    }

    /// Sorted by offset; at the same offset insertions come before the
    /// replacement, otherwise request order is kept.
    fn sorted(&self) -> Vec<&Adjustment> {
        let mut sorted: Vec<&Adjustment> = self.adjustments.iter().collect();
        sorted.sort_by_key(|a| (a.offset, a.replace.is_some()));
        sorted
    }

    /// Reject out-of-range and overlapping edits.
    pub fn validate(&self, len: usize) -> Result<()> {
        let mut covered_until: Option<(u32, u32)> = None;
        for adjustment in self.sorted() {
            if adjustment.end() as usize > len {
                return Err(Error::AdjustmentOutOfRange {
                    offset: adjustment.offset,
                    len,
                });
            }
            if let Some((start, end)) = covered_until {
                if adjustment.offset < end {
                    return Err(Error::OverlappingAdjustments {
                        first: start,
                        second: adjustment.offset,
                    });
                }
            }
            if adjustment.replace.is_some() {
                covered_until = Some((adjustment.offset, adjustment.end()));
            }
        }
        Ok(())
    }

    /// Map a branch target or instruction start into the adjusted buffer.
    ///
    /// An insertion at exactly `offset` pushes it forward; a replacement
    /// starting there does not, so the offset lands on the replacement.
    pub fn translate(&self, offset: u32) -> Translation {
        self.locate(offset, false)
    }

    /// Map the start of an instruction that carries a reference.  Returns
    /// `None` when a replacement overwrote it.
    pub fn translate_source(&self, offset: u32) -> Option<u32> {
        match self.locate(offset, true) {
            Translation::Kept(offset) => Some(offset),
            Translation::Destroyed(_) => None,
        }
    }

    fn locate(&self, offset: u32, source: bool) -> Translation {
        let mut shift = 0;
        for adjustment in self.sorted() {
            if adjustment.offset > offset {
                break;
            }
            match adjustment.replace {
                Some(n) if adjustment.offset < offset || source => {
                    if offset < adjustment.offset + n {
                        return Translation::Destroyed(adjustment.offset + shift);
                    }
                    shift += adjustment.length();
                }
                Some(_) => {}
                None => shift += adjustment.length(),
            }
        }
        Translation::Kept(offset + shift)
    }

    /// Splice every adjustment into `code`.
    pub fn apply(&self, code: &[u8]) -> Result<(Vec<u8>, Vec<Landed>)> {
        self.validate(code.len())?;
        let extra: u32 = self.adjustments.iter().map(Adjustment::length).sum();
        let mut out = Vec::with_capacity(code.len() + extra as usize);
        let mut landed = Vec::with_capacity(self.adjustments.len());
        let mut cursor = 0usize;

        for adjustment in self.sorted() {
            let at = adjustment.offset as usize;
            out.extend_from_slice(&code[cursor..at]);
            let bytes = adjustment.padded();
            landed.push(Landed {
                offset: out.len() as u32,
                bytes: bytes.clone(),
                assembled_at: adjustment.assembled_at,
            });
            out.extend_from_slice(&bytes);
            cursor = adjustment.end() as usize;
        }
        out.extend_from_slice(&code[cursor..]);
        Ok((out, landed))
    }
}
