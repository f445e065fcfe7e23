use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Original instruction-start offset to current offset, kept valid across
/// every pass of a `process` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetMap {
    entries: BTreeMap<u32, u32>,
}

impl OffsetMap {
    /// Identity map over `offsets`.
    pub fn seed(offsets: impl IntoIterator<Item = u32>) -> OffsetMap {
        OffsetMap {
            entries: offsets.into_iter().map(|offset| (offset, offset)).collect(),
        }
    }

    /// Current offset of the instruction originally at `original`.
    pub fn get(&self, original: u32) -> Result<u32> {
        self.entries
            .get(&original)
            .copied()
            .ok_or(Error::UnmappedOffset(original))
    }

    pub fn contains(&self, original: u32) -> bool {
        self.entries.contains_key(&original)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries.iter().map(|(&original, &current)| (original, current))
    }

    /// Rewrite every current offset through `f`.  `Ok(None)` drops the
    /// entry.
    pub(crate) fn remap<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(u32, u32) -> Result<Option<u32>>,
    {
        let mut remapped = BTreeMap::new();
        for (&original, &current) in &self.entries {
            if let Some(next) = f(original, current)? {
                remapped.insert(original, next);
            }
        }
        self.entries = remapped;
        Ok(())
    }
}
