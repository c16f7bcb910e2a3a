//! Bit vector (Bitvec)
//!
//! Tracks a set of page numbers in `1..=size`. Bit 0 does not exist,
//! matching page numbering.

use crate::error::{Error, ErrorCode, Result};

#[derive(Clone, Debug, Default)]
pub struct BitVec {
    bits: Vec<u64>,
    size: u32,
}

impl BitVec {
    /// sqlite3BitvecCreate
    pub fn new(size: u32) -> Self {
        Self {
            bits: vec![0; (size as usize).div_ceil(64)],
            size,
        }
    }

    /// Largest index the vector can hold.
    pub fn size(&self) -> u32 {
        self.size
    }

    fn slot(&self, i: u32) -> Option<(usize, u64)> {
        if i == 0 || i > self.size {
            return None;
        }
        let bit = (i - 1) as usize;
        Some((bit / 64, 1u64 << (bit % 64)))
    }

    /// sqlite3BitvecTest. Out-of-range indices test false.
    pub fn test(&self, i: u32) -> bool {
        self.slot(i).is_some_and(|(word, mask)| self.bits[word] & mask != 0)
    }

    /// sqlite3BitvecSet
    pub fn set(&mut self, i: u32) -> Result<()> {
        let (word, mask) = self.slot(i).ok_or_else(|| {
            Error::with_message(ErrorCode::Range, format!("bit {} outside 1..={}", i, self.size))
        })?;
        self.bits[word] |= mask;
        Ok(())
    }

    /// sqlite3BitvecClear
    pub fn clear(&mut self, i: u32) {
        if let Some((word, mask)) = self.slot(i) {
            self.bits[word] &= !mask;
        }
    }

    pub fn count(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    /// Indices in `1..=size` that are not set, in increasing order.
    pub fn unset(&self) -> impl Iterator<Item = u32> + '_ {
        (1..=self.size).filter(move |&i| !self.test(i))
    }
}
