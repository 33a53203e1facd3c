//! # CPU Identifiers and Sets
//!
//! CPU numbering, bitmap masks for present/online CPUs, and the compressed
//! CPU-set descriptor used by scheduling parameters.

use crate::{HalError, HalResult};
use core::fmt;
use static_assertions::const_assert;

/// Upper bound on the number of CPUs the scheduler can manage
pub const MAX_CPUS: usize = 64;

const_assert!(MAX_CPUS <= u64::BITS as usize);

/// Logical CPU number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// The boot CPU
    pub const BOOT: Self = Self(0);

    /// Create a CPU id
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw CPU number
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get the CPU number as an index into per-CPU tables
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Bitmap of CPUs (bit `n` = CPU `n`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct CpuMask(u64);

impl CpuMask {
    /// Empty mask
    pub const EMPTY: Self = Self(0);

    /// Create from a raw bitmap
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Mask containing CPUs `0..count`
    pub const fn first_n(count: usize) -> Self {
        if count >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    /// Raw bitmap
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Add a CPU
    #[inline]
    pub fn set(&mut self, cpu: CpuId) {
        if cpu.index() < MAX_CPUS {
            self.0 |= 1 << cpu.index();
        }
    }

    /// Remove a CPU
    #[inline]
    pub fn clear(&mut self, cpu: CpuId) {
        if cpu.index() < MAX_CPUS {
            self.0 &= !(1 << cpu.index());
        }
    }

    /// Check membership
    #[inline]
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu.index() < MAX_CPUS && self.0 & (1 << cpu.index()) != 0
    }

    /// Number of CPUs in the mask
    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest CPU in the mask
    pub fn first(self) -> Option<CpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(CpuId::new(self.0.trailing_zeros()))
        }
    }

    /// Iterate over CPUs in ascending order
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..MAX_CPUS as u32)
            .map(CpuId::new)
            .filter(move |&cpu| self.contains(cpu))
    }
}

/// Compressed CPU set as carried in scheduling parameters
///
/// Bit `i` of `map` selects the `2^granularity` CPUs starting at
/// `offset + (i << granularity)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSet {
    map: u64,
    offset: u32,
    granularity: u8,
}

impl CpuSet {
    /// Bits of the descriptor word holding the offset
    const OFFSET_MASK: u64 = 0x00ff_ffff;
    /// Shift of the granularity within the descriptor word
    const GRANULARITY_SHIFT: u32 = 24;

    /// Create a set from its parts
    pub const fn new(offset: u32, granularity: u8, map: u64) -> Self {
        Self { map, offset, granularity }
    }

    /// Set covering every CPU
    pub const fn all() -> Self {
        Self::new(0, 0, u64::MAX)
    }

    /// Set containing exactly one CPU
    pub const fn single(cpu: CpuId) -> Self {
        Self::new(cpu.as_u32(), 0, 1)
    }

    /// Decode a set from its descriptor word and its map word
    ///
    /// CPU numbers are 32 bits wide, so a granularity of 32 or more is
    /// rejected.
    pub fn decode(descr: u64, map: u64) -> HalResult<Self> {
        let offset = (descr & Self::OFFSET_MASK) as u32;
        let granularity = ((descr >> Self::GRANULARITY_SHIFT) & 0xff) as u8;
        if u32::from(granularity) >= u32::BITS {
            return Err(HalError::InvalidParameter);
        }
        Ok(Self::new(offset, granularity, map))
    }

    /// Encode the descriptor word (the map travels in its own word)
    pub const fn descriptor(&self) -> u64 {
        (self.offset as u64 & Self::OFFSET_MASK)
            | ((self.granularity as u64) << Self::GRANULARITY_SHIFT)
    }

    /// Bitmap word
    #[inline]
    pub const fn map(&self) -> u64 {
        self.map
    }

    /// First CPU described by bit 0
    #[inline]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// log2 of the number of CPUs per bit
    #[inline]
    pub const fn granularity(&self) -> u8 {
        self.granularity
    }

    /// Check whether a CPU is selected by this set
    pub fn contains(&self, cpu: CpuId) -> bool {
        let Some(rel) = cpu.as_u32().checked_sub(self.offset) else {
            return false;
        };
        let bit = rel.checked_shr(u32::from(self.granularity)).unwrap_or(0);
        bit < u64::BITS && self.map & (1 << bit) != 0
    }

    /// First CPU below `max` that is both in this set and in `mask`
    pub fn first(&self, mask: CpuMask, max: usize) -> Option<CpuId> {
        (self.offset..max.min(MAX_CPUS) as u32)
            .map(CpuId::new)
            .find(|&cpu| mask.contains(cpu) && self.contains(cpu))
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_basic() {
        let mut mask = CpuMask::EMPTY;
        assert_eq!(mask.first(), None);

        mask.set(CpuId::new(3));
        mask.set(CpuId::new(1));
        assert!(mask.contains(CpuId::new(1)));
        assert!(!mask.contains(CpuId::new(2)));
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.first(), Some(CpuId::new(1)));

        mask.clear(CpuId::new(1));
        assert_eq!(mask.first(), Some(CpuId::new(3)));
        assert!(!mask.contains(CpuId::new(200)));
    }

    #[test]
    fn test_mask_first_n() {
        assert_eq!(CpuMask::first_n(0).bits(), 0);
        assert_eq!(CpuMask::first_n(4).bits(), 0b1111);
        assert_eq!(CpuMask::first_n(64).bits(), u64::MAX);

        let cpus: alloc::vec::Vec<_> = CpuMask::from_bits(0b1010).iter().collect();
        assert_eq!(cpus, [CpuId::new(1), CpuId::new(3)]);
    }

    #[test]
    fn test_set_granularity() {
        // Each bit covers 4 CPUs starting at CPU 8
        let set = CpuSet::new(8, 2, 0b10);
        assert!(!set.contains(CpuId::new(4)));
        assert!(!set.contains(CpuId::new(8)));
        assert!(set.contains(CpuId::new(12)));
        assert!(set.contains(CpuId::new(15)));
        assert!(!set.contains(CpuId::new(16)));
    }

    #[test]
    fn test_set_first() {
        let set = CpuSet::new(0, 0, 0b1100);
        let online = CpuMask::from_bits(0b1000);
        assert_eq!(set.first(online, 4), Some(CpuId::new(3)));
        assert_eq!(set.first(online, 3), None);
        assert_eq!(set.first(CpuMask::EMPTY, 64), None);
    }

    #[test]
    fn test_set_descriptor_roundtrip() {
        let set = CpuSet::new(5, 3, 0xff);
        let decoded = CpuSet::decode(set.descriptor(), set.map()).unwrap();
        assert_eq!(decoded, set);

        assert_eq!(
            CpuSet::decode(64 << 24, 1),
            Err(HalError::InvalidParameter)
        );
    }

    #[test]
    fn test_set_wide_granularity() {
        assert!(CpuSet::decode(31 << 24, 1).is_ok());
        for granularity in [32u64, 40, 63, 255] {
            assert_eq!(
                CpuSet::decode(granularity << 24, 1),
                Err(HalError::InvalidParameter)
            );
        }

        // Built directly, one bit covers every CPU past the offset
        let set = CpuSet::new(2, 40, 1);
        assert!(set.contains(CpuId::new(2)));
        assert!(set.contains(CpuId::new(u32::MAX)));
        assert!(!set.contains(CpuId::new(1)));
        assert!(!CpuSet::new(0, 40, 0b10).contains(CpuId::new(7)));
    }
}
