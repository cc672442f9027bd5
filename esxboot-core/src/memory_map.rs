//! The firmware memory map: sort, merge, sanity-check, derive a blacklist.

use core::fmt;

use crate::alloc_table::{AllocMode, RuntimeAllocator};
use crate::range;

/// Maximum number of entries a [`MemoryMap`] can hold. Firmware memory maps
/// in practice stay well under this; entries beyond it are simply not
/// recorded by [`MemoryMap::merge`] (which only ever reduces the descriptor
/// count the caller handed it).
pub const MAX_ENTRIES: usize = 512;

/// Kind of memory described by a [`MemoryMapEntry`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryType {
    /// Conventional RAM, free for the loader or kernel to use.
    Available,
    /// Memory already consumed by the bootloader itself (its own image,
    /// stack, or loader-allocated data).
    Bootloader,
    /// Reserved by firmware or a platform for reasons opaque to software.
    Reserved,
    /// ACPI tables that can be reclaimed once the kernel has read them.
    AcpiReclaim,
    /// ACPI non-volatile storage; never reclaimable.
    AcpiNvs,
    /// Memory-mapped I/O.
    Mmio,
    /// Firmware runtime-services code, must stay mapped and callable.
    RuntimeCode,
    /// Firmware runtime-services data, must stay mapped and callable.
    RuntimeData,
    /// Memory known to be unusable (e.g. hardware-reported defective RAM).
    Unusable,
    /// Persistent memory (NVDIMM-backed).
    Persistent,
}

impl MemoryType {
    /// True for the only two types the allocator may ever hand back out:
    /// ordinary free RAM, and memory the bootloader itself already used (and
    /// which the kernel may reclaim once it no longer needs the loader).
    fn is_normal_ram(self) -> bool {
        matches!(self, MemoryType::Available | MemoryType::Bootloader)
    }
}

/// One descriptor in a firmware (or post-merge) memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub len: u64,
    pub ty: MemoryType,
    pub attributes: u64,
}

impl MemoryMapEntry {
    pub fn new(base: u64, len: u64, ty: MemoryType, attributes: u64) -> MemoryMapEntry {
        MemoryMapEntry { base, len, ty, attributes }
    }

    fn mergeable_with(&self, other: &MemoryMapEntry) -> bool {
        self.ty == other.ty
            && self.attributes == other.attributes
            && range::mergeable(self.base, self.len, other.base, other.len)
    }

    /// Merge `other` into `self` in place, assuming [`mergeable_with`] held.
    fn absorb(&mut self, other: &MemoryMapEntry) {
        let self_end = self.base.saturating_add(self.len);
        let other_end = other.base.saturating_add(other.len);
        let new_base = self.base.min(other.base);
        let new_end = self_end.max(other_end);
        self.base = new_base;
        self.len = new_end - new_base;
    }
}

/// A firmware memory map: a fixed-capacity, sorted collection of
/// [`MemoryMapEntry`] values.
#[derive(Copy, Clone)]
pub struct MemoryMap {
    entries: [Option<MemoryMapEntry>; MAX_ENTRIES],
    len: usize,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMap {
    pub fn new() -> MemoryMap {
        MemoryMap { entries: [None; MAX_ENTRIES], len: 0 }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryMapEntry> {
        self.entries[..self.len].iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Builds a `MemoryMap` by sorting `raw` and greedily coalescing runs of
    /// mergeable neighbors starting at each index. Entries beyond
    /// [`MAX_ENTRIES`] after coalescing are dropped; real firmware maps stay
    /// well within capacity.
    pub fn merge(raw: &mut [MemoryMapEntry]) -> MemoryMap {
        raw.sort_by(|a, b| a.base.cmp(&b.base));

        let mut out = MemoryMap::new();
        let mut i = 0;
        while i < raw.len() {
            let mut current = raw[i];
            let mut j = i + 1;
            while j < raw.len() && current.mergeable_with(&raw[j]) {
                current.absorb(&raw[j]);
                j += 1;
            }

            if out.len < MAX_ENTRIES {
                out.entries[out.len] = Some(current);
                out.len += 1;
            }

            i = j;
        }

        out
    }

    /// Validates sort order and flags overlaps.
    ///
    /// A non-sorted order is a hard failure (`Err`); an overlap between two
    /// non-zero-length entries is reported as a warning (`Ok(false)`) rather
    /// than a fatal error, since it can arise from firmware maps that are
    /// merely imprecise rather than corrupt. Zero-length entries are
    /// skipped entirely.
    pub fn sanity_check(&self) -> Result<bool, crate::Error> {
        let mut ok = true;
        let mut prev: Option<&MemoryMapEntry> = None;

        for entry in self.iter() {
            if entry.len == 0 {
                continue;
            }

            if let Some(prev) = prev {
                if entry.base < prev.base {
                    return Err(crate::Error::InvalidParameter);
                }

                if range::overlap(prev.base, prev.len, entry.base, entry.len) {
                    ok = false;
                }
            }

            prev = Some(entry);
        }

        Ok(ok)
    }

    /// Occupies every byte not known to be normal RAM in `allocator`:
    /// everything above the highest described byte, every gap between
    /// consecutive entries, and every entry whose type is neither
    /// `Available` nor `Bootloader`.
    pub fn to_blacklist(&self, allocator: &mut RuntimeAllocator) -> Result<(), crate::Error> {
        let mut cursor: u64 = 0;

        for entry in self.iter() {
            if entry.len == 0 {
                continue;
            }

            if entry.base > cursor {
                Self::blacklist_range(allocator, cursor, entry.base - cursor)?;
            }

            if !entry.ty.is_normal_ram() {
                Self::blacklist_range(allocator, entry.base, entry.len)?;
            }

            cursor = cursor.max(entry.base.saturating_add(entry.len));
        }

        // Everything above the highest described byte, up to and including
        // the very top of the address space, is unknown and must be
        // blacklisted too. The sentinel reaches `2^64`, not `u64::MAX`
        // (2^64 - cursor is exactly representable as a u64 as long as
        // cursor > 0, which it always is here since `self` describes at
        // least one byte below it).
        if cursor > 0 {
            Self::blacklist_range(allocator, cursor, u64::MAX - cursor + 1)?;
        }

        Ok(())
    }

    fn blacklist_range(allocator: &mut RuntimeAllocator, base: u64, len: u64) -> Result<(), crate::Error> {
        if len == 0 {
            return Ok(());
        }
        let mut addr = base;
        allocator.alloc(&mut addr, len, 1, AllocMode::Force)?;
        Ok(())
    }
}

impl fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl fmt::Display for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.iter() {
            writeln!(
                f,
                "* {:#018x} - {:#018x}: {:?} (attr {:#x})",
                entry.base,
                entry.base.saturating_add(entry.len),
                entry.ty,
                entry.attributes
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn entry(base: u64, len: u64, ty: MemoryType) -> MemoryMapEntry {
        MemoryMapEntry::new(base, len, ty, 0)
    }

    #[test]
    fn merge_coalesces_adjacent_same_type_runs() {
        // S4: three entries, first two adjacent AVAILABLE (1 page each), third
        // adjacent AVAILABLE (2 pages) -> one 4-page entry.
        let mut raw = [
            entry(0x0000, 0x1000, MemoryType::Available),
            entry(0x1000, 0x1000, MemoryType::Available),
            entry(0x2000, 0x2000, MemoryType::Available),
        ];
        let map = MemoryMap::merge(&mut raw);
        let merged: Vec<_> = map.iter().collect();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].base, 0x0000);
        assert_eq!(merged[0].len, 0x4000);
    }

    #[test]
    fn merge_keeps_distinct_types_separate() {
        let mut raw = [
            entry(0x0000, 0x1000, MemoryType::Available),
            entry(0x1000, 0x1000, MemoryType::Reserved),
            entry(0x2000, 0x1000, MemoryType::Available),
        ];
        let map = MemoryMap::merge(&mut raw);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut raw = [
            entry(0x0000, 0x1000, MemoryType::Available),
            entry(0x1000, 0x1000, MemoryType::Available),
            entry(0x5000, 0x1000, MemoryType::Reserved),
        ];
        let once = MemoryMap::merge(&mut raw);
        let mut collected: Vec<_> = once.iter().copied().collect();
        let twice = MemoryMap::merge(&mut collected);

        let once_vec: Vec<_> = once.iter().collect();
        let twice_vec: Vec<_> = twice.iter().collect();
        assert_eq!(once_vec.len(), twice_vec.len());
        for (a, b) in once_vec.iter().zip(twice_vec.iter()) {
            assert_eq!(a.base, b.base);
            assert_eq!(a.len, b.len);
            assert_eq!(a.ty, b.ty);
        }
    }

    #[test]
    fn sanity_check_flags_unsorted_as_error() {
        let map = {
            let mut m = MemoryMap::new();
            // Hand-build an out-of-order map, bypassing `merge`'s sort.
            m.entries[0] = Some(entry(0x1000, 0x1000, MemoryType::Available));
            m.entries[1] = Some(entry(0x0000, 0x1000, MemoryType::Available));
            m.len = 2;
            m
        };
        assert!(map.sanity_check().is_err());
    }

    #[test]
    fn sanity_check_warns_on_overlap_but_does_not_fail() {
        let map = {
            let mut m = MemoryMap::new();
            m.entries[0] = Some(entry(0x0000, 0x2000, MemoryType::Available));
            m.entries[1] = Some(entry(0x1000, 0x2000, MemoryType::Reserved));
            m.len = 2;
            m
        };
        assert_eq!(map.sanity_check(), Ok(false));
    }

    #[test]
    fn sanity_check_skips_zero_length_entries() {
        let map = {
            let mut m = MemoryMap::new();
            m.entries[0] = Some(entry(0x0000, 0, MemoryType::Available));
            m.entries[1] = Some(entry(0x1000, 0x1000, MemoryType::Available));
            m.len = 2;
            m
        };
        assert_eq!(map.sanity_check(), Ok(true));
    }

    #[test]
    fn to_blacklist_matches_scenario_s3() {
        // S3: {[0,0x1000,AVAILABLE],[0x1000,0x2000,RESERVED],[0x3000,0x1000,AVAILABLE]}
        // -> AllocTable = {[0x1000,0x2000],[0x4000, 2^64-0x4000]}
        let mut raw = [
            entry(0x0000, 0x1000, MemoryType::Available),
            entry(0x1000, 0x2000, MemoryType::Reserved),
            entry(0x3000, 0x1000, MemoryType::Available),
        ];
        let map = MemoryMap::merge(&mut raw);

        let mut allocator = RuntimeAllocator::new();
        map.to_blacklist(&mut allocator).unwrap();

        let occupied: Vec<_> = allocator.iter().collect();
        assert_eq!(occupied.len(), 2);
        assert_eq!((occupied[0].base, occupied[0].len), (0x1000, 0x2000));
        assert_eq!(occupied[1].base, 0x4000);
        assert_eq!(occupied[1].len, u64::MAX - 0x4000 + 1);
    }
}
