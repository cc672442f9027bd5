//! Two-phase page-table relocation around `ExitBootServices`.
//!
//! Phase 1 runs before boot services are torn down: it clones the firmware's
//! own page tables into firmware-allocated scratch and switches to them, so
//! the loader keeps running even if the firmware marks its original tables
//! read-only afterward. Phase 2 runs once [`crate::memory_map::MemoryMap`]
//! has been turned into a blacklist and the kernel's fixed-address regions
//! are reserved: it clones again, this time into memory carved out of the
//! [`crate::alloc_table::RuntimeAllocator`], so the tables never collide
//! with the kernel image.
//!
//! Both phases share [`crate::page_table`]'s walker and sanity rules; only
//! the frame source differs, via the [`FrameSource`] trait.

use crate::alloc_table::{AllocMode, RuntimeAllocator};
use crate::page_table::{self, Memory, RawTable};
use crate::Error;

/// Supplies fresh, zeroed table-sized frames to the walker's copy pass.
/// Phase 1 and phase 2 each provide one implementation; no other frame
/// sources are needed.
pub trait FrameSource {
    fn alloc_frame(&mut self) -> Result<u64, Error>;
}

/// Raw physical-memory access shared by both phases: reading and writing
/// whole tables. On real hardware this is a pointer dereference into
/// identity-mapped memory; tests substitute an in-memory fixture.
pub trait RawAccess {
    fn read_table(&self, pa: u64) -> RawTable;
    fn write_table(&mut self, pa: u64, table: &RawTable);
}

/// Combines a [`RawAccess`] implementation with a [`FrameSource`] into a
/// [`page_table::Memory`].
pub struct PhysMemory<A, F> {
    pub access: A,
    pub frames: F,
}

impl<A: RawAccess, F: FrameSource> Memory for PhysMemory<A, F> {
    fn read_table(&self, pa: u64) -> RawTable {
        self.access.read_table(pa)
    }

    fn write_table(&mut self, pa: u64, table: &RawTable) {
        self.access.write_table(pa, table)
    }

    fn alloc_table(&mut self) -> Result<u64, Error> {
        self.frames.alloc_frame()
    }
}

/// A [`FrameSource`] backed by the [`RuntimeAllocator`], used for phase 2.
/// Frames are carved out with `ANY` mode and page alignment.
pub struct AllocatorFrameSource<'a> {
    allocator: &'a mut RuntimeAllocator,
    frame_size: u64,
}

impl<'a> AllocatorFrameSource<'a> {
    pub fn new(allocator: &'a mut RuntimeAllocator, frame_size: u64) -> AllocatorFrameSource<'a> {
        AllocatorFrameSource { allocator, frame_size }
    }
}

impl<'a> FrameSource for AllocatorFrameSource<'a> {
    fn alloc_frame(&mut self) -> Result<u64, Error> {
        let mut addr = 0;
        self.allocator.alloc(&mut addr, self.frame_size, self.frame_size, AllocMode::Any)?;
        Ok(addr)
    }
}

/// Orchestrates one phase of page-table relocation: measure, then copy.
/// `measure` is exposed separately because phase 1's caller needs the count
/// before it can ask firmware for scratch pages.
pub struct PTRelocator;

impl PTRelocator {
    pub fn measure(mem: &impl Memory, root_pa: u64, pa_mask: u64, is_ram: &impl Fn(u64) -> bool) -> usize {
        page_table::measure(mem, root_pa, pa_mask, is_ram)
    }

    pub fn copy(
        mem: &mut impl Memory,
        root_pa: u64,
        pa_mask: u64,
        is_ram: &impl Fn(u64) -> bool,
        in_fw_map: &impl Fn(u64) -> bool,
    ) -> Result<u64, Error> {
        page_table::copy(mem, root_pa, pa_mask, is_ram, in_fw_map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::ENTRIES;
    use std::collections::HashMap;

    const PA_MASK: u64 = 0x000f_ffff_ffff_f000;
    const PRESENT: u64 = 1;
    const WRITABLE: u64 = 1 << 1;
    const HUGE_PAGE: u64 = 1 << 7;

    struct FixtureAccess {
        tables: HashMap<u64, RawTable>,
    }

    impl RawAccess for FixtureAccess {
        fn read_table(&self, pa: u64) -> RawTable {
            *self.tables.get(&pa).expect("fixture missing table")
        }

        fn write_table(&mut self, pa: u64, table: &RawTable) {
            self.tables.insert(pa, *table);
        }
    }

    struct CountingFrameSource {
        next: u64,
    }

    impl FrameSource for CountingFrameSource {
        fn alloc_frame(&mut self) -> Result<u64, Error> {
            let pa = self.next;
            self.next += 0x1000;
            Ok(pa)
        }
    }

    fn identity_mapped_tree() -> (FixtureAccess, u64) {
        let mut tables = HashMap::new();

        let mut pdpt = [0u64; ENTRIES];
        pdpt[0] = PRESENT | WRITABLE | HUGE_PAGE; // 1 GiB identity mapping at 0
        tables.insert(0x2000, pdpt);

        let mut pml4 = [0u64; ENTRIES];
        pml4[0] = PRESENT | WRITABLE | 0x2000;
        tables.insert(0x1000, pml4);

        (FixtureAccess { tables }, 0x1000)
    }

    fn always_ram(_pa: u64) -> bool {
        true
    }

    fn never_logged(_va: u64) -> bool {
        false
    }

    #[test]
    fn phase1_scratch_copy_preserves_identity_mappings() {
        let (access, root) = identity_mapped_tree();
        let mut mem = PhysMemory { access, frames: CountingFrameSource { next: 0x9000_0000 } };

        let tables = PTRelocator::measure(&mem, root, PA_MASK, &always_ram);
        assert_eq!(tables, 2);

        let new_root = PTRelocator::copy(&mut mem, root, PA_MASK, &always_ram, &never_logged).unwrap();
        assert_ne!(new_root, root);

        let new_pml4 = mem.access.read_table(new_root);
        assert_ne!(new_pml4[0] & PRESENT, 0);
    }

    #[test]
    fn phase2_copy_reserves_its_frames_in_the_allocator() {
        let (access, root) = identity_mapped_tree();
        let mut allocator = RuntimeAllocator::new();
        // Simulate the kernel image already having reserved low memory, as
        // phase 2 assumes `to_blacklist` plus image reservation already ran.
        let mut reserved = 0x0;
        allocator.alloc(&mut reserved, 0x1000, 0x1000, AllocMode::Force).unwrap();

        let frames = AllocatorFrameSource::new(&mut allocator, 0x1000);
        let mut mem = PhysMemory { access, frames };

        let new_root = PTRelocator::copy(&mut mem, root, PA_MASK, &always_ram, &never_logged).unwrap();
        assert_ne!(new_root, 0x1000);

        allocator.sanity_check().unwrap();
        let ranges: Vec<_> = allocator.iter().collect();
        // The pre-existing reservation plus the two freshly allocated table
        // frames must all be present and non-overlapping.
        assert!(ranges.len() >= 2);
    }
}
