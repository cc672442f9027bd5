//! Kernel page table setup

use alloc::vec::Vec;

use log::trace;
use uefi::prelude::*;
use uefi::table::boot::{AllocateType, BootServices};
use x86_64::{
    structures::paging::{
        FrameAllocator, Mapper, OffsetPageTable, Page, PageSize, PageTable, PageTableFlags, PhysFrame,
        Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::KERNEL_RECLAIMABLE;

pub struct KernelPageTable {
    /// Kernel PML4 (top-level page table)
    page_table: &'static mut PageTable,

    /// Physical address of the kernel's PML4, needed so we can switch to it
    page_table_address: PhysAddr,

    /// Every frame allocated for this table (the root plus intermediate
    /// tables) before `ExitBootServices`. Firmware reports all of them as
    /// `KERNEL_RECLAIMABLE`, which the post-exit allocator otherwise treats
    /// as fair game; since the kernel keeps running on this exact table,
    /// they need to be reserved explicitly instead.
    allocated_frames: Vec<PhysFrame>,
}

impl KernelPageTable {
    /// Creates a new, empty kernel page table.
    pub fn new(boot_services: &BootServices) -> KernelPageTable {
        let page_table_address = boot_services
            .allocate_pages(AllocateType::AnyPages, KERNEL_RECLAIMABLE, 1)
            .expect_success("Could not allocate kernel page table");
        trace!("Allocated kernel page table at {:0x}", page_table_address);

        // Safety: the firmware just told us we could use this
        let page_table = unsafe { &mut *(page_table_address as *mut PageTable) };
        page_table.zero();

        let root_frame = PhysFrame::containing_address(PhysAddr::new(page_table_address));
        KernelPageTable {
            page_table_address: PhysAddr::new(page_table_address),
            page_table,
            allocated_frames: alloc::vec![root_frame],
        }
    }

    /// Physical frame backing this page table's PML4, needed to load `CR3`.
    pub fn page_table_frame(&self) -> PhysFrame {
        PhysFrame::containing_address(self.page_table_address)
    }

    /// `(base, len)` pairs covering every frame this table has consumed so
    /// far, for reserving them out of the post-exit allocator.
    pub fn reserved_ranges(&self) -> Vec<(u64, u64)> {
        self.allocated_frames.iter().map(|f| (f.start_address().as_u64(), Size4KiB::SIZE)).collect()
    }

    /// Linearly maps `count` pages starting at `frame_start` in physical memory to `page_start` in the kernel's page table.
    pub fn map(
        &mut self,
        boot_services: &BootServices,
        page_start: Page,
        frame_start: PhysFrame,
        count: usize,
        flags: PageTableFlags,
    ) {
        let mut allocator =
            TrackingFrameAllocator { inner: UefiFrameAllocator(boot_services), frames: &mut self.allocated_frames };
        Self::map_impl(self.page_table, &mut allocator, page_start, frame_start, count, flags);
    }

    /// Same as [`KernelPageTable::map`], but against an arbitrary
    /// intermediate-table frame source instead of the firmware's own pool
    /// allocator. Needed once boot services are gone, since
    /// [`UefiFrameAllocator`] can no longer hand out frames at that point.
    /// Frames it allocates are not added to [`KernelPageTable::reserved_ranges`]:
    /// callers post-exit source them from the same [`esxboot_core::alloc_table::RuntimeAllocator`]
    /// that is already tracking them as consumed.
    pub fn map_with(
        &mut self,
        allocator: &mut impl FrameAllocator<Size4KiB>,
        page_start: Page,
        frame_start: PhysFrame,
        count: usize,
        flags: PageTableFlags,
    ) {
        Self::map_impl(self.page_table, allocator, page_start, frame_start, count, flags);
    }

    fn map_impl(
        page_table: &mut PageTable,
        allocator: &mut impl FrameAllocator<Size4KiB>,
        page_start: Page,
        frame_start: PhysFrame,
        count: usize,
        flags: PageTableFlags,
    ) {
        // This whole function isn't considered unsafe because we know the kernel page table isn't being used yet

        trace!(
            "Mapping {} pages starting at {:?} to {:?} (flags: {:?})",
            count,
            page_start,
            frame_start,
            flags
        );

        // Safety: we know the page table is valid and not in use. UEFI also guarantees that physical memory is identity-mapped
        let mut table = unsafe { OffsetPageTable::new(page_table, VirtAddr::new(0)) };

        for i in 0..count {
            let page = page_start + i as u64;
            let frame = frame_start + i as u64;
            // Safety: we know the page table is't in use, so this won't alias memory
            unsafe {
                // Using map_to_with_table_flags to make sure USER_ACCESSIBLE isn't set, and to set GLOBAL
                table
                    .map_to_with_table_flags(
                        page,
                        frame,
                        flags,
                        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL,
                        allocator,
                    )
                    .expect("Could not update kernel page table")
                    .ignore();
            }
        }
    }
}

struct UefiFrameAllocator<'a>(&'a BootServices);

unsafe impl<'a> FrameAllocator<Size4KiB> for UefiFrameAllocator<'a> {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.0
            .allocate_pages(AllocateType::AnyPages, KERNEL_RECLAIMABLE, 1)
            .log_warning()
            .ok()
            .map(|start_addr| {
                PhysFrame::from_start_address(PhysAddr::new(start_addr))
                    .expect("Allocator returned an unaligned frame")
            })
    }
}

/// Wraps [`UefiFrameAllocator`] to additionally record every frame it hands
/// out, so [`KernelPageTable::reserved_ranges`] can report them later.
struct TrackingFrameAllocator<'a, 'b> {
    inner: UefiFrameAllocator<'a>,
    frames: &'b mut Vec<PhysFrame>,
}

unsafe impl<'a, 'b> FrameAllocator<Size4KiB> for TrackingFrameAllocator<'a, 'b> {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.inner.allocate_frame()?;
        self.frames.push(frame);
        Some(frame)
    }
}
