//! Hands off to the kernel: relocates firmware runtime services, maps the
//! relocated window into the kernel's own page table, and jumps to the
//! kernel's entry point.
//!
//! Everything up through [`driver::relocate`] still has boot services to
//! fall back on if something goes wrong; once it returns there is no UEFI
//! console, no boot-services allocator, and no way back, so this is also
//! where logging moves fully onto the raw serial port.

use esxboot_core::policy::EfiCaps;
use esxboot_info::BootInfo;
use log::info;
use uefi::prelude::*;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::registers::model_specific::{Efer, EferFlags};
use x86_64::structures::paging::{Page, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::boot_info::BootInfoBuilder;
use crate::driver::{self, RuntimeFrameAllocator};
use crate::page_table::KernelPageTable;
use crate::util::PAGE_SIZE;

/// Where control transfers to once the kernel's page table is live.
pub struct KernelEntry {
    pub entry: VirtAddr,
    pub stack_top: VirtAddr,
}

/// Runs the relocation dance and jumps into the kernel. Never returns.
#[allow(clippy::too_many_arguments)]
pub fn handoff(
    image_handle: Handle,
    system_table: SystemTable<Boot>,
    caps: EfiCaps,
    rts_vaddr: u64,
    rts_size: u64,
    reservations: &[(u64, u64)],
    mut page_table: KernelPageTable,
    boot_info_builder: BootInfoBuilder,
    kernel: KernelEntry,
) -> ! {
    let mut relocation = driver::relocate(image_handle, system_table, caps, rts_vaddr, rts_size, reservations);

    info!(
        "Runtime services relocation {}",
        if relocation.valid { "succeeded" } else { "failed; continuing without relocated runtime services" }
    );

    for desc in &relocation.rt_vmap {
        if desc.len == 0 || desc.virtual_start == 0 {
            continue;
        }

        let page_start = Page::containing_address(VirtAddr::new(desc.virtual_start));
        let frame_start = PhysFrame::containing_address(PhysAddr::new(desc.pa));
        let count = (desc.len / PAGE_SIZE) as usize;
        page_table.map_with(
            &mut RuntimeFrameAllocator(&mut relocation.allocator),
            page_start,
            frame_start,
            count,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
        );
    }

    let boot_info = boot_info_builder.finalize(&relocation);

    unsafe {
        activate_page_table(&page_table);
        jump_to_kernel(&kernel, boot_info);
    }
}

/// Switches to the kernel's own page table. Must happen after relocation:
/// before that point the loader is still running off whatever page table
/// `driver::relocate` left active, which does not yet contain the kernel's
/// own image or stack mappings.
unsafe fn activate_page_table(page_table: &KernelPageTable) {
    Efer::update(|efer| *efer |= EferFlags::NO_EXECUTE_ENABLE);
    info!("Activating kernel page table at {:?}", page_table.page_table_frame());
    Cr3::write(page_table.page_table_frame(), Cr3Flags::empty());
}

/// Jumps to the kernel's entry point with `boot_info` as its first argument,
/// per the System V calling convention.
unsafe fn jump_to_kernel(kernel: &KernelEntry, boot_info: &'static BootInfo) -> ! {
    let stack_top = kernel.stack_top.as_u64();
    let entry = kernel.entry.as_u64();

    asm!(
        "mov rsp, {stack}",
        "and rsp, 0xfffffffffffffff0",
        "xor rbp, rbp",
        "mov rdi, {boot_info}",
        "call {entry}",
        stack = in(reg) stack_top,
        entry = in(reg) entry,
        boot_info = in(reg) boot_info as *const BootInfo,
        options(noreturn),
    );
}
