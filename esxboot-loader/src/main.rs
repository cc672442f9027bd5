#![no_std]
#![no_main]
#![feature(asm, abi_efiapi)]

extern crate alloc;

use alloc::vec::Vec;

use esxboot_config::Config;
use esxboot_core::policy::EfiCaps;
use log::info;
use uefi::prelude::*;
use uefi::table::boot::MemoryType;

mod boot_info;
mod driver;
mod elf;
mod file;
mod handoff;
mod memory_map;
mod page_table;
mod smbios;
mod util;

use boot_info::BootInfoBuilder;
use elf::Object;
use file::File;
use handoff::KernelEntry;
use memory_map::{create_kernel_stack, map_uefi_environment, KERNEL_STACK_PAGES, KERNEL_STACK_START, RTS_VADDR};
use page_table::KernelPageTable;

/// Memory type for the kernel image (both code and data)
pub const KERNEL_IMAGE: MemoryType = MemoryType(0x7000_0042);

/// Memory type for data allocated for the kernel by the bootloader, such as its stack
pub const KERNEL_DATA: MemoryType = MemoryType(0x7000_0043);

/// Memory type for the initial kernel page table (and its page-table-building
/// frames) created by the bootloader.
pub const KERNEL_RECLAIMABLE: MemoryType = MemoryType(0x7000_0044);

pub const PAGE_SIZE: u64 = 4096;

/// Path, relative to the ESP root, of the kernel image this loader boots.
const KERNEL_PATH: &str = "esxboot_kernel";

/// Policies this build is willing to let [`esxboot_core::policy::select_policy_in_order`]
/// choose from. All five are implemented, so nothing is excluded here; a
/// platform that needs to disable one does so through `esxboot.toml`'s
/// policy preference list instead of this set.
fn supported_caps() -> EfiCaps {
    EfiCaps::SIMPLE | EfiCaps::SIMPLE_GQ | EfiCaps::SPARSE | EfiCaps::COMPACT | EfiCaps::CONTIG
}

#[entry]
fn uefi_start(image_handle: Handle, system_table: SystemTable<Boot>) -> Status {
    // Safety: called exactly once, before any allocation.
    unsafe { uefi::alloc::init(system_table.boot_services()) };
    esxboot_serial::init(Config::log_settings()).expect("Failed to install serial logger");
    log::set_max_level(if cfg!(debug_assertions) { log::LevelFilter::Trace } else { log::LevelFilter::Info });

    let _ = system_table.stdout().reset(false);
    info!("esxboot starting (UEFI revision {:?})", system_table.uefi_revision());

    wait_for_debugger(&system_table, image_handle);

    let kernel_file = File::open(&system_table, KERNEL_PATH);
    let mut kernel_object = Object::new(kernel_file);
    info!("Kernel entry point: {:?}", kernel_object.metadata.entry());

    let mut page_table = KernelPageTable::new(system_table.boot_services());
    let boot_info_builder = BootInfoBuilder::new(&system_table);

    let stack_range = create_kernel_stack(&mut page_table, system_table.boot_services());
    let image_range = kernel_object.load_and_map(&system_table, &mut page_table);
    map_uefi_environment(&mut page_table, system_table.boot_services());

    let mut reservations: Vec<(u64, u64)> = Vec::new();
    reservations.push(image_range);
    reservations.push(stack_range);
    reservations.push(boot_info_builder.physical_range());
    reservations.extend(page_table.reserved_ranges());

    let rts_vaddr = RTS_VADDR.as_u64();
    let rts_size = Config::default_virtual_window_size("x86_64").unwrap_or(64 * 1024 * 1024);

    let kernel_entry = KernelEntry {
        entry: kernel_object.metadata.entry(),
        stack_top: KERNEL_STACK_START + KERNEL_STACK_PAGES as u64 * PAGE_SIZE,
    };

    handoff::handoff(
        image_handle,
        system_table,
        supported_caps(),
        rts_vaddr,
        rts_size,
        &reservations,
        page_table,
        boot_info_builder,
        kernel_entry,
    )
}

#[cfg(feature = "gdb")]
static mut DEBUGGER_ATTACHED: u8 = 0;

/// Spins until a debugger flips [`DEBUGGER_ATTACHED`], for attaching early
/// enough to catch bugs in the pre-relocation path.
#[cfg(feature = "gdb")]
fn wait_for_debugger(system_table: &SystemTable<Boot>, image_handle: Handle) {
    use uefi::proto::loaded_image::LoadedImage;

    if let Ok(completion) = system_table.boot_services().handle_protocol::<LoadedImage>(image_handle) {
        let _ = completion.log_warning();
    }

    info!("Waiting for debugger (set DEBUGGER_ATTACHED = 1 to continue)...");
    unsafe {
        while core::ptr::read_volatile(&DEBUGGER_ATTACHED) == 0 {
            asm!("pause");
        }
    }
}

#[cfg(not(feature = "gdb"))]
fn wait_for_debugger(_system_table: &SystemTable<Boot>, _image_handle: Handle) {}
