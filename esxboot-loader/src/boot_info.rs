//! Builds the [`esxboot_info::BootInfo`] block handed to the kernel.
//!
//! The RSDP lookup has to happen before `ExitBootServices` (it walks the
//! UEFI configuration table), but the rest of `BootInfo` — the relocated
//! system table pointer, the post-exit memory map, whether relocation
//! actually succeeded — is only known once [`crate::driver::relocate`] has
//! run. [`BootInfoBuilder`] bridges the two: it reserves the page before
//! exit and `finalize`s the contents afterward.

use core::mem::{self, MaybeUninit};

use esxboot_info::BootInfo;
use log::info;
use uefi::prelude::*;
use uefi::Guid;
use x86_64::PhysAddr;

use crate::driver::RelocationResult;
use crate::memory_map::KERNEL_DATA;
use crate::util::allocate_frames;

const INFO_PAGES: usize = (mem::size_of::<BootInfo>() + 4095) / 4096;

/// Builder for the kernel's boot info block. Must be created before the
/// kernel's page table is finalized and `finalize`d only after relocation.
pub struct BootInfoBuilder {
    info_page: PhysAddr,
    rsdp: Option<PhysAddr>,
}

impl BootInfoBuilder {
    pub fn new(system_table: &SystemTable<Boot>) -> BootInfoBuilder {
        let (frame, _) = allocate_frames(system_table, INFO_PAGES, KERNEL_DATA);
        info!("Allocated boot info block ({} pages) at {:#x}", INFO_PAGES, frame.as_u64());
        BootInfoBuilder { info_page: frame, rsdp: BootInfoBuilder::find_rsdp(system_table) }
    }

    /// Physical `(base, len)` range backing the eventual `BootInfo` block.
    pub fn physical_range(&self) -> (u64, u64) {
        (self.info_page.as_u64(), (INFO_PAGES as u64) * 4096)
    }

    /// Writes the final [`BootInfo`] into the reserved page(s) and returns a
    /// `'static` reference to it, for passing to the kernel entry point.
    pub fn finalize(self, relocation: &RelocationResult) -> &'static BootInfo {
        let info = BootInfo::new(
            self.rsdp.unwrap_or_else(|| PhysAddr::new(0)),
            relocation.systab_ptr,
            relocation.systab_size,
            relocation.caps,
            relocation.quirks,
            relocation.valid,
            relocation.boot_info_memory_map,
        );

        let slot = self.info_page.as_u64() as *mut MaybeUninit<BootInfo>;
        unsafe {
            *slot = MaybeUninit::new(info);
            (*slot).assume_init_ref()
        }
    }

    /// Locates the ACPI RSDP in the UEFI configuration table.
    fn find_rsdp(system_table: &SystemTable<Boot>) -> Option<PhysAddr> {
        system_table
            .config_table()
            .iter()
            .find(|entry| entry.guid == ACPI_2_0_RSDP_GUID || entry.guid == ACPI_1_0_RSDP_GUID)
            .map(|entry| PhysAddr::new(entry.address as u64))
    }
}

// Section 5.2.5.2, UEFI ACPI specification v6.2.
const ACPI_1_0_RSDP_GUID: Guid =
    Guid::from_values(0xeb9d2d30, 0x2d88, 0x11d3, 0x9a16, [0x00, 0x90, 0x27, 0x3f, 0xc1, 0x4d]);
const ACPI_2_0_RSDP_GUID: Guid =
    Guid::from_values(0x8868e871, 0xe4f1, 0x11d3, 0xbc22, [0x00, 0x80, 0xc7, 0x3c, 0x88, 0x81]);
