#![no_std]

use core::fmt;

use x86_64::PhysAddr;

use esxboot_core::memory_map::MemoryMap;
use esxboot_core::policy::{EfiCaps, Quirks};

/// Everything the loader hands the kernel once runtime services have been
/// relocated (or, if `valid` is false, once it gave up trying to).
#[derive(Debug, Copy, Clone)]
pub struct BootInfo {
    rsdp_address: PhysAddr,
    systab_ptr: u64,
    systab_size: u64,
    caps: EfiCaps,
    quirks: Quirks,
    valid: bool,
    memory_map: MemoryMap,
}

impl BootInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rsdp_address: PhysAddr,
        systab_ptr: u64,
        systab_size: u64,
        caps: EfiCaps,
        quirks: Quirks,
        valid: bool,
        memory_map: MemoryMap,
    ) -> BootInfo {
        BootInfo { rsdp_address, systab_ptr, systab_size, caps, quirks, valid, memory_map }
    }

    /// Physical address of the ACPI RSDP (root system description pointer).
    pub fn rsdp_address(&self) -> PhysAddr {
        self.rsdp_address
    }

    /// Physical address of the (now-relocated) UEFI system table.
    pub fn systab_ptr(&self) -> u64 {
        self.systab_ptr
    }

    pub fn systab_size(&self) -> u64 {
        self.systab_size
    }

    /// `RTSPolicy` capability bits the kernel advertised at boot.
    pub fn caps(&self) -> EfiCaps {
        self.caps
    }

    /// Quirks the platform fingerprint (or the Apple firmware-vendor rule)
    /// matched.
    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// `true` iff runtime services were successfully relocated to
    /// `rts_vaddr`. If `false`, the kernel must not call any runtime
    /// service.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Post-exit, merged, blacklisted physical memory map.
    pub fn memory_map(&self) -> &MemoryMap {
        &self.memory_map
    }
}

impl fmt::Display for BootInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "RSDP address = {:#x}", self.rsdp_address)?;
        writeln!(f, "System table = {:#x} ({} bytes), valid = {}", self.systab_ptr, self.systab_size, self.valid)?;
        writeln!(f, "caps = {:?}, quirks = {:?}", self.caps, self.quirks)?;
        writeln!(f, "Physical memory map:")?;
        fmt::Display::fmt(&self.memory_map, f)
    }
}
