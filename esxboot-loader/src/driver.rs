//! The `ExitBootServicesDriver`: everything that happens around
//! `ExitBootServices`/`SetVirtualAddressMap` to relocate firmware runtime
//! services out from under the identity map and into the kernel's own
//! virtual address window.
//!
//! Phase 1 (steps 1-7) runs with boot services still alive, except for the
//! `exit_boot_services` call itself. Phase 2 (steps 8-12) runs once the
//! firmware has handed back a [`SystemTable<Runtime>`] and a fresh memory
//! map, using an [`esxboot_core::alloc_table::RuntimeAllocator`] seeded from
//! it.

use alloc::vec;
use alloc::vec::Vec;
use core::mem;

use esxboot_core::alloc_table::{AllocMode, RuntimeAllocator};
use esxboot_core::memory_map::{MemoryMap, MemoryMapEntry, MemoryType as CoreMemoryType, MAX_ENTRIES};
use esxboot_core::page_table::RawTable;
use esxboot_core::policy::{select_policy_in_order, EfiCaps, EfiInfo, Quirks, RtDescriptor, RtsHooks, RtsPolicy};
use esxboot_core::quirkdb;
use esxboot_core::relocator::{AllocatorFrameSource, FrameSource, PTRelocator, PhysMemory, RawAccess};
use esxboot_core::Error as CoreError;
use esxboot_config::Config;
use log::{info, warn};
use uefi::prelude::*;
use uefi::table::boot::{AllocateType, MemoryAttribute, MemoryType, SearchType};
use uefi::table::Runtime;
use uefi::{Guid, Handle};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{FrameAllocator, PageSize, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::smbios;

/// Physical-address bits of a canonical x86-64 page table entry (bits
/// 12..=51; bit 63 is NX and is masked out separately by the walker).
const PA_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Everything the kernel needs once relocation has finished (or given up).
pub struct RelocationResult {
    pub runtime_table: SystemTable<Runtime>,
    pub boot_info_memory_map: MemoryMap,
    pub caps: EfiCaps,
    pub quirks: Quirks,
    pub valid: bool,
    pub allocator: RuntimeAllocator,
    /// Physical address of the (now-relocated) system table header.
    pub systab_ptr: u64,
    pub systab_size: u64,
    /// Runtime-services descriptors with `virtual_start` filled in by the
    /// chosen policy (empty if no policy applied).
    pub rt_vmap: Vec<RtDescriptor>,
}

/// Reads physical memory through an identity mapping. Before
/// `ExitBootServices`, UEFI guarantees physical memory is identity-mapped,
/// so a page-table physical address doubles as a valid pointer both before
/// and for some time after the call.
struct IdentityAccess;

impl RawAccess for IdentityAccess {
    fn read_table(&self, pa: u64) -> RawTable {
        unsafe { *(pa as *const RawTable) }
    }

    fn write_table(&mut self, pa: u64, table: &RawTable) {
        unsafe { *(pa as *mut RawTable) = *table };
    }
}

/// Phase 1's [`FrameSource`]: boot-services pages allocated up front, whose
/// count came from [`PTRelocator::measure`].
struct FirmwareFrameSource<'a> {
    boot_services: &'a BootServices,
}

impl<'a> FrameSource for FirmwareFrameSource<'a> {
    fn alloc_frame(&mut self) -> Result<u64, CoreError> {
        self.boot_services
            .allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, 1)
            .log_warning()
            .map_err(|_| CoreError::OutOfResources)
    }
}

fn current_pml4_pa() -> u64 {
    Cr3::read().0.start_address().as_u64()
}

fn switch_to(root_pa: u64) {
    unsafe { Cr3::write(PhysFrame::containing_address(PhysAddr::new(root_pa)), Cr3Flags::empty()) };
}

/// Reads the raw firmware-table pointer out of a `SystemTable<View>`.
///
/// `uefi-services` only exposes the typed, method-based view of the table;
/// relocation needs the bare pointer itself (to recompute the header's
/// CRC-32 and to hand it to the kernel as `systab_ptr`). The wrapper's only
/// field is that pointer, so reading the first eight bytes of the value
/// recovers it without needing an API the crate doesn't provide.
unsafe fn raw_table_addr<View>(table: &SystemTable<View>) -> u64 {
    core::ptr::read_unaligned(table as *const SystemTable<View> as *const u64)
}

/// Runs steps 1-12 of the relocation dance. Step 13 (jumping into the
/// kernel) is the caller's job, since only it knows the kernel's entry
/// point and stack.
#[allow(clippy::too_many_arguments)]
pub fn relocate(
    image_handle: Handle,
    system_table: SystemTable<Boot>,
    caps: EfiCaps,
    rts_vaddr: u64,
    rts_size: u64,
    reservations: &[(u64, u64)],
) -> RelocationResult {
    // Step 1: fingerprint the platform and apply the quirk database.
    let smbios_info = smbios::probe(&system_table);
    let quirks = quirkdb::lookup(&smbios_info.as_borrowed());
    info!("Platform quirks: {:?}", quirks);

    // Step 2: disable network controllers on platforms known to misbehave
    // during relocation otherwise.
    if quirks.contains(Quirks::NET_DEV_DISABLE) {
        disconnect_network_controllers(system_table.boot_services());
    }

    // Step 3: sanitize the active page tables to canonical 4-level form.
    // The loader never installs anything but that shape itself, so the
    // currently active PML4 is already canonical; steps 4 and 7's walker is
    // what actually normalizes attributes and drops non-identity garbage.
    let root_pa = current_pml4_pa();

    // Step 4: measure the walk, then ask firmware for that many scratch
    // frames before tearing anything down.
    let boot_services = system_table.boot_services();
    let always_ram = |_pa: u64| true; // firmware's own tables only ever point at RAM pre-exit
    let never_logged = |_va: u64| false;

    let mut scratch_mem = PhysMemory { access: IdentityAccess, frames: FirmwareFrameSource { boot_services } };
    let table_count = PTRelocator::measure(&scratch_mem, root_pa, PA_MASK, &always_ram);
    info!("Phase 1 page table copy needs {} scratch frames", table_count);

    // Step 5: exit boot services and take ownership of the runtime table.
    let (runtime_table, raw_entries, entry_count) = exit_boot_services_and_map(image_handle, system_table);

    // Step 6: null the firmware's console/service handles out of the system
    // table header and recompute its CRC-32, so nothing downstream
    // accidentally calls back into a protocol that no longer exists.
    unsafe { sanitize_system_table_header(&runtime_table) };

    // Step 7: phase-1 copy into the firmware-allocated scratch, then switch
    // to it immediately so the loader survives even if firmware marks its
    // own tables read-only post-exit.
    let new_root = PTRelocator::copy(&mut scratch_mem, root_pa, PA_MASK, &always_ram, &never_logged)
        .unwrap_or_else(|e| fatal_driver_error("phase-1 page table copy", e));
    switch_to(new_root);

    // Step 8: merge the post-exit memory map, sanity-check it, and seed a
    // fresh allocator with everything that isn't free RAM blacklisted out.
    let mut raw_entries = raw_entries;
    let merged = MemoryMap::merge(&mut raw_entries[..entry_count]);
    match merged.sanity_check() {
        Ok(true) => {}
        Ok(false) => warn!("post-exit memory map contains overlapping entries"),
        Err(e) => warn!("post-exit memory map failed its sort invariant: {}", e),
    }

    let mut allocator = RuntimeAllocator::new();
    merged.to_blacklist(&mut allocator).unwrap_or_else(|e| fatal_driver_error("memory map blacklist", e));

    // Step 9: reserve the boot image's own fixed-address regions so the
    // phase-2 page table copy and the policy's virtual map never collide
    // with them.
    for &(base, len) in reservations {
        let mut addr = base;
        if let Err(e) = allocator.alloc(&mut addr, len, 1, AllocMode::Force) {
            warn!("could not reserve {:#x}-{:#x}: {}", base, base + len, e);
        }
    }

    // Step 10: pull the RUNTIME-attributed descriptors out of the merged
    // map, select a policy, and allocate room for its virtual map.
    let mut rt_descriptors = runtime_descriptors(&merged);
    let num_descs = rt_descriptors.len();
    let systab_addr = unsafe { raw_table_addr(&runtime_table) };

    let mut efi_info = EfiInfo {
        mmap: &mut rt_descriptors,
        rts_vaddr,
        rts_size,
        caps,
        quirks,
        systab: systab_addr,
        systab_size: mem::size_of::<RawTableHeader>() as u64,
        valid: false,
    };

    let chosen = select_policy_in_order(&efi_info, Config::rts_policy_preference());
    let valid = match chosen {
        Ok(policy) => {
            let map_size = policy.supported(&efi_info).unwrap_or(num_descs);
            finish_relocation(&mut allocator, &mut efi_info, policy, map_size, new_root, &merged)
        }
        Err(e) => {
            warn!("no runtime-services layout policy applies: {}", e);
            false
        }
    };

    RelocationResult {
        runtime_table,
        boot_info_memory_map: merged,
        caps,
        quirks,
        valid,
        allocator,
        systab_ptr: systab_addr,
        systab_size: efi_info.systab_size,
        rt_vmap: rt_descriptors,
    }
}

/// Steps 10 (continued)-12: allocate the virtual map, run the phase-2 page
/// table copy, fill the map, and call `SetVirtualAddressMap`.
fn finish_relocation(
    allocator: &mut RuntimeAllocator,
    efi_info: &mut EfiInfo,
    policy: esxboot_core::policy::Policy,
    map_size: usize,
    phase1_root: u64,
    merged: &MemoryMap,
) -> bool {
    let never_logged = |_va: u64| false;
    let is_ram_post_exit = |pa: u64| {
        merged.iter().any(|e| {
            matches!(e.ty, CoreMemoryType::Available | CoreMemoryType::Bootloader)
                && pa >= e.base
                && pa < e.base.saturating_add(e.len)
        })
    };

    let vmap_bytes = (map_size * mem::size_of::<RtDescriptor>()) as u64;
    let mut vmap_addr = 0u64;
    if vmap_bytes != 0 && allocator.alloc(&mut vmap_addr, vmap_bytes, 8, AllocMode::Any).is_err() {
        warn!("could not reserve virtual map storage");
        return false;
    }

    let mut vmap_storage: Vec<RtDescriptor> = vec![RtDescriptor { pa: 0, len: 0, virtual_start: 0 }; map_size];

    let mut alloc_mem =
        PhysMemory { access: IdentityAccess, frames: AllocatorFrameSource::new(allocator, 0x1000) };
    let new_root = match PTRelocator::copy(&mut alloc_mem, phase1_root, PA_MASK, &is_ram_post_exit, &never_logged) {
        Ok(root) => root,
        Err(e) => {
            warn!("phase-2 page table copy failed: {}", e);
            return false;
        }
    };
    switch_to(new_root);

    if policy.fill(efi_info, &mut vmap_storage).is_err() {
        warn!("{} policy could not fill its virtual map", policy.name());
        return false;
    }

    let mut hooks = NoopHooks;
    let _ = policy.pre_quirk(efi_info, &vmap_storage, &mut hooks);
    let ok = call_set_virtual_address_map(efi_info);
    let _ = policy.post_quirk(efi_info, &vmap_storage, &mut hooks);
    ok
}

fn runtime_descriptors(map: &MemoryMap) -> Vec<RtDescriptor> {
    map.iter()
        .filter(|e| matches!(e.ty, CoreMemoryType::RuntimeCode | CoreMemoryType::RuntimeData))
        .map(|e| RtDescriptor { pa: e.base, len: e.len, virtual_start: 0 })
        .collect()
}

/// No-op [`RtsHooks`]. Only [`esxboot_core::policy::SimpleGq`] ever calls
/// these, and this loader's configured preference order never selects it
/// unless an earlier, stricter policy is unsupported, so there's nothing
/// for the hooks to do under the default configuration.
struct NoopHooks;

impl RtsHooks for NoopHooks {
    fn install_identity_window(&mut self, _pa: u64, _len: u64) -> Result<(), CoreError> {
        Ok(())
    }

    fn remove_identity_window(&mut self, _pa: u64, _len: u64) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Builds the firmware-format descriptor array `EFI_SET_VIRTUAL_ADDRESS_MAP`
/// expects and calls it through the now-relocated runtime services.
fn call_set_virtual_address_map(efi_info: &EfiInfo) -> bool {
    let mut descriptors: Vec<uefi::table::boot::MemoryDescriptor> = efi_info
        .mmap
        .iter()
        .map(|d| uefi::table::boot::MemoryDescriptor {
            ty: MemoryType::RUNTIME_SERVICES_DATA,
            padding: 0,
            phys_start: d.pa,
            virt_start: d.virtual_start,
            page_count: d.len / 4096,
            att: MemoryAttribute::RUNTIME,
        })
        .collect();

    // Safety: the caller has already switched to the phase-2 page tables,
    // which map every descriptor above identically to its physical address,
    // satisfying SetVirtualAddressMap's requirement that the call itself
    // still run under the old mapping.
    let result = unsafe { call_set_virtual_address_map_raw(efi_info.systab, &mut descriptors) };
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("SetVirtualAddressMap failed: {}", e);
            false
        }
    }
}

/// Raw `EFI_RUNTIME_SERVICES.SetVirtualAddressMap` call. `systab_addr` is
/// the (still physically-addressed) system table; `RuntimeServices` sits at
/// a fixed offset from its header (mirroring [`RawSystemTableHeader`]).
unsafe fn call_set_virtual_address_map_raw(
    systab_addr: u64,
    descriptors: &mut [uefi::table::boot::MemoryDescriptor],
) -> Result<(), CoreError> {
    let header = &*(systab_addr as *const RawSystemTableHeader);
    if header.runtime_services == 0 {
        return Err(CoreError::NotFound);
    }

    type SetVirtualAddressMapFn = unsafe extern "efiapi" fn(
        map_size: usize,
        descriptor_size: usize,
        descriptor_version: u32,
        virtual_map: *mut uefi::table::boot::MemoryDescriptor,
    ) -> usize;

    let rtservices = header.runtime_services as *const RawRuntimeServicesHeader;
    let set_virtual_address_map: SetVirtualAddressMapFn = mem::transmute((*rtservices).set_virtual_address_map);

    let map_size = descriptors.len() * mem::size_of::<uefi::table::boot::MemoryDescriptor>();
    let status = set_virtual_address_map(
        map_size,
        mem::size_of::<uefi::table::boot::MemoryDescriptor>(),
        1,
        descriptors.as_mut_ptr(),
    );

    if status == 0 {
        Ok(())
    } else {
        Err(CoreError::InvalidParameter)
    }
}

/// The leading fields of `EFI_RUNTIME_SERVICES`, per the UEFI specification:
/// a table header followed by `GetTime`/`SetTime`/`GetWakeupTime`/
/// `SetWakeupTime`, then `SetVirtualAddressMap` as the fifth function
/// pointer.
#[repr(C)]
struct RawRuntimeServicesHeader {
    header: RawTableHeader,
    get_time: u64,
    set_time: u64,
    get_wakeup_time: u64,
    set_wakeup_time: u64,
    set_virtual_address_map: u64,
}

/// Locates and disconnects every handle exposing `EFI_SIMPLE_NETWORK_PROTOCOL`,
/// per the `NET_DEV_DISABLE` quirk.
fn disconnect_network_controllers(boot_services: &BootServices) {
    const SIMPLE_NETWORK_PROTOCOL_GUID: Guid = Guid::from_values(
        0xa19832b9,
        0xac25,
        0x11d3,
        0x9a2d,
        [0x00, 0x90, 0x27, 0x3f, 0xc1, 0x4d],
    );

    let handles = match boot_services.locate_handle_buffer(SearchType::ByProtocol(&SIMPLE_NETWORK_PROTOCOL_GUID)) {
        Ok(completion) => completion.log_warning(),
        Err(_) => return,
    };

    for &handle in handles.iter() {
        if let Err(e) = boot_services.disconnect_controller(handle, None, None) {
            warn!("could not disconnect network controller: {:?}", e.status());
        }
    }
}

/// Exits UEFI boot services and converts the returned memory map into
/// [`MemoryMapEntry`] form.
///
/// The `GetMemoryMap`/`ExitBootServices(map_key)` retry-on-`INVALID_PARAMETER`
/// dance (the map key goes stale if anything allocates between the two
/// calls) happens inside `uefi::table::SystemTable::exit_boot_services`
/// itself: it consumes `system_table` by value and only ever gives back a
/// `SystemTable<Runtime>` on success, which rules out retrying from out here
/// with the same table. Any error it does return is therefore one the
/// internal retry already gave up on, so it's fatal.
fn exit_boot_services_and_map(
    image_handle: Handle,
    system_table: SystemTable<Boot>,
) -> (SystemTable<Runtime>, [MemoryMapEntry; MAX_ENTRIES], usize) {
    // Padding in case the memory map grows between sizing the buffer and the
    // call itself.
    let mut buf = vec![0u8; system_table.boot_services().memory_map_size() + 512];

    let (status, (runtime_table, mmap_iter)) = match system_table.exit_boot_services(image_handle, &mut buf) {
        Ok(completion) => completion.split(),
        Err(e) => {
            log::error!("exit_boot_services failed: {:?}", e.status());
            x86_64_ext::hlt_loop()
        }
    };
    if !status.is_success() {
        warn!("exit_boot_services returned {:?}", status);
    }

    let mut entries = [MemoryMapEntry::new(0, 0, CoreMemoryType::Reserved, 0); MAX_ENTRIES];
    let mut count = 0;
    for desc in mmap_iter {
        if count >= entries.len() {
            break;
        }
        entries[count] = MemoryMapEntry::new(
            desc.phys_start,
            desc.page_count * 4096,
            core_memory_type(desc.ty, desc.att),
            desc.att.bits() as u64,
        );
        count += 1;
    }

    // mem::forget: the buffer was allocated through the boot-services pool
    // allocator, which no longer exists to free it.
    mem::forget(buf);
    (runtime_table, entries, count)
}

fn core_memory_type(ty: MemoryType, att: MemoryAttribute) -> CoreMemoryType {
    if att.contains(MemoryAttribute::RUNTIME) {
        return match ty {
            MemoryType::RUNTIME_SERVICES_DATA => CoreMemoryType::RuntimeData,
            _ => CoreMemoryType::RuntimeCode,
        };
    }

    match ty {
        MemoryType::CONVENTIONAL
        | MemoryType::LOADER_CODE
        | MemoryType::LOADER_DATA
        | MemoryType::BOOT_SERVICES_CODE
        | MemoryType::BOOT_SERVICES_DATA => CoreMemoryType::Available,
        crate::memory_map::KERNEL_IMAGE | crate::memory_map::KERNEL_DATA | crate::memory_map::KERNEL_RECLAIMABLE => {
            CoreMemoryType::Bootloader
        }
        MemoryType::ACPI_RECLAIM => CoreMemoryType::AcpiReclaim,
        MemoryType::ACPI_NON_VOLATILE => CoreMemoryType::AcpiNvs,
        MemoryType::MMIO | MemoryType::MMIO_PORT_SPACE => CoreMemoryType::Mmio,
        MemoryType::PERSISTENT_MEMORY => CoreMemoryType::Persistent,
        MemoryType::UNUSABLE => CoreMemoryType::Unusable,
        _ => CoreMemoryType::Reserved,
    }
}

/// Step 6: strip the firmware's own console/service handles out of the
/// system table header (they're dangling once boot services are gone) and
/// recompute the header's CRC-32 so anything that still validates it
/// doesn't reject the table.
unsafe fn sanitize_system_table_header(runtime_table: &SystemTable<Runtime>) {
    let addr = raw_table_addr(runtime_table);
    let raw = addr as *mut RawSystemTableHeader;

    (*raw).console_in_handle = 0;
    (*raw).con_in = 0;
    (*raw).console_out_handle = 0;
    (*raw).con_out = 0;
    (*raw).standard_error_handle = 0;
    (*raw).std_err = 0;
    (*raw).boot_services = 0;

    (*raw).header.crc32 = 0;
    let bytes = core::slice::from_raw_parts(raw as *const u8, (*raw).header.header_size as usize);
    (*raw).header.crc32 = crc32fast::hash(bytes);
}

/// Mirrors the layout of `EFI_SYSTEM_TABLE`'s fixed-offset fields, per the
/// UEFI specification. `uefi-services` doesn't expose mutable access to
/// these, since nothing is meant to touch them after `ExitBootServices`
/// under normal operation — relocation is the one exception.
#[repr(C)]
struct RawSystemTableHeader {
    header: RawTableHeader,
    firmware_vendor: u64,
    firmware_revision: u32,
    _pad: u32,
    console_in_handle: u64,
    con_in: u64,
    console_out_handle: u64,
    con_out: u64,
    standard_error_handle: u64,
    std_err: u64,
    runtime_services: u64,
    boot_services: u64,
}

#[repr(C)]
struct RawTableHeader {
    signature: u64,
    revision: u32,
    header_size: u32,
    crc32: u32,
    reserved: u32,
}

fn fatal_driver_error(what: &str, e: CoreError) -> ! {
    log::error!("{} failed: {}", what, e);
    x86_64_ext::hlt_loop()
}

/// Adapts a [`RuntimeAllocator`] to `x86_64`'s [`FrameAllocator`] trait, for
/// extending the kernel's own page table with the relocated runtime-services
/// window after boot services (and the firmware's own pool allocator) are
/// gone.
pub struct RuntimeFrameAllocator<'a>(pub &'a mut RuntimeAllocator);

unsafe impl<'a> FrameAllocator<Size4KiB> for RuntimeFrameAllocator<'a> {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let mut addr = 0u64;
        self.0.alloc(&mut addr, Size4KiB::SIZE, Size4KiB::SIZE, AllocMode::Any).ok()?;
        PhysFrame::from_start_address(PhysAddr::new(addr)).ok()
    }
}
