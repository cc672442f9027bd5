//! Runtime-services virtual-address layout policies.
//!
//! A policy decides where firmware runtime-service memory regions land in
//! the kernel's virtual address space, and fills in `VirtualStart` for
//! [`SetVirtualAddressMap`](https://uefi.org) accordingly. [`select_policy`]
//! picks the strictest layout the kernel and the platform's quirks both
//! tolerate.

use crate::Error;

bitflags::bitflags! {
    /// Bits the kernel advertises in `EfiInfo::caps`, one per [`RtsPolicy`]
    /// variant it is willing to accept, plus `DO_TEST` (exercise the path
    /// without trusting the result) and `OLD_AND_NEW` (tolerate a firmware
    /// that behaves as if both identity and new mappings are live at once).
    pub struct EfiCaps: u32 {
        const DO_TEST = 1 << 0;
        const SIMPLE = 1 << 1;
        const SIMPLE_GQ = 1 << 2;
        const SPARSE = 1 << 3;
        const COMPACT = 1 << 4;
        const CONTIG = 1 << 5;
        const OLD_AND_NEW = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Platform deviations discovered via [`crate::quirkdb`].
    pub struct Quirks: u32 {
        const OLD_AND_NEW = 1 << 0;
        const UNKNOWN_MEM = 1 << 1;
        const NET_DEV_DISABLE = 1 << 2;
        /// Framebuffer-related; recorded but never acted on by this crate.
        const FB_BROKEN = 1 << 3;
    }
}

/// One runtime-services memory region: a copy of the firmware-described
/// physical range plus the virtual address a policy assigns it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RtDescriptor {
    pub pa: u64,
    pub len: u64,
    pub virtual_start: u64,
}

/// Parameters of the relocation, and the channel policies read/write
/// through. `mmap` holds only the `RUNTIME`-attributed descriptors (the
/// rest of the post-exit memory map is irrelevant to policy selection).
pub struct EfiInfo<'a> {
    pub mmap: &'a mut [RtDescriptor],
    pub rts_vaddr: u64,
    pub rts_size: u64,
    pub caps: EfiCaps,
    pub quirks: Quirks,
    pub systab: u64,
    pub systab_size: u64,
    pub valid: bool,
}

impl<'a> EfiInfo<'a> {
    pub fn num_descs(&self) -> usize {
        self.mmap.len()
    }

    fn pa_bounds(&self) -> Option<(u64, u64)> {
        let mut lowest = u64::MAX;
        let mut highest_end = 0u64;
        for desc in self.mmap.iter() {
            lowest = lowest.min(desc.pa);
            highest_end = highest_end.max(desc.pa.saturating_add(desc.len));
        }
        if self.mmap.is_empty() {
            None
        } else {
            Some((lowest, highest_end))
        }
    }
}

/// Hook for installing and removing a temporary identity-mapped window,
/// used only by [`SimpleGq`]'s quirk handling.
pub trait RtsHooks {
    fn install_identity_window(&mut self, pa: u64, len: u64) -> Result<(), Error>;
    fn remove_identity_window(&mut self, pa: u64, len: u64) -> Result<(), Error>;
}

/// A virtual-layout policy for firmware runtime-services regions.
pub trait RtsPolicy {
    fn name(&self) -> &'static str;
    fn efi_caps(&self) -> EfiCaps;
    fn incompat_efi_quirks(&self) -> Quirks;

    /// `Ok(map_size)` if the policy can be used for `efi_info`, where
    /// `map_size` is the number of entries the resulting virtual map needs.
    fn supported(&self, efi_info: &EfiInfo) -> Result<usize, Error>;

    /// Populates `vmap` and rewrites `VirtualStart` in `efi_info.mmap` in
    /// lockstep (downstream code reads the originals).
    fn fill(&self, efi_info: &mut EfiInfo, vmap: &mut [RtDescriptor]) -> Result<(), Error>;

    fn pre_quirk(&self, _efi_info: &EfiInfo, _vmap: &[RtDescriptor], _hooks: &mut dyn RtsHooks) -> Result<(), Error> {
        Ok(())
    }

    fn post_quirk(&self, _efi_info: &EfiInfo, _vmap: &[RtDescriptor], _hooks: &mut dyn RtsHooks) -> Result<(), Error> {
        Ok(())
    }
}

/// Every runtime region relocated to `rts_vaddr + PA`.
#[derive(Copy, Clone)]
pub struct Simple;

impl RtsPolicy for Simple {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn efi_caps(&self) -> EfiCaps {
        EfiCaps::SIMPLE
    }

    fn incompat_efi_quirks(&self) -> Quirks {
        Quirks::empty()
    }

    fn supported(&self, efi_info: &EfiInfo) -> Result<usize, Error> {
        for desc in efi_info.mmap.iter() {
            let end = desc.pa.checked_add(desc.len).ok_or(Error::Unsupported)?;
            if end > efi_info.rts_size {
                return Err(Error::Unsupported);
            }
        }
        Ok(efi_info.mmap.len())
    }

    fn fill(&self, efi_info: &mut EfiInfo, vmap: &mut [RtDescriptor]) -> Result<(), Error> {
        fill_direct(efi_info, vmap, |desc| desc.pa)
    }
}

/// Same layout as [`Simple`], but temporarily keeps the old identity mapping
/// alive alongside the new one around `SetVirtualAddressMap`, for firmware
/// that dereferences both during the call.
#[derive(Copy, Clone)]
pub struct SimpleGq;

impl RtsPolicy for SimpleGq {
    fn name(&self) -> &'static str {
        "simple-gq"
    }

    fn efi_caps(&self) -> EfiCaps {
        EfiCaps::SIMPLE_GQ
    }

    fn incompat_efi_quirks(&self) -> Quirks {
        Quirks::empty()
    }

    fn supported(&self, efi_info: &EfiInfo) -> Result<usize, Error> {
        Simple.supported(efi_info)
    }

    fn fill(&self, efi_info: &mut EfiInfo, vmap: &mut [RtDescriptor]) -> Result<(), Error> {
        Simple.fill(efi_info, vmap)
    }

    fn pre_quirk(&self, efi_info: &EfiInfo, _vmap: &[RtDescriptor], hooks: &mut dyn RtsHooks) -> Result<(), Error> {
        if let Some((lowest, highest_end)) = efi_info.pa_bounds() {
            hooks.install_identity_window(lowest, highest_end - lowest)?;
        }
        Ok(())
    }

    fn post_quirk(&self, efi_info: &EfiInfo, _vmap: &[RtDescriptor], hooks: &mut dyn RtsHooks) -> Result<(), Error> {
        if let Some((lowest, highest_end)) = efi_info.pa_bounds() {
            hooks.remove_identity_window(lowest, highest_end - lowest)?;
        }
        Ok(())
    }
}

/// `VirtualStart = PA - lowest_rt_PA + rts_vaddr`. Relies on firmware never
/// touching non-RT physical addresses after relocation.
#[derive(Copy, Clone)]
pub struct Sparse;

impl RtsPolicy for Sparse {
    fn name(&self) -> &'static str {
        "sparse"
    }

    fn efi_caps(&self) -> EfiCaps {
        EfiCaps::SPARSE
    }

    fn incompat_efi_quirks(&self) -> Quirks {
        Quirks::UNKNOWN_MEM
    }

    fn supported(&self, efi_info: &EfiInfo) -> Result<usize, Error> {
        match efi_info.pa_bounds() {
            Some((lowest, highest_end)) if highest_end - lowest <= efi_info.rts_size => Ok(efi_info.mmap.len()),
            Some(_) => Err(Error::Unsupported),
            None => Ok(0),
        }
    }

    fn fill(&self, efi_info: &mut EfiInfo, vmap: &mut [RtDescriptor]) -> Result<(), Error> {
        let lowest = efi_info.pa_bounds().map(|(l, _)| l).unwrap_or(0);
        fill_direct(efi_info, vmap, |desc| desc.pa - lowest)
    }
}

/// Packs RT regions contiguously in virtual space, preserving order and
/// skipping physical gaps.
#[derive(Copy, Clone)]
pub struct Compact;

impl RtsPolicy for Compact {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn efi_caps(&self) -> EfiCaps {
        EfiCaps::COMPACT
    }

    fn incompat_efi_quirks(&self) -> Quirks {
        Quirks::empty()
    }

    fn supported(&self, efi_info: &EfiInfo) -> Result<usize, Error> {
        let total: u64 = efi_info.mmap.iter().map(|d| d.len).sum();
        if total <= efi_info.rts_size {
            Ok(efi_info.mmap.len())
        } else {
            Err(Error::Unsupported)
        }
    }

    fn fill(&self, efi_info: &mut EfiInfo, vmap: &mut [RtDescriptor]) -> Result<(), Error> {
        let rts_vaddr = efi_info.rts_vaddr;
        let mut cursor = rts_vaddr;
        for (desc, slot) in efi_info.mmap.iter_mut().zip(vmap.iter_mut()) {
            desc.virtual_start = cursor;
            *slot = RtDescriptor { pa: desc.pa, len: desc.len, virtual_start: cursor };
            cursor += desc.len;
        }
        Ok(())
    }
}

/// A single contiguous virtual image: like [`Sparse`], but additionally
/// requires the physical regions to already be mutually adjacent (no
/// internal gaps), the strictest layout some kernels require.
#[derive(Copy, Clone)]
pub struct Contig;

impl RtsPolicy for Contig {
    fn name(&self) -> &'static str {
        "contig"
    }

    fn efi_caps(&self) -> EfiCaps {
        EfiCaps::CONTIG
    }

    fn incompat_efi_quirks(&self) -> Quirks {
        Quirks::empty()
    }

    fn supported(&self, efi_info: &EfiInfo) -> Result<usize, Error> {
        let (lowest, highest_end) = match efi_info.pa_bounds() {
            Some(bounds) => bounds,
            None => return Ok(0),
        };
        if highest_end - lowest > efi_info.rts_size {
            return Err(Error::Unsupported);
        }
        let total: u64 = efi_info.mmap.iter().map(|d| d.len).sum();
        if total == highest_end - lowest {
            Ok(efi_info.mmap.len())
        } else {
            Err(Error::Unsupported)
        }
    }

    fn fill(&self, efi_info: &mut EfiInfo, vmap: &mut [RtDescriptor]) -> Result<(), Error> {
        Sparse.fill(efi_info, vmap)
    }
}

fn fill_direct(
    efi_info: &mut EfiInfo,
    vmap: &mut [RtDescriptor],
    mut virtual_start_for: impl FnMut(&RtDescriptor) -> u64,
) -> Result<(), Error> {
    let rts_vaddr = efi_info.rts_vaddr;
    for (desc, slot) in efi_info.mmap.iter_mut().zip(vmap.iter_mut()) {
        let vstart = rts_vaddr + virtual_start_for(desc);
        desc.virtual_start = vstart;
        *slot = RtDescriptor { pa: desc.pa, len: desc.len, virtual_start: vstart };
    }
    Ok(())
}

/// The five built-in [`RtsPolicy`] implementations, as a closed sum type so
/// [`select_policy`] can return one by value without heap allocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Policy {
    Contig,
    Compact,
    Sparse,
    SimpleGq,
    Simple,
}

impl RtsPolicy for Policy {
    fn name(&self) -> &'static str {
        match self {
            Policy::Contig => Contig.name(),
            Policy::Compact => Compact.name(),
            Policy::Sparse => Sparse.name(),
            Policy::SimpleGq => SimpleGq.name(),
            Policy::Simple => Simple.name(),
        }
    }

    fn efi_caps(&self) -> EfiCaps {
        match self {
            Policy::Contig => Contig.efi_caps(),
            Policy::Compact => Compact.efi_caps(),
            Policy::Sparse => Sparse.efi_caps(),
            Policy::SimpleGq => SimpleGq.efi_caps(),
            Policy::Simple => Simple.efi_caps(),
        }
    }

    fn incompat_efi_quirks(&self) -> Quirks {
        match self {
            Policy::Contig => Contig.incompat_efi_quirks(),
            Policy::Compact => Compact.incompat_efi_quirks(),
            Policy::Sparse => Sparse.incompat_efi_quirks(),
            Policy::SimpleGq => SimpleGq.incompat_efi_quirks(),
            Policy::Simple => Simple.incompat_efi_quirks(),
        }
    }

    fn supported(&self, efi_info: &EfiInfo) -> Result<usize, Error> {
        match self {
            Policy::Contig => Contig.supported(efi_info),
            Policy::Compact => Compact.supported(efi_info),
            Policy::Sparse => Sparse.supported(efi_info),
            Policy::SimpleGq => SimpleGq.supported(efi_info),
            Policy::Simple => Simple.supported(efi_info),
        }
    }

    fn fill(&self, efi_info: &mut EfiInfo, vmap: &mut [RtDescriptor]) -> Result<(), Error> {
        match self {
            Policy::Contig => Contig.fill(efi_info, vmap),
            Policy::Compact => Compact.fill(efi_info, vmap),
            Policy::Sparse => Sparse.fill(efi_info, vmap),
            Policy::SimpleGq => SimpleGq.fill(efi_info, vmap),
            Policy::Simple => Simple.fill(efi_info, vmap),
        }
    }

    fn pre_quirk(&self, efi_info: &EfiInfo, vmap: &[RtDescriptor], hooks: &mut dyn RtsHooks) -> Result<(), Error> {
        match self {
            Policy::SimpleGq => SimpleGq.pre_quirk(efi_info, vmap, hooks),
            _ => Ok(()),
        }
    }

    fn post_quirk(&self, efi_info: &EfiInfo, vmap: &[RtDescriptor], hooks: &mut dyn RtsHooks) -> Result<(), Error> {
        match self {
            Policy::SimpleGq => SimpleGq.post_quirk(efi_info, vmap, hooks),
            _ => Ok(()),
        }
    }
}

/// Fixed preference order: strictest layout first.
const PREFERENCE: [Policy; 5] = [Policy::Contig, Policy::Compact, Policy::Sparse, Policy::SimpleGq, Policy::Simple];

/// Picks the first policy in preference order whose `efi_caps` the kernel
/// advertises, whose `incompat_efi_quirks` don't intersect the platform's
/// quirks, and whose `supported` check passes.
pub fn select_policy(efi_info: &EfiInfo) -> Result<Policy, Error> {
    select_policy_in_order(efi_info, &PREFERENCE)
}

/// As [`select_policy`], but trying `preference` in the given order instead
/// of the built-in one — lets a platform's build-time configuration
/// reorder or drop policies without touching the selection algorithm.
pub fn select_policy_in_order(efi_info: &EfiInfo, preference: &[Policy]) -> Result<Policy, Error> {
    for policy in preference.iter() {
        if !efi_info.caps.contains(policy.efi_caps()) {
            continue;
        }
        if efi_info.quirks.intersects(policy.incompat_efi_quirks()) {
            continue;
        }
        if policy.supported(efi_info).is_err() {
            continue;
        }
        return Ok(*policy);
    }
    Err(Error::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(pa: u64, len: u64) -> RtDescriptor {
        RtDescriptor { pa, len, virtual_start: 0 }
    }

    fn info<'a>(mmap: &'a mut [RtDescriptor], caps: EfiCaps, quirks: Quirks, rts_size: u64) -> EfiInfo<'a> {
        EfiInfo {
            mmap,
            rts_vaddr: 0xffff_8000_0000_0000,
            rts_size,
            caps,
            quirks,
            systab: 0,
            systab_size: 0,
            valid: false,
        }
    }

    #[test]
    fn s6_unknown_mem_excludes_sparse_leaving_simple() {
        let mut mmap = [desc(0x1000, 0x1000)];
        let efi_info = info(&mut mmap, EfiCaps::SIMPLE | EfiCaps::SPARSE, Quirks::UNKNOWN_MEM, u64::MAX);

        let chosen = select_policy(&efi_info).unwrap();
        assert_eq!(chosen.name(), "simple");
    }

    #[test]
    fn selection_prefers_highest_ranked_applicable_policy() {
        let mut mmap = [desc(0x1000, 0x1000), desc(0x2000, 0x1000)];
        let efi_info = info(
            &mut mmap,
            EfiCaps::SIMPLE | EfiCaps::COMPACT | EfiCaps::CONTIG,
            Quirks::empty(),
            0x10000,
        );

        let chosen = select_policy(&efi_info).unwrap();
        // Regions are physically adjacent, so contig is feasible and ranks highest.
        assert_eq!(chosen.name(), "contig");
    }

    #[test]
    fn selection_is_deterministic() {
        let mut mmap = [desc(0x1000, 0x1000)];
        let efi_info = info(&mut mmap, EfiCaps::SIMPLE, Quirks::empty(), u64::MAX);

        let first = select_policy(&efi_info).unwrap().name();
        let second = select_policy(&efi_info).unwrap().name();
        assert_eq!(first, second);
    }

    #[test]
    fn no_applicable_policy_is_unsupported() {
        let mut mmap = [desc(0x1000, 0x1000)];
        let efi_info = info(&mut mmap, EfiCaps::empty(), Quirks::empty(), u64::MAX);
        assert_eq!(select_policy(&efi_info), Err(Error::Unsupported));
    }

    #[test]
    fn sparse_feasibility_matches_span_formula() {
        // span = (0x6000 - 0x1000) = 0x5000
        let mut mmap = [desc(0x1000, 0x1000), desc(0x5000, 0x1000)];
        let fits = info(&mut mmap, EfiCaps::SPARSE, Quirks::empty(), 0x5000);
        assert!(Sparse.supported(&fits).is_ok());

        let mut mmap2 = [desc(0x1000, 0x1000), desc(0x5000, 0x1000)];
        let too_small = info(&mut mmap2, EfiCaps::SPARSE, Quirks::empty(), 0x4fff);
        assert!(Sparse.supported(&too_small).is_err());
    }

    #[test]
    fn simple_fill_writes_rts_vaddr_plus_pa() {
        let mut mmap = [desc(0x2000, 0x1000)];
        let rts_vaddr = 0xffff_8000_0000_0000u64;
        let mut efi_info = info(&mut mmap, EfiCaps::SIMPLE, Quirks::empty(), u64::MAX);
        efi_info.rts_vaddr = rts_vaddr;

        let mut vmap = [desc(0, 0)];
        Simple.fill(&mut efi_info, &mut vmap).unwrap();

        assert_eq!(vmap[0].virtual_start, rts_vaddr + 0x2000);
        assert_eq!(efi_info.mmap[0].virtual_start, rts_vaddr + 0x2000);
    }

    #[test]
    fn sparse_fill_writes_rts_vaddr_plus_offset_from_lowest() {
        let mut mmap = [desc(0x2000, 0x1000), desc(0x5000, 0x1000)];
        let rts_vaddr = 0xffff_8000_0000_0000u64;
        let mut efi_info = info(&mut mmap, EfiCaps::SPARSE, Quirks::empty(), u64::MAX);
        efi_info.rts_vaddr = rts_vaddr;

        let mut vmap = [desc(0, 0), desc(0, 0)];
        Sparse.fill(&mut efi_info, &mut vmap).unwrap();

        // lowest PA is 0x2000, so offsets are 0 and 0x3000.
        assert_eq!(vmap[0].virtual_start, rts_vaddr);
        assert_eq!(vmap[1].virtual_start, rts_vaddr + 0x3000);
        assert_eq!(efi_info.mmap[0].virtual_start, rts_vaddr);
        assert_eq!(efi_info.mmap[1].virtual_start, rts_vaddr + 0x3000);
    }

    #[test]
    fn contig_fill_matches_sparse() {
        let mut mmap = [desc(0x2000, 0x1000), desc(0x5000, 0x1000)];
        let rts_vaddr = 0xffff_8000_0000_0000u64;
        let mut efi_info = info(&mut mmap, EfiCaps::CONTIG, Quirks::empty(), u64::MAX);
        efi_info.rts_vaddr = rts_vaddr;

        let mut vmap = [desc(0, 0), desc(0, 0)];
        Contig.fill(&mut efi_info, &mut vmap).unwrap();

        assert_eq!(vmap[0].virtual_start, rts_vaddr);
        assert_eq!(vmap[1].virtual_start, rts_vaddr + 0x3000);
    }

    struct RecordingHooks {
        installed: Option<(u64, u64)>,
        removed: Option<(u64, u64)>,
    }

    impl RtsHooks for RecordingHooks {
        fn install_identity_window(&mut self, pa: u64, len: u64) -> Result<(), Error> {
            self.installed = Some((pa, len));
            Ok(())
        }

        fn remove_identity_window(&mut self, pa: u64, len: u64) -> Result<(), Error> {
            self.removed = Some((pa, len));
            Ok(())
        }
    }

    #[test]
    fn simple_gq_installs_and_tears_down_identity_window() {
        let mut mmap = [desc(0x1000, 0x1000), desc(0x3000, 0x1000)];
        let efi_info = info(&mut mmap, EfiCaps::SIMPLE_GQ, Quirks::empty(), u64::MAX);
        let mut hooks = RecordingHooks { installed: None, removed: None };

        SimpleGq.pre_quirk(&efi_info, &[], &mut hooks).unwrap();
        assert_eq!(hooks.installed, Some((0x1000, 0x3000)));

        SimpleGq.post_quirk(&efi_info, &[], &mut hooks).unwrap();
        assert_eq!(hooks.removed, Some((0x1000, 0x3000)));
    }
}
