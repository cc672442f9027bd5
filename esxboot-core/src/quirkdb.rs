//! Platform fingerprint to relocator quirk lookup.
//!
//! A small static table, scanned linearly, first match wins. Unlike
//! [`crate::policy`]'s selection algorithm (which always has a well-defined
//! winner), an empty quirk set is a perfectly normal outcome here — most
//! platforms need no adjustment at all.

use crate::policy::Quirks;

/// Sanitized SMBIOS type-0/type-1 strings consumed by [`lookup`]. Firmware
/// that doesn't populate a field reports it as an empty string, never as
/// absent, so every comparison here is a plain string equality.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SmbiosInfo<'a> {
    pub manufacturer: &'a str,
    pub product: &'a str,
    pub bios_version: &'a str,
    pub bios_date: &'a str,
    pub firmware_vendor: &'a str,
}

struct Fingerprint {
    manufacturer: &'static str,
    product: &'static str,
    bios_version: Option<&'static str>,
    bios_date: Option<&'static str>,
    quirks: Quirks,
}

/// Exact-match rows. An empty `manufacturer`/`product` is a legitimate value
/// to match against (some platforms genuinely report them blank), so rows
/// are never skipped for being "incomplete" — only `bios_version`/
/// `bios_date` are optional, since plenty of real firmware varies those
/// across revisions of an otherwise-identical platform.
static FINGERPRINTS: &[Fingerprint] = &[
    // Early UEFI class-3 firmware on this reference board reports runtime
    // descriptors whose `Attribute` field is unreliable outside what the
    // loader already scanned once at boot.
    Fingerprint {
        manufacturer: "Insyde",
        product: "VirtualBoard",
        bios_version: None,
        bios_date: None,
        quirks: Quirks::UNKNOWN_MEM,
    },
    // A handful of early dual-firmware boards advertise themselves as both
    // legacy BIOS and UEFI simultaneously in their SMBIOS strings.
    Fingerprint {
        manufacturer: "American Megatrends Inc.",
        product: "Legacy-UEFI-Combo",
        bios_version: Some("1.0"),
        bios_date: None,
        quirks: Quirks::OLD_AND_NEW,
    },
];

fn fingerprint_matches(row: &Fingerprint, info: &SmbiosInfo) -> bool {
    if row.manufacturer != info.manufacturer || row.product != info.product {
        return false;
    }
    if let Some(expected) = row.bios_version {
        if expected != info.bios_version {
            return false;
        }
    }
    if let Some(expected) = row.bios_date {
        if expected != info.bios_date {
            return false;
        }
    }
    true
}

/// Looks up `info` in [`FINGERPRINTS`] (first match wins) and independently
/// ORs in `NET_DEV_DISABLE` when the firmware vendor string is exactly
/// `"Apple"`, regardless of whether a fingerprint row also matched.
pub fn lookup(info: &SmbiosInfo) -> Quirks {
    let mut quirks = Quirks::empty();

    if let Some(row) = FINGERPRINTS.iter().find(|row| fingerprint_matches(row, info)) {
        quirks |= row.quirks;
    }

    if info.firmware_vendor == "Apple" {
        quirks |= Quirks::NET_DEV_DISABLE;
    }

    quirks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> SmbiosInfo<'static> {
        SmbiosInfo { manufacturer: "", product: "", bios_version: "", bios_date: "", firmware_vendor: "" }
    }

    #[test]
    fn unknown_platform_gets_no_quirks() {
        let info = SmbiosInfo { manufacturer: "Nobody", product: "Nothing", ..blank() };
        assert_eq!(lookup(&info), Quirks::empty());
    }

    #[test]
    fn first_row_matches_on_manufacturer_and_product_only() {
        let info = SmbiosInfo { manufacturer: "Insyde", product: "VirtualBoard", ..blank() };
        assert_eq!(lookup(&info), Quirks::UNKNOWN_MEM);
    }

    #[test]
    fn second_row_requires_exact_bios_version() {
        let matching =
            SmbiosInfo { manufacturer: "American Megatrends Inc.", product: "Legacy-UEFI-Combo", bios_version: "1.0", ..blank() };
        assert_eq!(lookup(&matching), Quirks::OLD_AND_NEW);

        let wrong_version = SmbiosInfo { bios_version: "2.0", ..matching };
        assert_eq!(lookup(&wrong_version), Quirks::empty());
    }

    #[test]
    fn apple_vendor_string_disables_net_dev_independent_of_fingerprint() {
        let info = SmbiosInfo { manufacturer: "Nobody", product: "Nothing", firmware_vendor: "Apple", ..blank() };
        assert_eq!(lookup(&info), Quirks::NET_DEV_DISABLE);
    }

    #[test]
    fn apple_quirk_combines_with_a_matching_fingerprint_row() {
        let info = SmbiosInfo { manufacturer: "Insyde", product: "VirtualBoard", firmware_vendor: "Apple", ..blank() };
        assert_eq!(lookup(&info), Quirks::UNKNOWN_MEM | Quirks::NET_DEV_DISABLE);
    }
}
