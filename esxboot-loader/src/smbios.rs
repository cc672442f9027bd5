//! Locates the platform's SMBIOS tables and extracts the type 0/type 1
//! strings [`esxboot_core::quirkdb`] fingerprints against.

use alloc::string::String;
use core::slice;

use esxboot_core::quirkdb::SmbiosInfo;
use uefi::prelude::*;
use uefi::Guid;

const SMBIOS_GUID: Guid = Guid::from_values(
    0xeb9d2d31,
    0x2d88,
    0x11d3,
    0x9a16,
    [0x00, 0x90, 0x27, 0x3f, 0xc1, 0x4d],
);
const SMBIOS3_GUID: Guid = Guid::from_values(
    0xf2fd1544,
    0x9794,
    0x4a2c,
    0x992e,
    [0xe5, 0xbb, 0xcf, 0x20, 0xe3, 0x94],
);

/// Fully-owned strings pulled out of the SMBIOS type 0/type 1 structures, so
/// callers don't need to keep the raw table mapped while they use them.
pub struct OwnedSmbiosInfo {
    pub manufacturer: String,
    pub product: String,
    pub bios_version: String,
    pub bios_date: String,
    pub firmware_vendor: String,
}

impl OwnedSmbiosInfo {
    pub fn as_borrowed(&self) -> SmbiosInfo {
        SmbiosInfo {
            manufacturer: &self.manufacturer,
            product: &self.product,
            bios_version: &self.bios_version,
            bios_date: &self.bios_date,
            firmware_vendor: &self.firmware_vendor,
        }
    }
}

/// Finds the SMBIOS entry point in the UEFI configuration table, walks the
/// structure table, and extracts the fields [`esxboot_core::quirkdb::lookup`]
/// needs. Returns blank strings for anything the firmware doesn't populate;
/// never panics, since a malformed or absent SMBIOS table is not fatal to
/// booting.
pub fn probe(system_table: &SystemTable<Boot>) -> OwnedSmbiosInfo {
    let firmware_vendor = cstr16_to_string(system_table.firmware_vendor());

    let entry_point = system_table
        .config_table()
        .iter()
        .find(|entry| entry.guid == SMBIOS3_GUID || entry.guid == SMBIOS_GUID)
        .map(|entry| entry.address as u64);

    let (manufacturer, product, bios_version, bios_date) = match entry_point {
        Some(addr) => parse_entry_point(addr).unwrap_or_default(),
        None => Default::default(),
    };

    OwnedSmbiosInfo { manufacturer, product, bios_version, bios_date, firmware_vendor }
}

/// Type 0 (BIOS information) and type 1 (system information) structure
/// numbers, per the SMBIOS specification.
const TYPE_BIOS_INFO: u8 = 0;
const TYPE_SYSTEM_INFO: u8 = 1;

#[repr(C, packed)]
struct StructureHeader {
    ty: u8,
    length: u8,
    handle: u16,
}

/// Returns `(manufacturer, product, bios_version, bios_date)`, using empty
/// strings for any field not found.
fn parse_entry_point(entry_point_addr: u64) -> Option<(String, String, String, String)> {
    // Both the 32-bit ("_SM_") and 64-bit ("_SM3_") entry points carry the
    // structure table's address and total length, just at different offsets.
    let is_sm3 = unsafe { slice::from_raw_parts(entry_point_addr as *const u8, 5) } == b"_SM3_";

    let (table_addr, table_len) = unsafe {
        if is_sm3 {
            let len = *((entry_point_addr + 0x0c) as *const u32);
            let addr = *((entry_point_addr + 0x10) as *const u64);
            (addr, len as usize)
        } else {
            let len = *((entry_point_addr + 0x16) as *const u16);
            let addr = *((entry_point_addr + 0x18) as *const u32) as u64;
            (addr, len as usize)
        }
    };

    let table = unsafe { slice::from_raw_parts(table_addr as *const u8, table_len) };

    let mut manufacturer = String::new();
    let mut product = String::new();
    let mut bios_version = String::new();
    let mut bios_date = String::new();

    let mut offset = 0usize;
    while offset + 4 <= table.len() {
        // Safety: `StructureHeader` is packed and these bytes came from a
        // slice we just bounds-checked.
        let header = unsafe { &*(table[offset..].as_ptr() as *const StructureHeader) };
        let formatted_len = header.length as usize;
        if offset + formatted_len > table.len() {
            break;
        }
        let strings_start = offset + formatted_len;
        let strings = read_string_set(&table[strings_start..]);

        match header.ty {
            TYPE_BIOS_INFO => {
                // offsets 0x04 (version) and 0x08 (release date) are string
                // indices into the structure's trailing string-set.
                let version_idx = table[offset + 0x04];
                let date_idx = table[offset + 0x08];
                bios_version = string_at(&strings, version_idx);
                bios_date = string_at(&strings, date_idx);
            }
            TYPE_SYSTEM_INFO => {
                let manufacturer_idx = table[offset + 0x04];
                let product_idx = table[offset + 0x05];
                manufacturer = string_at(&strings, manufacturer_idx);
                product = string_at(&strings, product_idx);
            }
            _ => {}
        }

        // A type 127 (end-of-table) marker terminates the scan.
        if header.ty == 127 {
            break;
        }

        let strings_len = strings_byte_len(&table[strings_start..]);
        offset = strings_start + strings_len;
    }

    Some((manufacturer, product, bios_version, bios_date))
}

/// Splits an SMBIOS string-set (a run of NUL-terminated strings ended by a
/// second, empty NUL terminator) into individual strings, 1-indexed as the
/// spec requires.
fn read_string_set(bytes: &[u8]) -> alloc::vec::Vec<String> {
    let mut strings = alloc::vec::Vec::new();
    let mut start = 0;
    loop {
        if start >= bytes.len() || bytes[start] == 0 {
            break;
        }
        let end = bytes[start..].iter().position(|&b| b == 0).map(|p| start + p).unwrap_or(bytes.len());
        strings.push(String::from_utf8_lossy(&bytes[start..end]).into_owned());
        start = end + 1;
    }
    strings
}

fn strings_byte_len(bytes: &[u8]) -> usize {
    if bytes.is_empty() || bytes[0] == 0 {
        return 1; // an empty string-set is still terminated by one NUL byte (double-NUL total)
    }
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == 0 && (pos + 1 >= bytes.len() || bytes[pos + 1] == 0) {
            return pos + 2;
        }
        pos += 1;
    }
    bytes.len()
}

fn cstr16_to_string(s: &uefi::CStr16) -> String {
    s.to_u16_slice().iter().map(|&c| c as u32).filter_map(char::from_u32).collect()
}

fn string_at(strings: &[String], index: u8) -> String {
    if index == 0 {
        return String::new();
    }
    strings.get(index as usize - 1).cloned().unwrap_or_default()
}
