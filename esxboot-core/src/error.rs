//! Error kinds shared across the allocator, walker, policy, and driver.

use core::fmt;

/// Errors surfaced by `esxboot_core`.
///
/// A few variants (`VolumeCorrupted`, `DeviceError`, `UnexpectedEof`,
/// `CrcError`, `BadHeader`, `BadType`, `InconsistentData`) are never
/// constructed by this crate. They exist so collaborators further up the
/// loader (file access, image verification) can share one error type instead
/// of inventing their own.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// The allocation table is full, no gap satisfies a request, or a
    /// firmware allocation failed.
    OutOfResources,
    /// A bad insertion index, unknown allocation mode, or a zero-sized
    /// buffer that was expected to be non-null.
    InvalidParameter,
    /// No `RtsPolicy` is applicable, or the requested feature is absent.
    Unsupported,
    /// The SMBIOS table is absent, or no runtime descriptors exist.
    NotFound,
    /// Reserved for file-access collaborators; unused in this crate.
    VolumeCorrupted,
    /// Reserved for file-access collaborators; unused in this crate.
    DeviceError,
    /// Reserved for file-access collaborators; unused in this crate.
    UnexpectedEof,
    /// Reserved for image-verification collaborators; unused in this crate.
    CrcError,
    /// Reserved for image-verification collaborators; unused in this crate.
    BadHeader,
    /// Reserved for image-verification collaborators; unused in this crate.
    BadType,
    /// Reserved for image-verification collaborators; unused in this crate.
    InconsistentData,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::OutOfResources => "out of resources",
            Error::InvalidParameter => "invalid parameter",
            Error::Unsupported => "unsupported",
            Error::NotFound => "not found",
            Error::VolumeCorrupted => "volume corrupted",
            Error::DeviceError => "device error",
            Error::UnexpectedEof => "unexpected end of file",
            Error::CrcError => "CRC mismatch",
            Error::BadHeader => "bad header",
            Error::BadType => "bad type",
            Error::InconsistentData => "inconsistent data",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
impl std::error::Error for Error {}
