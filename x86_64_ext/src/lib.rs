//! Small extensions to the `x86_64` crate that the loader and kernel both want.
#![no_std]

mod instructions;
mod paging;

pub use instructions::hlt_loop;
pub use paging::{PageExt, PageSizeExt, PhysFrameExt, PhysFrameRangeExt};
