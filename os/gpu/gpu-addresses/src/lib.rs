//! # GPU and Bus Address Types
//!
//! Strongly typed wrappers for the two address kinds a GPU driver juggles:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`GpuAddress`] | An address in the GPU's own MMU-translated address space. |
//! | [`BusAddress`] | A DMA address handed out by the platform bus mapper. |
//! | [`GpuRange`] | A half-open `[start, start + len)` span of GPU addresses. |
//!
//! Both address types are zero-cost `u64` newtypes so a bus address can never be
//! programmed where the hardware expects a GPU virtual address (or vice versa).
//!
//! ## Page Geometry
//!
//! The GPU MMU uses a single 4 KiB page size. [`PAGE_SIZE`] and [`PAGE_SHIFT`]
//! are shared by every crate that builds page tables or bus mappings.
//!
//! ```rust
//! # use gpu_addresses::*;
//! let va = GpuAddress::new(0x1_2345);
//! assert_eq!(va.page_index(), 0x12);
//! assert_eq!(va.page_offset(), 0x345);
//! assert_eq!(va.align_down().as_u64(), 0x1_2000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod bus_address;
mod gpu_address;
mod gpu_range;

pub use crate::bus_address::BusAddress;
pub use crate::gpu_address::GpuAddress;
pub use crate::gpu_range::GpuRange;

/// Size of a GPU MMU page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// One past the highest GPU virtual address (32-bit GPU address space).
pub const GPU_ADDRESS_SPACE_SIZE: u64 = 1 << 32;

/// Returns `true` if `value` is a multiple of [`PAGE_SIZE`].
#[inline]
#[must_use]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Byte length of `page_count` pages, or `None` on overflow.
#[inline]
#[must_use]
pub const fn pages_to_bytes(page_count: u64) -> Option<u64> {
    page_count.checked_mul(PAGE_SIZE)
}

/// Number of pages needed to cover `bytes`, rounding up.
#[inline]
#[must_use]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}
