use crate::{PAGE_SHIFT, PAGE_SIZE};
use core::fmt;
use core::ops::Add;

/// DMA-capable bus address of a pinned buffer page.
///
/// Produced by the platform bus mapper; written into GPU page tables and the
/// page-table array. Never dereferenced by the CPU.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BusAddress(u64);

impl BusAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Page frame number (`addr >> PAGE_SHIFT`).
    #[inline]
    #[must_use]
    pub const fn frame(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Rebuild a page-aligned bus address from a frame number.
    #[inline]
    #[must_use]
    pub const fn from_frame(frame: u64) -> Self {
        Self(frame << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }
}

impl fmt::Debug for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BUS(0x{:016X})", self.0)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for BusAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for BusAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}
