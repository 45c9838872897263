use crate::{PAGE_SHIFT, PAGE_SIZE};
use core::fmt;
use core::ops::{Add, AddAssign};

/// GPU virtual address.
///
/// Carries the *kind* of address at the type level; it does not validate that
/// the value lies inside the GPU address space. Use
/// [`GPU_ADDRESS_SPACE_SIZE`](crate::GPU_ADDRESS_SPACE_SIZE) for that.
///
/// ### Examples
/// ```rust
/// # use gpu_addresses::*;
/// let va = GpuAddress::new(0x10_0040);
/// assert_eq!(va.page_offset(), 0x40);
/// assert_eq!((va + 0x10).as_u64(), 0x10_0050);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GpuAddress(u64);

impl GpuAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The 32-bit form the front end expects in a `LINK`, if the address fits.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn to_u32(self) -> Option<u32> {
        if self.0 > u32::MAX as u64 {
            return None;
        }
        Some(self.0 as u32)
    }

    /// Index of the page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_index(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Offset of this address within its page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for GpuAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU(0x{:010X})", self.0)
    }
}

impl fmt::Display for GpuAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:010X}", self.0)
    }
}

impl From<u64> for GpuAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<GpuAddress> for u64 {
    #[inline]
    fn from(a: GpuAddress) -> Self {
        a.as_u64()
    }
}

impl Add<u64> for GpuAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for GpuAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
