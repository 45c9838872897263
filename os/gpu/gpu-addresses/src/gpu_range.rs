use crate::{GpuAddress, PAGE_SIZE};
use core::fmt;

/// Half-open span of GPU virtual addresses, `[start, start + len)`.
///
/// ### Invariants
/// - `start + len` does not overflow (checked by [`GpuRange::new`]).
/// - Empty ranges (`len == 0`) never overlap anything.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct GpuRange {
    start: GpuAddress,
    len: u64,
}

impl GpuRange {
    /// The empty range at address zero.
    pub const EMPTY: Self = Self {
        start: GpuAddress::zero(),
        len: 0,
    };

    /// Returns `None` if the end of the range overflows `u64`.
    #[inline]
    #[must_use]
    pub const fn new(start: GpuAddress, len: u64) -> Option<Self> {
        if start.as_u64().checked_add(len).is_none() {
            return None;
        }
        Some(Self { start, len })
    }

    /// Range covering `page_count` whole pages starting at `start`.
    #[inline]
    #[must_use]
    pub const fn from_pages(start: GpuAddress, page_count: u64) -> Option<Self> {
        match page_count.checked_mul(PAGE_SIZE) {
            Some(len) => Self::new(start, len),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> GpuAddress {
        self.start
    }

    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> GpuAddress {
        GpuAddress::new(self.start.as_u64() + self.len)
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: GpuAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end().as_u64()
    }

    /// `true` if both ranges share at least one address.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start.as_u64() < other.end().as_u64()
            && other.start.as_u64() < self.end().as_u64()
    }
}

impl fmt::Debug for GpuRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end())
    }
}
