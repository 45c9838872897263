use bitfield_struct::bitfield;
use gpu_addresses::{BusAddress, GpuAddress, PAGE_SHIFT};

/// Entries per master table and per page table.
pub const ENTRIES_PER_TABLE: u64 = 1024;

/// Highest bus address an entry can hold (40-bit DMA).
pub const MAX_BUS_ADDRESS: u64 = (1 << 40) - 1;

/// A 32-bit GPU MMU entry, used at both table levels.
///
/// ### Bit layout
///
/// | Bits  | Field           | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `present`       | Entry is valid |
/// | 1     | `exception`     | Raise an MMU exception on access |
/// | 2     | `writable`      | GPU may write through this entry |
/// | 3     | reserved        | |
/// | 4–11  | `address_39_32` | Bus address bits 39..32 |
/// | 12–31 | `address_31_12` | Bus address bits 31..12 |
///
/// A master entry points at a page table, a page-table entry at a 4 KiB page.
/// Either way the stored address is page aligned.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct PageTableEntry {
    pub present: bool,
    pub exception: bool,
    pub writable: bool,

    #[bits(1)]
    _reserved_3: u8,

    #[bits(8)]
    address_39_32: u8,

    #[bits(20)]
    address_31_12: u32,
}

impl PageTableEntry {
    /// Non-present entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Present, writable entry referencing the page at `bus`.
    ///
    /// ### Debug assertions
    /// - `bus` is page aligned and at most [`MAX_BUS_ADDRESS`].
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn make(bus: BusAddress) -> Self {
        debug_assert!(bus.is_page_aligned());
        debug_assert!(bus.as_u64() <= MAX_BUS_ADDRESS);
        let raw = bus.as_u64();
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_address_39_32((raw >> 32) as u8)
            .with_address_31_12(((raw >> PAGE_SHIFT) & 0xF_FFFF) as u32)
    }

    /// The referenced bus address, if present.
    #[inline]
    #[must_use]
    pub const fn bus_address(self) -> Option<BusAddress> {
        if !self.present() {
            return None;
        }
        let high = (self.address_39_32() as u64) << 32;
        let low = (self.address_31_12() as u64) << PAGE_SHIFT;
        Some(BusAddress::new(high | low))
    }
}

/// Index into the master table (VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MasterIndex(u16);

/// Index into a page table (VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl MasterIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: GpuAddress) -> Self {
        Self(((va.as_u64() >> 22) & 0x3FF) as u16)
    }

    /// Byte offset of this entry inside the master table.
    #[inline]
    #[must_use]
    pub const fn byte_offset(self) -> u64 {
        self.0 as u64 * 4
    }
}

impl TableIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: GpuAddress) -> Self {
        Self(((va.as_u64() >> PAGE_SHIFT) & 0x3FF) as u16)
    }

    /// Byte offset of this entry inside its page table.
    #[inline]
    #[must_use]
    pub const fn byte_offset(self) -> u64 {
        self.0 as u64 * 4
    }
}

/// Split a GPU address into its master and page-table indices.
#[inline]
#[must_use]
pub const fn split_indices(va: GpuAddress) -> (MasterIndex, TableIndex) {
    (MasterIndex::of(va), TableIndex::of(va))
}
