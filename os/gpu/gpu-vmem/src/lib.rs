//! # GPU MMU Page Tables
//!
//! The GPU translates its 32-bit virtual addresses through a two-level table
//! tree per address space. All tables live in platform buffers that are
//! bus-mapped, so the MMU can walk them by DMA:
//!
//! ```text
//!  GPU VA (32 bit)
//!  ┌────────────┬────────────┬──────────────┐
//!  │ 31      22 │ 21      12 │ 11         0 │
//!  │   master   │   table    │ page offset  │
//!  └─────┬──────┴─────┬──────┴──────────────┘
//!        │            │
//!  PTA[slot] ──► master table ──► page table ──► 4 KiB page
//!   (u64 root)   1024 × u32       1024 × u32
//! ```
//!
//! - [`PageTable`]: the master table plus the page tables it references, for a
//!   single address space. [`PageTable::insert`] is all-or-nothing.
//! - [`PageTableArrays`]: the page-table array, one 64-bit root pointer per
//!   address-space *slot*. The hardware selects the active slot from the
//!   command stream.
//! - [`PageTableEntry`]: the 32-bit entry format shared by both table levels.
//!
//! The tables are not locked internally; the owning address space serializes
//! access. TLB maintenance (an `MMU_FLUSH` in the command stream) is the
//! caller's job after modifying a live table.

mod entry;
mod page_table;
mod page_table_arrays;

pub use crate::entry::{
    ENTRIES_PER_TABLE, MAX_BUS_ADDRESS, MasterIndex, PageTableEntry, TableIndex, split_indices,
};
pub use crate::page_table::PageTable;
pub use crate::page_table_arrays::{MAX_SLOTS, PageTableArrays};

use gpu_addresses::{BusAddress, GpuAddress};
use gpu_platform::PlatformError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageTableError {
    #[error("GPU address {0} is not page aligned")]
    Unaligned(GpuAddress),
    #[error("{page_count} pages at {gpu_addr} do not fit the GPU address space")]
    OutOfRange { gpu_addr: GpuAddress, page_count: u64 },
    #[error("bus address {0} cannot be stored in a page table entry")]
    InvalidBusAddress(BusAddress),
    #[error("page at {0} is already mapped")]
    AlreadyPresent(GpuAddress),
    #[error("page at {0} is not mapped")]
    NotPresent(GpuAddress),
    #[error("page table array slot {slot} out of range ({slot_count} slots)")]
    SlotOutOfRange { slot: u32, slot_count: u32 },
    #[error(transparent)]
    Platform(#[from] PlatformError),
}
