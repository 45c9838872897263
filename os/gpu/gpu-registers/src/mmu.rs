//! MMU page-table-array registers.
//!
//! The MMU resolves GPU addresses through a *page-table array*: a table of
//! 64-bit root pointers, one per address-space slot. The array base is
//! programmed once; the active slot is selected either here or from the
//! command stream (see [`instructions::STATE_MMU_PTA_CONFIG`](crate::instructions::STATE_MMU_PTA_CONFIG)).

use crate::Register;
use bitfield_struct::bitfield;

/// `MMU_PTA_ADDRESS_LOW`: bus address of the page-table array, bits 0–31.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct MmuPageTableArrayAddressLow {
    pub address: u32,
}

impl Register for MmuPageTableArrayAddressLow {
    const OFFSET: u32 = 0x1AC;
}

/// `MMU_PTA_ADDRESS_HIGH`: bus address of the page-table array, bits 32–63.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct MmuPageTableArrayAddressHigh {
    pub address: u32,
}

impl Register for MmuPageTableArrayAddressHigh {
    const OFFSET: u32 = 0x1B0;
}

/// `MMU_PTA_CONTROL`: selects the active page-table-array slot.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct MmuPageTableArrayControl {
    #[bits(16)]
    pub slot: u16,

    #[bits(16, default = 0)]
    _reserved_16_31: u16,
}

impl Register for MmuPageTableArrayControl {
    const OFFSET: u32 = 0x1B4;
}

/// `MMU_CONTROL`: global MMU enable.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct MmuControl {
    pub enable: bool,

    #[bits(31, default = 0)]
    _reserved_1_31: u32,
}

impl Register for MmuControl {
    const OFFSET: u32 = 0x388;
}
