//! Front-end (fetch engine) registers.
//!
//! The front end fetches instructions by DMA from a GPU address. Programming
//! [`FeCommandAddress`] and then [`FeCommandControl`] with `enable` set starts
//! it; [`FeDmaAddress`] reports where it is currently fetching.

use crate::Register;
use bitfield_struct::bitfield;

/// `FE_COMMAND_ADDRESS`: GPU address the front end starts fetching from.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct FeCommandAddress {
    pub address: u32,
}

impl Register for FeCommandAddress {
    const OFFSET: u32 = 0x654;
}

/// `FE_COMMAND_CONTROL`: prefetch length and enable.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct FeCommandControl {
    /// Bits 0–15: number of 8-byte units to prefetch from the start address.
    #[bits(16)]
    pub prefetch: u16,

    /// Bit 16: start fetching.
    pub enable: bool,

    #[bits(15, default = 0)]
    _reserved_17_31: u16,
}

impl Register for FeCommandControl {
    const OFFSET: u32 = 0x658;
}

/// `FE_DMA_ADDRESS`: address of the instruction currently being fetched.
///
/// Read-only.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct FeDmaAddress {
    pub address: u32,
}

impl Register for FeDmaAddress {
    const OFFSET: u32 = 0x664;
}
