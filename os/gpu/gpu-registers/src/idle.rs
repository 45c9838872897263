use crate::Register;
use bitfield_struct::bitfield;

/// `IDLE_STATE`: one bit per GPU module, set while that module is idle.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct IdleState {
    /// Bit 0: front end (command fetch).
    pub front_end: bool,

    /// Bits 1–30: remaining pipeline modules.
    #[bits(30)]
    pub modules: u32,

    /// Bit 31: AXI low-power state, not part of the idle mask.
    pub axi_low_power: bool,
}

impl IdleState {
    /// Value of the low 31 bits when every module is idle.
    pub const ALL_IDLE: u32 = 0x7FFF_FFFF;

    #[inline]
    #[must_use]
    pub const fn is_idle(self) -> bool {
        self.into_bits() & Self::ALL_IDLE == Self::ALL_IDLE
    }
}

impl Register for IdleState {
    const OFFSET: u32 = 0x004;
}
