//! Interrupt acknowledge / enable registers.
//!
//! The front end raises one interrupt bit per completed `EVENT` (bits 0–29)
//! plus two error sources. Reading [`IrqAck`] returns and clears the pending
//! bits.

use crate::Register;
use bitfield_struct::bitfield;

/// Number of interrupt event slots the hardware provides.
pub const MAX_EVENTS: u32 = 30;

/// `IRQ_ACK`: pending interrupt sources (read-to-clear).
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct IrqAck {
    /// Bits 0–29: one bit per completed event id.
    #[bits(30)]
    pub events: u32,

    /// Bit 30: AXI bus error.
    pub bus_error: bool,

    /// Bit 31: MMU exception (translation fault).
    pub mmu_exception: bool,
}

impl IrqAck {
    #[inline]
    #[must_use]
    pub const fn is_event_set(self, event_id: u32) -> bool {
        event_id < MAX_EVENTS && self.events() & (1 << event_id) != 0
    }

    #[inline]
    #[must_use]
    pub const fn has_error(self) -> bool {
        self.bus_error() || self.mmu_exception()
    }
}

impl Register for IrqAck {
    const OFFSET: u32 = 0x010;
}

/// `IRQ_ENABLE`: mask of interrupt sources delivered to the host.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct IrqEnable {
    #[bits(30)]
    pub events: u32,
    pub bus_error: bool,
    pub mmu_exception: bool,
}

impl IrqEnable {
    #[inline]
    #[must_use]
    pub const fn all() -> Self {
        Self::from_bits(u32::MAX)
    }
}

impl Register for IrqEnable {
    const OFFSET: u32 = 0x014;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ack_bits() {
        let ack = IrqAck::from_bits(0x8000_0005);
        assert!(ack.is_event_set(0));
        assert!(!ack.is_event_set(1));
        assert!(ack.is_event_set(2));
        assert!(!ack.is_event_set(MAX_EVENTS));
        assert!(ack.mmu_exception());
        assert!(!ack.bus_error());
        assert!(ack.has_error());
    }
}
