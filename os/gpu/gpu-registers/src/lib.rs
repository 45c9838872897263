//! # Typed GC7000 Registers and Command-Stream Instructions
//!
//! Register definitions for the parts of the GPU the submission core talks to
//! (front end, interrupt controller, MMU page-table-array) and encoders for the
//! front-end instruction stream (`WAIT`, `LINK`, `END`, `LOAD_STATE`).
//!
//! Every register is a `#[bitfield(u32)]` implementing [`Register`], which
//! ties it to its MMIO offset. Access goes through a [`RegisterIo`], the
//! platform's raw 32-bit register window:
//!
//! ```rust
//! # use gpu_registers::*;
//! # use gpu_registers::fetch_engine::FeCommandControl;
//! # use core::cell::Cell;
//! # struct Io(Cell<u32>);
//! # unsafe impl Sync for Io {}
//! # impl RegisterIo for Io {
//! #     fn read32(&self, _offset: u32) -> u32 { self.0.get() }
//! #     fn write32(&self, _offset: u32, value: u32) { self.0.set(value) }
//! # }
//! # let io = Io(Cell::new(0));
//! FeCommandControl::new()
//!     .with_prefetch(2)
//!     .with_enable(true)
//!     .store(&io);
//! assert_eq!(FeCommandControl::load(&io).prefetch(), 2);
//! ```
//!
//! The bit layouts are the contract between this driver and the device model
//! in `gpu-sim`; they follow the public etnaviv register names where one
//! exists.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod fetch_engine;
pub mod idle;
pub mod instructions;
pub mod irq;
pub mod mmu;

/// Raw 32-bit MMIO register window.
///
/// Implemented by the platform layer (or a device model in tests).
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// A register bound to a fixed MMIO offset.
pub trait Register: Copy + From<u32> + Into<u32> {
    /// Byte offset of the register in the MMIO window.
    const OFFSET: u32;

    #[inline]
    fn load(io: &(impl RegisterIo + ?Sized)) -> Self {
        Self::from(io.read32(Self::OFFSET))
    }

    #[inline]
    fn store(self, io: &(impl RegisterIo + ?Sized)) {
        io.write32(Self::OFFSET, self.into());
    }
}
