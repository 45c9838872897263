//! In-memory platform for tests and the device model.
//!
//! [`FakeMemory`] is both the [`BufferAllocator`](crate::BufferAllocator) and
//! the [`BusMapper`](crate::BusMapper). Every bus mapping hands out fresh bus
//! frames and records which buffer page backs each one, so a device model can
//! resolve DMA reads through [`FakeMemory::read_bus_u32`]. Dropping a mapping
//! removes its frames: DMA through a released mapping fails, which is how the
//! tests observe premature unmapping.

mod memory;
mod semaphore;

pub use memory::{FakeBuffer, FakeBusMapping, FakeMemory};
pub use semaphore::FakeSemaphore;
