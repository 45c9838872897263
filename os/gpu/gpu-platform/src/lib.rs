//! # Platform Contracts
//!
//! The driver core never touches hardware or the OS directly. Everything it
//! needs from the outside world is expressed as a narrow trait here:
//!
//! ```text
//! ┌──────────────────────────── PlatformDevice ────────────────────────────┐
//! │ register_io()      → RegisterIo       raw 32-bit MMIO window          │
//! │ bus_mapper()       → BusMapper        pin buffer pages for DMA        │
//! │ buffer_allocator() → BufferAllocator  driver-owned buffers            │
//! │ interrupt()        → PlatformInterrupt  wait for / re-arm the GPU IRQ │
//! └────────────────────────────────────────────────────────────────────────┘
//!          PlatformBuffer  ·  BusMapping  ·  PlatformSemaphore
//! ```
//!
//! All traits are object safe and `Send + Sync`; the core holds them as
//! `Arc<dyn …>` so a connection thread, the device thread and the interrupt
//! thread can share one platform.
//!
//! With the `fake` feature, [`fake`] provides an in-memory implementation of
//! the memory-side contracts (buffers, bus mapping, semaphores) that a device
//! model can DMA from.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::time::Duration;

use gpu_addresses::BusAddress;
pub use gpu_registers::RegisterIo;

#[cfg(feature = "fake")]
pub mod fake;

/// A CPU-accessible buffer that can be bus-mapped for the GPU.
pub trait PlatformBuffer: Send + Sync {
    /// Process-unique identifier (koid-style).
    fn id(&self) -> u64;

    /// Size in bytes; always a multiple of the page size.
    fn size(&self) -> u64;

    fn name(&self) -> &str;

    /// Read the dword at byte `offset` through the CPU mapping.
    ///
    /// # Errors
    /// [`PlatformError::OutOfRange`] if `offset + 4 > size()` or `offset` is unaligned.
    fn read_u32(&self, offset: u64) -> Result<u32, PlatformError>;

    /// Write the dword at byte `offset` through the CPU mapping.
    ///
    /// # Errors
    /// [`PlatformError::OutOfRange`] if `offset + 4 > size()` or `offset` is unaligned.
    fn write_u32(&self, offset: u64, value: u32) -> Result<(), PlatformError>;
}

/// A pinned page range of a buffer, addressable by DMA.
///
/// Dropping the mapping unpins the pages; hardware must no longer reference
/// any of [`bus_addresses`](BusMapping::bus_addresses) by then.
pub trait BusMapping: Send + Sync {
    fn page_offset(&self) -> u64;
    fn page_count(&self) -> u64;

    /// One bus address per page, `page_count()` entries.
    fn bus_addresses(&self) -> &[BusAddress];
}

pub trait BusMapper: Send + Sync {
    /// Pin `page_count` pages of `buffer` starting at `page_offset`.
    ///
    /// # Errors
    /// Fails if the range exceeds the buffer or the platform cannot pin it.
    fn map_page_range_bus(
        &self,
        buffer: &Arc<dyn PlatformBuffer>,
        page_offset: u64,
        page_count: u64,
    ) -> Result<Box<dyn BusMapping>, PlatformError>;
}

pub trait BufferAllocator: Send + Sync {
    /// Allocate a zeroed buffer of at least `size` bytes.
    ///
    /// # Errors
    /// [`PlatformError::OutOfMemory`] when the allocation cannot be satisfied.
    fn allocate(&self, size: u64, name: &str) -> Result<Arc<dyn PlatformBuffer>, PlatformError>;
}

/// Binary semaphore shared with clients.
pub trait PlatformSemaphore: Send + Sync {
    fn id(&self) -> u64;
    fn signal(&self);
    fn reset(&self);
    fn is_signaled(&self) -> bool;

    /// Block until signalled or `timeout` elapses; returns `true` if signalled.
    fn wait(&self, timeout: Duration) -> bool;
}

/// The GPU interrupt line.
pub trait PlatformInterrupt: Send + Sync {
    /// Block until the interrupt fires. Returns `false` once [`signal`](Self::signal)
    /// has been called, telling the waiter to shut down.
    fn wait(&self) -> bool;

    /// Re-arm after the interrupt has been handled.
    fn complete(&self);

    /// Wake any waiter and make subsequent waits return `false`.
    fn signal(&self);
}

pub trait PlatformDevice: Send + Sync {
    fn register_io(&self) -> Arc<dyn RegisterIo>;
    fn bus_mapper(&self) -> Arc<dyn BusMapper>;
    fn buffer_allocator(&self) -> Arc<dyn BufferAllocator>;
    fn interrupt(&self) -> Arc<dyn PlatformInterrupt>;
}

/// Full memory barrier between CPU writes the GPU may observe.
///
/// Orders a ring buffer operand write before the opcode write that makes it
/// reachable.
#[inline]
pub fn barrier() {
    fence(Ordering::SeqCst);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("access at offset {offset:#x} outside buffer of {size:#x} bytes")]
    OutOfRange { offset: u64, size: u64 },
    #[error("page range {page_offset}+{page_count} exceeds buffer of {buffer_pages} pages")]
    InvalidPageRange {
        page_offset: u64,
        page_count: u64,
        buffer_pages: u64,
    },
    #[error("bus address {0} is not mapped")]
    UnmappedBusAddress(BusAddress),
}
