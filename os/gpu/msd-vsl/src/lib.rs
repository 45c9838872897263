//! # GC7000 Submission Core
//!
//! The hardware-independent core of a driver for a Vivante GC7000-class GPU:
//! per-client GPU address spaces, command-buffer validation, and the ring
//! buffer protocol that feeds batches to the front end.
//!
//! ## Object Graph
//!
//! ```text
//!  MsdVslDevice ──────────── owns ───► Mmu (slot pool + page-table array)
//!   │  ring buffer, events,                 │
//!   │  request queue, threads               └─► AddressSpace (one slot, PageTable)
//!   │                                               ▲        │
//!   └─ open(client) ─► MsdVslConnection ─ owns ─────┘        └─ Arc<GpuMapping> ─► MsdVslBuffer
//!                        │  (Weak → device)
//!                        └─ create_context ─► MsdVslContext ─ submit ─► dyn MappedBatch
//! ```
//!
//! Back references (connection → device, context → connection, mapping →
//! address space) are [`Weak`](std::sync::Weak), so dropping the client side
//! tears the whole tree down without cycles.
//!
//! ## What lives where
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`address_space`] | GPU VA → buffer mappings, overlap checks, page-table upkeep |
//! | [`mmu`] | Page-table-array slots shared by all address spaces |
//! | [`ringbuffer`] | Wrapping command ring with in-place instruction patching |
//! | [`command_buffer`] | Client batch layout checks and resource pinning |
//! | [`connection`] | Per-client state, deferred unmapping, notifications |
//! | [`device`] | Ring protocol, event interrupts, device and interrupt threads |
//!
//! ## Threads
//!
//! Clients submit from any thread. Batches are queued and written to the
//! ring by the device thread; completions are handled by the interrupt
//! thread. [`MsdVslDevice::process_request_queue`] and
//! [`MsdVslDevice::process_interrupt`] are public so a test (or a platform
//! without threads) can drive the device by hand.

pub mod address_space;
pub mod buffer;
pub mod command_buffer;
pub mod config;
pub mod connection;
pub mod context;
pub mod device;
pub mod error;
pub mod gpu_mapping;
pub mod mapped_batch;
pub mod mmu;
pub mod page_table_slot_allocator;
pub mod ringbuffer;

pub use crate::address_space::{AddressSpace, AddressSpaceError};
pub use crate::buffer::MsdVslBuffer;
pub use crate::command_buffer::{
    CommandBuffer, CommandBufferDescriptor, CommandBufferError, ExecResource, prefetch_for,
};
pub use crate::config::DeviceConfig;
pub use crate::connection::{
    ConnectionOwner, MsdVslConnection, Notification, NotificationCallback,
};
pub use crate::context::MsdVslContext;
pub use crate::device::{DEVICE_CLIENT_ID, DeviceError, MsdVslDevice};
pub use crate::error::{MsdError, Status};
pub use crate::gpu_mapping::GpuMapping;
pub use crate::mapped_batch::{EventBatch, MappedBatch, MappingReleaseBatch, Semaphore};
pub use crate::mmu::Mmu;
pub use crate::page_table_slot_allocator::{PageTableSlotAllocator, SlotAllocError};
pub use crate::ringbuffer::{Ringbuffer, RingbufferError};
