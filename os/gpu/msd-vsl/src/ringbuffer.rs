//! # The Device Ring Buffer
//!
//! A fixed-size circular instruction log. Software appends at `tail`; the
//! front end consumes from `head`, which software learns about only when an
//! event fires and [`Ringbuffer::update_head`] moves it forward.
//!
//! ```text
//!   0                 head              tail                size
//!   ├──── free ────────┼──── occupied ────┼────── free ───────┤
//!                      └ GPU may read ────┘
//! ```
//!
//! The occupied window `[head, tail)` is measured circularly. The ring never
//! fills completely, so `head == tail` always means empty.
//!
//! [`Ringbuffer::overwrite32`] patches a dword behind `tail`, and only inside
//! the occupied window. It is how a trailing `WAIT` becomes a `LINK` while
//! the front end may be spinning on it. Every mutator takes `&mut self`; the
//! device keeps the ring behind its core lock, so holding `&mut Ringbuffer`
//! is the single-writer token.

use crate::address_space::{AddressSpace, AddressSpaceError};
use crate::buffer::MsdVslBuffer;
use crate::gpu_mapping::GpuMapping;
use gpu_addresses::{GpuAddress, bytes_to_pages};
use gpu_platform::PlatformError;
use gpu_registers::instructions::INSTRUCTION_BYTES;
use log::trace;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingbufferError {
    #[error("no room for {bytes} bytes ({used} of {size} used)")]
    Full { bytes: u32, used: u32, size: u32 },
    #[error("offset zero from tail is past the last written dword")]
    ZeroOffset,
    #[error("{bytes} bytes behind tail is outside the {used} occupied bytes")]
    OutOfWindow { bytes: u32, used: u32 },
    #[error("invalid ring size {0:#x}")]
    InvalidSize(u64),
    #[error("ring is mapped at {mapped}, not {requested}")]
    AddressMismatch {
        mapped: GpuAddress,
        requested: GpuAddress,
    },
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    AddressSpace(#[from] AddressSpaceError),
}

pub struct Ringbuffer {
    buffer: Arc<MsdVslBuffer>,
    size: u32,
    head: u32,
    tail: u32,
    gpu_addr: Option<GpuAddress>,
}

impl Ringbuffer {
    /// Use the first `size` bytes of `buffer` as an empty ring.
    ///
    /// # Errors
    /// [`RingbufferError::InvalidSize`] if `size` is zero, not a multiple of
    /// the instruction size, or larger than the buffer.
    pub fn new(buffer: Arc<MsdVslBuffer>, size: u64) -> Result<Self, RingbufferError> {
        if size == 0 || size % u64::from(INSTRUCTION_BYTES) != 0 || size > buffer.size() {
            return Err(RingbufferError::InvalidSize(size));
        }
        let size = u32::try_from(size).map_err(|_| RingbufferError::InvalidSize(size))?;
        Ok(Self {
            buffer,
            size,
            head: 0,
            tail: 0,
            gpu_addr: None,
        })
    }

    /// Map the ring into `address_space` at `gpu_addr`.
    ///
    /// The ring must sit at the same GPU address in every address space, so
    /// that the `LINK` back from a client command buffer lands in it whichever
    /// page table is active.
    ///
    /// # Errors
    /// - [`RingbufferError::AddressMismatch`] if an earlier mapping used a different address.
    /// - Mapping failures.
    pub fn map(
        &mut self,
        address_space: &Arc<AddressSpace>,
        gpu_addr: GpuAddress,
    ) -> Result<Arc<GpuMapping>, RingbufferError> {
        if let Some(mapped) = self.gpu_addr {
            if mapped != gpu_addr {
                return Err(RingbufferError::AddressMismatch {
                    mapped,
                    requested: gpu_addr,
                });
            }
        }
        let pages = bytes_to_pages(u64::from(self.size));
        let mapping = address_space.map_buffer_gpu(&self.buffer, gpu_addr, 0, pages)?;
        self.gpu_addr = Some(gpu_addr);
        Ok(mapping)
    }

    /// GPU address of offset 0, once mapped.
    #[inline]
    #[must_use]
    pub const fn gpu_address(&self) -> Option<GpuAddress> {
        self.gpu_addr
    }

    #[inline]
    #[must_use]
    pub const fn buffer(&self) -> &Arc<MsdVslBuffer> {
        &self.buffer
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn head(&self) -> u32 {
        self.head
    }

    #[inline]
    #[must_use]
    pub const fn tail(&self) -> u32 {
        self.tail
    }

    /// Bytes in `[head, tail)`.
    #[inline]
    #[must_use]
    pub const fn used_size(&self) -> u32 {
        (self.tail + self.size - self.head) % self.size
    }

    /// `true` if `bytes` more can be appended without filling the ring.
    #[inline]
    #[must_use]
    pub const fn has_space(&self, bytes: u32) -> bool {
        match self.used_size().checked_add(bytes) {
            Some(total) => total < self.size,
            None => false,
        }
    }

    /// Append one dword.
    ///
    /// # Errors
    /// [`RingbufferError::Full`] if there is no room; nothing is written.
    pub fn write_tail(&mut self, value: u32) -> Result<(), RingbufferError> {
        self.ensure_space(4)?;
        self.buffer
            .platform_buffer()
            .write_u32(u64::from(self.tail), value)?;
        self.tail = (self.tail + 4) % self.size;
        Ok(())
    }

    /// Append one two-dword instruction.
    ///
    /// # Errors
    /// [`RingbufferError::Full`] if there is no room for both dwords; nothing is written.
    pub fn write_instruction(&mut self, words: [u32; 2]) -> Result<(), RingbufferError> {
        self.ensure_space(INSTRUCTION_BYTES)?;
        let [first, second] = words;
        self.write_tail(first)?;
        self.write_tail(second)
    }

    /// Record that the front end has consumed everything before `offset`.
    ///
    /// # Errors
    /// [`RingbufferError::OutOfWindow`] unless `offset` is inside the occupied
    /// window or equal to `tail`.
    pub fn update_head(&mut self, offset: u32) -> Result<(), RingbufferError> {
        if offset % 4 != 0 || (offset != self.tail && !self.is_offset_populated(offset)) {
            return Err(RingbufferError::OutOfWindow {
                bytes: offset,
                used: self.used_size(),
            });
        }
        trace!("ring head {:#x} -> {offset:#x}", self.head);
        self.head = offset;
        Ok(())
    }

    /// Replace the dword `dwords_before_tail` dwords behind `tail`.
    ///
    /// # Errors
    /// - [`RingbufferError::ZeroOffset`] for `dwords_before_tail == 0`.
    /// - [`RingbufferError::OutOfWindow`] if the dword is not in `[head, tail)`.
    ///
    /// On error nothing is written.
    pub fn overwrite32(&mut self, dwords_before_tail: u32, value: u32) -> Result<(), RingbufferError> {
        if dwords_before_tail == 0 {
            return Err(RingbufferError::ZeroOffset);
        }
        let used = self.used_size();
        let bytes = dwords_before_tail
            .checked_mul(4)
            .filter(|&bytes| bytes <= used)
            .ok_or(RingbufferError::OutOfWindow {
                bytes: dwords_before_tail.saturating_mul(4),
                used,
            })?;
        let offset = self.subtract_offset(bytes);
        self.buffer
            .platform_buffer()
            .write_u32(u64::from(offset), value)?;
        Ok(())
    }

    /// Absolute ring offset `bytes` behind `tail`, wrapping.
    #[inline]
    #[must_use]
    pub const fn subtract_offset(&self, bytes: u32) -> u32 {
        (self.tail + self.size - bytes % self.size) % self.size
    }

    /// Make the next `bytes` of appends contiguous, skipping the end of the
    /// buffer if they would not fit before it.
    ///
    /// # Errors
    /// [`RingbufferError::Full`] if there is not enough free space, counting
    /// any skipped bytes; `tail` is unchanged.
    pub fn reserve_contiguous(&mut self, bytes: u32) -> Result<(), RingbufferError> {
        let to_end = self.size - self.tail;
        if bytes <= to_end {
            return self.ensure_space(bytes);
        }
        self.ensure_space(to_end.saturating_add(bytes))?;
        trace!("ring wraps, {to_end} bytes skipped at {:#x}", self.tail);
        self.tail = 0;
        Ok(())
    }

    /// `true` if `offset` lies in the occupied window `[head, tail)`.
    #[must_use]
    pub const fn is_offset_populated(&self, offset: u32) -> bool {
        if self.head <= self.tail {
            offset >= self.head && offset < self.tail
        } else {
            offset >= self.head || offset < self.tail
        }
    }

    /// CPU read of the dword at ring `offset`.
    ///
    /// # Errors
    /// [`PlatformError::OutOfRange`] for an offset outside the buffer.
    pub fn read32(&self, offset: u32) -> Result<u32, RingbufferError> {
        Ok(self.buffer.platform_buffer().read_u32(u64::from(offset))?)
    }

    /// Dwords between `offset` and `tail`, measured forward from `offset`.
    #[inline]
    #[must_use]
    pub const fn dwords_since(&self, offset: u32) -> u32 {
        ((self.tail + self.size - offset) % self.size) / 4
    }

    fn ensure_space(&self, bytes: u32) -> Result<(), RingbufferError> {
        if self.has_space(bytes) {
            Ok(())
        } else {
            Err(RingbufferError::Full {
                bytes,
                used: self.used_size(),
                size: self.size,
            })
        }
    }
}
