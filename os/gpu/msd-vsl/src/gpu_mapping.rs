use crate::address_space::AddressSpace;
use crate::buffer::MsdVslBuffer;
use gpu_addresses::{GpuAddress, GpuRange, PAGE_SIZE};
use gpu_platform::BusMapping;
use log::error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A page range of a buffer bound to `[gpu_addr, gpu_addr + length)` in one
/// address space.
///
/// Shared as `Arc<GpuMapping>` between the address space's indices and every
/// in-flight batch that references it. The address space is only referenced
/// weakly; a mapping never keeps it alive.
///
/// Dropping an installed mapping clears its page-table entries, unless the
/// address space is already gone. [`release`](Self::release) does the same
/// eagerly and hands back the bus mapping so its unpinning can be deferred
/// until the GPU has flushed its TLB.
pub struct GpuMapping {
    address_space: Weak<AddressSpace>,
    buffer: Arc<MsdVslBuffer>,
    bus_mapping: Option<Box<dyn BusMapping>>,
    gpu_addr: GpuAddress,
    page_offset: u64,
    page_count: u64,
    installed: AtomicBool,
}

impl GpuMapping {
    pub(crate) fn new(
        address_space: Weak<AddressSpace>,
        buffer: Arc<MsdVslBuffer>,
        bus_mapping: Box<dyn BusMapping>,
        gpu_addr: GpuAddress,
    ) -> Self {
        let page_offset = bus_mapping.page_offset();
        let page_count = bus_mapping.page_count();
        Self {
            address_space,
            buffer,
            bus_mapping: Some(bus_mapping),
            gpu_addr,
            page_offset,
            page_count,
            installed: AtomicBool::new(false),
        }
    }

    #[inline]
    #[must_use]
    pub const fn gpu_addr(&self) -> GpuAddress {
        self.gpu_addr
    }

    /// First buffer page covered.
    #[inline]
    #[must_use]
    pub const fn page_offset(&self) -> u64 {
        self.page_offset
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Mapped length in bytes.
    #[inline]
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.page_count * PAGE_SIZE
    }

    /// Extent of the mapping in the GPU address space.
    #[inline]
    #[must_use]
    pub const fn gpu_range(&self) -> GpuRange {
        match GpuRange::from_pages(self.gpu_addr, self.page_count) {
            Some(range) => range,
            None => GpuRange::EMPTY,
        }
    }

    #[inline]
    #[must_use]
    pub const fn buffer(&self) -> &Arc<MsdVslBuffer> {
        &self.buffer
    }

    /// Pinned pages backing the mapping; `None` only during release.
    #[must_use]
    pub fn bus_mapping(&self) -> Option<&dyn BusMapping> {
        self.bus_mapping.as_deref()
    }

    /// The address space this mapping was created for, if it is still alive.
    #[must_use]
    pub fn address_space(&self) -> Option<Arc<AddressSpace>> {
        self.address_space.upgrade()
    }

    pub(crate) fn belongs_to(&self, address_space: &AddressSpace) -> bool {
        core::ptr::eq(self.address_space.as_ptr(), address_space)
    }

    /// `true` if the buffer-relative byte range `[offset, offset + length)` is
    /// covered by this mapping.
    #[must_use]
    pub const fn contains(&self, offset: u64, length: u64) -> bool {
        let start = self.page_offset * PAGE_SIZE;
        let end = start + self.length();
        match offset.checked_add(length) {
            Some(range_end) => offset >= start && range_end <= end,
            None => false,
        }
    }

    /// GPU address of the buffer-relative `buffer_offset`, if mapped here.
    #[must_use]
    pub const fn gpu_address_of(&self, buffer_offset: u64) -> Option<GpuAddress> {
        if !self.contains(buffer_offset, 1) {
            return None;
        }
        let delta = buffer_offset - self.page_offset * PAGE_SIZE;
        Some(GpuAddress::new(self.gpu_addr.as_u64() + delta))
    }

    pub(crate) fn mark_installed(&self) {
        self.installed.store(true, Ordering::Release);
    }

    /// Clear the page-table entries now and hand the bus mapping to the caller.
    ///
    /// The pages stay pinned until the returned mapping is dropped, which the
    /// caller defers until a TLB flush has executed.
    #[must_use]
    pub fn release(mut self) -> Option<Box<dyn BusMapping>> {
        self.clear_page_table_entries();
        self.bus_mapping.take()
    }

    fn clear_page_table_entries(&self) {
        if !self.installed.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(address_space) = self.address_space.upgrade() else {
            return;
        };
        if let Err(e) = address_space.clear_pages(self.gpu_addr, self.page_count) {
            error!(
                "failed to clear {} pages at {} for buffer {}: {e}",
                self.page_count,
                self.gpu_addr,
                self.buffer.id()
            );
        }
    }
}

impl Drop for GpuMapping {
    fn drop(&mut self) {
        self.clear_page_table_entries();
    }
}

impl core::fmt::Debug for GpuMapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GpuMapping")
            .field("gpu_addr", &self.gpu_addr)
            .field("buffer", &self.buffer.id())
            .field("page_offset", &self.page_offset)
            .field("page_count", &self.page_count)
            .finish_non_exhaustive()
    }
}
