//! # GPU Address Spaces
//!
//! An [`AddressSpace`] owns one page table, one page-table-array slot, and
//! the set of live [`GpuMapping`]s in it. Two indices are kept in lockstep:
//!
//! | Index | Key | Used for |
//! |-------|-----|----------|
//! | by address | `gpu_addr` (ordered) | overlap checks, lookups by GPU address |
//! | by buffer | buffer id → set of `gpu_addr` | per-buffer removal and bulk release |
//!
//! Every entry in one index has its counterpart in the other. All operations
//! take the address space's internal lock, so mapping, unmapping and bulk
//! release may race freely between threads.
//!
//! ## Adding a mapping
//!
//! ```text
//!   new: [gpu_addr ─────── end)
//!   predecessor (last key <  gpu_addr) must end at or before gpu_addr
//!   successor   (first key >= gpu_addr) must start at or after end
//!   then: page_table.insert (all-or-nothing) → both indices
//! ```
//!
//! Removed mappings are returned to the caller and dropped outside the lock;
//! dropping the last reference clears page-table entries, which re-enters
//! the lock.

use crate::buffer::MsdVslBuffer;
use crate::gpu_mapping::GpuMapping;
use crate::mmu::Mmu;
use crate::page_table_slot_allocator::SlotAllocError;
use gpu_addresses::{BusAddress, GpuAddress, GpuRange, PAGE_SIZE};
use gpu_platform::PlatformError;
use gpu_vmem::{PageTable, PageTableError};
use log::{debug, error};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressSpaceError {
    #[error("mapping {range:?} overlaps the mapping at {existing}")]
    Overlap { range: GpuRange, existing: GpuAddress },
    #[error("no mapping of buffer {buffer_id} at {gpu_addr}")]
    NotFound { buffer_id: u64, gpu_addr: GpuAddress },
    #[error("pages {page_offset}+{page_count} are outside buffer {buffer_id}")]
    InvalidRange {
        buffer_id: u64,
        page_offset: u64,
        page_count: u64,
    },
    #[error("mapping belongs to another address space")]
    ForeignMapping,
    #[error("mapping has already been released")]
    Released,
    #[error(transparent)]
    PageTable(#[from] PageTableError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Slot(#[from] SlotAllocError),
}

struct Indices {
    page_table: PageTable,
    by_address: BTreeMap<GpuAddress, Arc<GpuMapping>>,
    by_buffer: HashMap<u64, BTreeSet<GpuAddress>>,
}

/// A GPU virtual address space.
pub struct AddressSpace {
    client_id: u64,
    mmu: Arc<Mmu>,
    slot: u32,
    indices: Mutex<Indices>,
}

impl AddressSpace {
    pub(crate) fn new(client_id: u64, mmu: Arc<Mmu>, slot: u32, page_table: PageTable) -> Self {
        Self {
            client_id,
            mmu,
            slot,
            indices: Mutex::new(Indices {
                page_table,
                by_address: BTreeMap::new(),
                by_buffer: HashMap::new(),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Page-table-array slot selecting this address space.
    #[inline]
    #[must_use]
    pub const fn page_table_array_slot(&self) -> u32 {
        self.slot
    }

    /// Bus-map `page_count` pages of `buffer` starting at `page_offset` and
    /// install them at `gpu_addr`.
    ///
    /// # Errors
    /// - [`AddressSpaceError::InvalidRange`] if the pages are not inside the buffer.
    /// - Any [`add_mapping`](Self::add_mapping) failure; the bus mapping is
    ///   released again in that case.
    pub fn map_buffer_gpu(
        self: &Arc<Self>,
        buffer: &Arc<MsdVslBuffer>,
        gpu_addr: GpuAddress,
        page_offset: u64,
        page_count: u64,
    ) -> Result<Arc<GpuMapping>, AddressSpaceError> {
        let buffer_pages = buffer.size() / PAGE_SIZE;
        if page_count == 0
            || page_offset
                .checked_add(page_count)
                .is_none_or(|end| end > buffer_pages)
        {
            return Err(AddressSpaceError::InvalidRange {
                buffer_id: buffer.id(),
                page_offset,
                page_count,
            });
        }

        let bus_mapping = self.mmu.bus_mapper().map_page_range_bus(
            buffer.platform_buffer(),
            page_offset,
            page_count,
        )?;
        let mapping = Arc::new(GpuMapping::new(
            Arc::downgrade(self),
            Arc::clone(buffer),
            bus_mapping,
            gpu_addr,
        ));
        self.add_mapping(&mapping)?;
        Ok(mapping)
    }

    /// Install `mapping` into the page table and both indices.
    ///
    /// # Errors
    /// - [`AddressSpaceError::Overlap`] if the range intersects a live mapping.
    /// - [`AddressSpaceError::ForeignMapping`] if `mapping` was made for another address space.
    /// - Page-table failures.
    ///
    /// On error nothing has changed.
    pub fn add_mapping(&self, mapping: &Arc<GpuMapping>) -> Result<(), AddressSpaceError> {
        if !mapping.belongs_to(self) {
            return Err(AddressSpaceError::ForeignMapping);
        }
        let bus_mapping = mapping.bus_mapping().ok_or(AddressSpaceError::Released)?;
        let range = mapping.gpu_range();

        let mut indices = self.indices.lock();
        if let Some((&existing, _)) = indices.by_address.range(range.start()..).next() {
            if existing < range.end() {
                return Err(AddressSpaceError::Overlap { range, existing });
            }
        }
        if let Some((&existing, prev)) = indices.by_address.range(..range.start()).next_back() {
            if prev.gpu_range().end() > range.start() {
                return Err(AddressSpaceError::Overlap { range, existing });
            }
        }

        indices
            .page_table
            .insert(range.start(), bus_mapping.bus_addresses())?;
        mapping.mark_installed();

        indices
            .by_address
            .insert(range.start(), Arc::clone(mapping));
        indices
            .by_buffer
            .entry(mapping.buffer().id())
            .or_default()
            .insert(range.start());

        debug!(
            "address space {}: mapped buffer {} at {range:?}",
            self.client_id,
            mapping.buffer().id()
        );
        Ok(())
    }

    /// Remove the mapping of `buffer` at `gpu_addr` from both indices.
    ///
    /// The page-table entries stay until the returned mapping is released or
    /// dropped.
    ///
    /// # Errors
    /// [`AddressSpaceError::NotFound`] if `buffer` has no mapping at `gpu_addr`.
    pub fn remove_mapping(
        &self,
        buffer: &MsdVslBuffer,
        gpu_addr: GpuAddress,
    ) -> Result<Arc<GpuMapping>, AddressSpaceError> {
        let not_found = AddressSpaceError::NotFound {
            buffer_id: buffer.id(),
            gpu_addr,
        };

        let mut indices = self.indices.lock();
        let addresses = indices.by_buffer.get_mut(&buffer.id()).ok_or(not_found)?;
        if !addresses.remove(&gpu_addr) {
            return Err(not_found);
        }
        if addresses.is_empty() {
            indices.by_buffer.remove(&buffer.id());
        }
        indices.by_address.remove(&gpu_addr).ok_or(not_found)
    }

    /// Remove every mapping of `buffer`; the number removed is the length of
    /// the returned list.
    pub fn release_buffer(&self, buffer: &MsdVslBuffer) -> Vec<Arc<GpuMapping>> {
        let mut indices = self.indices.lock();
        let Some(addresses) = indices.by_buffer.remove(&buffer.id()) else {
            return Vec::new();
        };
        addresses
            .into_iter()
            .filter_map(|gpu_addr| indices.by_address.remove(&gpu_addr))
            .collect()
    }

    /// A mapping of `buffer` covering the buffer-relative range `[offset, offset + length)`.
    #[must_use]
    pub fn find_mapping(
        &self,
        buffer: &MsdVslBuffer,
        offset: u64,
        length: u64,
    ) -> Option<Arc<GpuMapping>> {
        let indices = self.indices.lock();
        indices
            .by_buffer
            .get(&buffer.id())?
            .iter()
            .filter_map(|gpu_addr| indices.by_address.get(gpu_addr))
            .find(|mapping| mapping.contains(offset, length))
            .cloned()
    }

    /// The mapping whose range contains `gpu_addr`.
    #[must_use]
    pub fn mapping_at(&self, gpu_addr: GpuAddress) -> Option<Arc<GpuMapping>> {
        let indices = self.indices.lock();
        let (_, mapping) = indices.by_address.range(..=gpu_addr).next_back()?;
        mapping
            .gpu_range()
            .contains(gpu_addr)
            .then(|| Arc::clone(mapping))
    }

    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.indices.lock().by_address.len()
    }

    /// Bus address `gpu_addr` currently translates to.
    #[must_use]
    pub fn translate(&self, gpu_addr: GpuAddress) -> Option<BusAddress> {
        self.indices.lock().page_table.translate(gpu_addr)
    }

    pub(crate) fn root_bus_address(&self) -> BusAddress {
        self.indices.lock().page_table.root_bus_address()
    }

    pub(crate) fn clear_pages(
        &self,
        gpu_addr: GpuAddress,
        page_count: u64,
    ) -> Result<(), PageTableError> {
        self.indices.lock().page_table.clear(gpu_addr, page_count)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if let Err(e) = self.mmu.page_table_arrays().clear(self.slot) {
            error!("failed to clear page table array slot {}: {e}", self.slot);
        }
        self.mmu.slot_allocator().free(self.slot);
        debug!(
            "address space {} released slot {}",
            self.client_id, self.slot
        );
    }
}
