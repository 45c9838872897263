use crate::address_space::{AddressSpace, AddressSpaceError};
use crate::page_table_slot_allocator::PageTableSlotAllocator;
use gpu_platform::{BufferAllocator, BusMapper};
use gpu_vmem::{PageTable, PageTableArrays, PageTableError};
use log::debug;
use std::sync::Arc;

/// Device-wide MMU state shared by every address space.
pub struct Mmu {
    bus_mapper: Arc<dyn BusMapper>,
    allocator: Arc<dyn BufferAllocator>,
    slots: PageTableSlotAllocator,
    arrays: PageTableArrays,
}

impl Mmu {
    /// Allocate the page-table array for `slot_count` address spaces.
    ///
    /// # Errors
    /// Propagates allocation and bus-mapping failures.
    pub fn new(
        allocator: Arc<dyn BufferAllocator>,
        bus_mapper: Arc<dyn BusMapper>,
        slot_count: u32,
    ) -> Result<Arc<Self>, PageTableError> {
        let arrays = PageTableArrays::new(allocator.as_ref(), bus_mapper.as_ref(), slot_count)?;
        Ok(Arc::new(Self {
            bus_mapper,
            allocator,
            slots: PageTableSlotAllocator::new(slot_count),
            arrays,
        }))
    }

    #[inline]
    #[must_use]
    pub fn bus_mapper(&self) -> &Arc<dyn BusMapper> {
        &self.bus_mapper
    }

    #[inline]
    #[must_use]
    pub const fn slot_allocator(&self) -> &PageTableSlotAllocator {
        &self.slots
    }

    #[inline]
    #[must_use]
    pub const fn page_table_arrays(&self) -> &PageTableArrays {
        &self.arrays
    }

    /// Create an empty address space in a fresh slot.
    ///
    /// # Errors
    /// - [`AddressSpaceError::Slot`] if every slot is in use.
    /// - Page-table allocation failures; the slot is returned in that case.
    pub fn create_address_space(
        self: &Arc<Self>,
        client_id: u64,
    ) -> Result<Arc<AddressSpace>, AddressSpaceError> {
        let slot = self.slots.alloc()?;
        let setup = PageTable::new(Arc::clone(&self.allocator), Arc::clone(&self.bus_mapper))
            .and_then(|page_table| {
                self.arrays.assign(slot, page_table.root_bus_address())?;
                Ok(page_table)
            });
        let page_table = match setup {
            Ok(page_table) => page_table,
            Err(e) => {
                self.slots.free(slot);
                return Err(e.into());
            }
        };

        debug!("address space {client_id} created in slot {slot}");
        Ok(Arc::new(AddressSpace::new(
            client_id,
            Arc::clone(self),
            slot,
            page_table,
        )))
    }
}
