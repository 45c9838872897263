use crate::PageTableError;
use gpu_addresses::{BusAddress, PAGE_SIZE};
use gpu_platform::{BufferAllocator, BusMapper, BusMapping, PlatformBuffer, PlatformError};
use std::sync::Arc;

/// Size of one root pointer in the array.
const ENTRY_BYTES: u64 = 8;

/// Slots that fit the single page the array occupies.
#[allow(clippy::cast_possible_truncation)]
pub const MAX_SLOTS: u32 = (PAGE_SIZE / ENTRY_BYTES) as u32;

/// The page-table array: one 64-bit master-table pointer per address-space slot.
///
/// Slot `n` lives at byte `8 * n`, low dword first. A zero entry marks an
/// unused slot. Writes go through the buffer's own locking, so slots can be
/// assigned and cleared from any thread.
pub struct PageTableArrays {
    buffer: Arc<dyn PlatformBuffer>,
    _mapping: Box<dyn BusMapping>,
    bus: BusAddress,
    slot_count: u32,
}

impl PageTableArrays {
    /// Allocate and bus-map an array of `slot_count` empty slots.
    ///
    /// # Errors
    /// - [`PageTableError::SlotOutOfRange`] if `slot_count` is zero or above [`MAX_SLOTS`].
    /// - Allocation and bus-mapping failures.
    pub fn new(
        allocator: &dyn BufferAllocator,
        bus_mapper: &dyn BusMapper,
        slot_count: u32,
    ) -> Result<Self, PageTableError> {
        if slot_count == 0 || slot_count > MAX_SLOTS {
            return Err(PageTableError::SlotOutOfRange {
                slot: slot_count,
                slot_count: MAX_SLOTS,
            });
        }
        let buffer = allocator.allocate(PAGE_SIZE, "gpu-page-table-arrays")?;
        let mapping = bus_mapper.map_page_range_bus(&buffer, 0, 1)?;
        let &[bus] = mapping.bus_addresses() else {
            return Err(PlatformError::InvalidPageRange {
                page_offset: 0,
                page_count: 1,
                buffer_pages: buffer.size() / PAGE_SIZE,
            }
            .into());
        };
        Ok(Self {
            buffer,
            _mapping: mapping,
            bus,
            slot_count,
        })
    }

    /// Bus address programmed into `MMU_PTA_ADDRESS_LOW/HIGH`.
    #[inline]
    #[must_use]
    pub const fn bus_address(&self) -> BusAddress {
        self.bus
    }

    #[inline]
    #[must_use]
    pub const fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Point `slot` at the master table at `root`.
    ///
    /// # Errors
    /// [`PageTableError::SlotOutOfRange`] for an invalid slot.
    pub fn assign(&self, slot: u32, root: BusAddress) -> Result<(), PageTableError> {
        self.write(slot, root.as_u64())
    }

    /// Mark `slot` unused.
    ///
    /// # Errors
    /// [`PageTableError::SlotOutOfRange`] for an invalid slot.
    pub fn clear(&self, slot: u32) -> Result<(), PageTableError> {
        self.write(slot, 0)
    }

    /// Master table `slot` points at, `None` if unused.
    ///
    /// # Errors
    /// [`PageTableError::SlotOutOfRange`] for an invalid slot.
    pub fn root(&self, slot: u32) -> Result<Option<BusAddress>, PageTableError> {
        let offset = self.offset_of(slot)?;
        let low = u64::from(self.buffer.read_u32(offset)?);
        let high = u64::from(self.buffer.read_u32(offset + 4)?);
        let raw = (high << 32) | low;
        Ok((raw != 0).then_some(BusAddress::new(raw)))
    }

    fn offset_of(&self, slot: u32) -> Result<u64, PageTableError> {
        if slot >= self.slot_count {
            return Err(PageTableError::SlotOutOfRange {
                slot,
                slot_count: self.slot_count,
            });
        }
        Ok(u64::from(slot) * ENTRY_BYTES)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&self, slot: u32, value: u64) -> Result<(), PageTableError> {
        let offset = self.offset_of(slot)?;
        self.buffer.write_u32(offset, value as u32)?;
        self.buffer.write_u32(offset + 4, (value >> 32) as u32)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use gpu_platform::fake::FakeMemory;

    #[test]
    fn assign_and_clear_slots() {
        let memory = FakeMemory::new();
        let pta = PageTableArrays::new(&*memory, &*memory, 4).unwrap();
        let root = BusAddress::new(0x12_3456_7000);

        pta.assign(3, root).unwrap();
        assert_eq!(pta.root(3), Ok(Some(root)));
        assert_eq!(pta.root(0), Ok(None));
        assert_eq!(memory.read_bus_u32(pta.bus_address() + 24), Ok(0x3456_7000));
        assert_eq!(memory.read_bus_u32(pta.bus_address() + 28), Ok(0x12));

        pta.clear(3).unwrap();
        assert_eq!(pta.root(3), Ok(None));
    }

    #[test]
    fn slot_bounds() {
        let memory = FakeMemory::new();
        let pta = PageTableArrays::new(&*memory, &*memory, 4).unwrap();
        assert_eq!(
            pta.assign(4, BusAddress::new(0x1000)),
            Err(PageTableError::SlotOutOfRange { slot: 4, slot_count: 4 })
        );
        assert!(PageTableArrays::new(&*memory, &*memory, 0).is_err());
        assert!(PageTableArrays::new(&*memory, &*memory, MAX_SLOTS + 1).is_err());
    }
}
