use crate::entry::{ENTRIES_PER_TABLE, MasterIndex, PageTableEntry, split_indices};
use crate::{MAX_BUS_ADDRESS, PageTableError};
use gpu_addresses::{BusAddress, GPU_ADDRESS_SPACE_SIZE, GpuAddress, GpuRange, PAGE_SIZE};
use gpu_platform::{BufferAllocator, BusMapper, BusMapping, PlatformBuffer, PlatformError};
use log::trace;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

/// One bus-mapped table page (master table or page table).
struct TablePage {
    buffer: Arc<dyn PlatformBuffer>,
    // Keeps the page pinned for as long as the MMU may walk it.
    _mapping: Box<dyn BusMapping>,
    bus: BusAddress,
}

impl TablePage {
    fn allocate(
        allocator: &dyn BufferAllocator,
        bus_mapper: &dyn BusMapper,
        name: &str,
    ) -> Result<Self, PageTableError> {
        debug_assert_eq!(ENTRIES_PER_TABLE * 4, PAGE_SIZE);
        let buffer = allocator.allocate(PAGE_SIZE, name)?;
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
        })
    }

    fn read(&self, byte_offset: u64) -> Result<PageTableEntry, PageTableError> {
        Ok(PageTableEntry::from_bits(self.buffer.read_u32(byte_offset)?))
    }

    fn write(&self, byte_offset: u64, entry: PageTableEntry) -> Result<(), PageTableError> {
        Ok(self.buffer.write_u32(byte_offset, entry.into_bits())?)
    }
}

/// Page tables of a single GPU address space.
///
/// Page tables are allocated on first use and kept until the whole
/// [`PageTable`] is dropped.
pub struct PageTable {
    allocator: Arc<dyn BufferAllocator>,
    bus_mapper: Arc<dyn BusMapper>,
    master: TablePage,
    tables: BTreeMap<MasterIndex, TablePage>,
}

impl PageTable {
    /// Allocate and bus-map an empty master table.
    ///
    /// # Errors
    /// Propagates allocation and bus-mapping failures.
    pub fn new(
        allocator: Arc<dyn BufferAllocator>,
        bus_mapper: Arc<dyn BusMapper>,
    ) -> Result<Self, PageTableError> {
        let master =
            TablePage::allocate(allocator.as_ref(), bus_mapper.as_ref(), "gpu-master-table")?;
        Ok(Self {
            allocator,
            bus_mapper,
            master,
            tables: BTreeMap::new(),
        })
    }

    /// Bus address of the master table; this is what a page-table-array slot points at.
    #[inline]
    #[must_use]
    pub const fn root_bus_address(&self) -> BusAddress {
        self.master.bus
    }

    /// Number of second-level tables allocated so far.
    #[inline]
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Map `pages.len()` consecutive pages starting at `gpu_addr`.
    ///
    /// All page tables the range needs are allocated, and every target entry
    /// is checked, before the first leaf is written. On error no leaf entry
    /// has changed.
    ///
    /// # Errors
    /// - [`PageTableError::Unaligned`] / [`PageTableError::OutOfRange`] for a bad range.
    /// - [`PageTableError::InvalidBusAddress`] for an unaligned or too wide bus address.
    /// - [`PageTableError::AlreadyPresent`] if any page is already mapped.
    /// - Allocation failures while creating page tables.
    pub fn insert(
        &mut self,
        gpu_addr: GpuAddress,
        pages: &[BusAddress],
    ) -> Result<(), PageTableError> {
        let page_count = pages.len() as u64;
        check_range(gpu_addr, page_count)?;
        if let Some(&bad) = pages
            .iter()
            .find(|bus| !bus.is_page_aligned() || bus.as_u64() > MAX_BUS_ADDRESS)
        {
            return Err(PageTableError::InvalidBusAddress(bad));
        }

        for va in page_addresses(gpu_addr, page_count) {
            let (master, index) = split_indices(va);
            let table = self.ensure_table(master)?;
            if table.read(index.byte_offset())?.present() {
                return Err(PageTableError::AlreadyPresent(va));
            }
        }

        for (va, &bus) in page_addresses(gpu_addr, page_count).zip(pages) {
            let (master, index) = split_indices(va);
            let table = self
                .tables
                .get(&master)
                .ok_or(PageTableError::NotPresent(va))?;
            table.write(index.byte_offset(), PageTableEntry::make(bus))?;
        }

        trace!("gpu page table: mapped {page_count} pages at {gpu_addr}");
        Ok(())
    }

    /// Unmap `page_count` pages starting at `gpu_addr`.
    ///
    /// Every page in the range is cleared, even if some were not mapped.
    ///
    /// # Errors
    /// - [`PageTableError::Unaligned`] / [`PageTableError::OutOfRange`] for a bad range.
    /// - [`PageTableError::NotPresent`] naming the first page that was not mapped.
    pub fn clear(&mut self, gpu_addr: GpuAddress, page_count: u64) -> Result<(), PageTableError> {
        check_range(gpu_addr, page_count)?;

        let mut first_missing = None;
        for va in page_addresses(gpu_addr, page_count) {
            let (master, index) = split_indices(va);
            let present = match self.tables.get(&master) {
                Some(table) => {
                    let present = table.read(index.byte_offset())?.present();
                    table.write(index.byte_offset(), PageTableEntry::zero())?;
                    present
                }
                None => false,
            };
            if !present && first_missing.is_none() {
                first_missing = Some(va);
            }
        }

        trace!("gpu page table: cleared {page_count} pages at {gpu_addr}");
        first_missing.map_or(Ok(()), |va| Err(PageTableError::NotPresent(va)))
    }

    /// Bus address `gpu_addr` resolves to, including the in-page offset.
    #[must_use]
    pub fn translate(&self, gpu_addr: GpuAddress) -> Option<BusAddress> {
        if gpu_addr.as_u64() >= GPU_ADDRESS_SPACE_SIZE {
            return None;
        }
        let (master, index) = split_indices(gpu_addr);
        let table = self.tables.get(&master)?;
        let page = table.read(index.byte_offset()).ok()?.bus_address()?;
        Some(page + gpu_addr.page_offset())
    }

    fn ensure_table(&mut self, master: MasterIndex) -> Result<&TablePage, PageTableError> {
        match self.tables.entry(master) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let table = TablePage::allocate(
                    self.allocator.as_ref(),
                    self.bus_mapper.as_ref(),
                    "gpu-page-table",
                )?;
                self.master
                    .write(master.byte_offset(), PageTableEntry::make(table.bus))?;
                Ok(entry.insert(table))
            }
        }
    }
}

fn check_range(gpu_addr: GpuAddress, page_count: u64) -> Result<(), PageTableError> {
    if !gpu_addr.is_page_aligned() {
        return Err(PageTableError::Unaligned(gpu_addr));
    }
    let fits = page_count != 0
        && GpuRange::from_pages(gpu_addr, page_count)
            .is_some_and(|range| range.end().as_u64() <= GPU_ADDRESS_SPACE_SIZE);
    if !fits {
        return Err(PageTableError::OutOfRange { gpu_addr, page_count });
    }
    Ok(())
}

fn page_addresses(start: GpuAddress, page_count: u64) -> impl Iterator<Item = GpuAddress> {
    (0..page_count).map(move |i| start + i * PAGE_SIZE)
}

#[cfg(test)]
mod test {
    use super::*;
    use gpu_platform::fake::FakeMemory;

    fn table(memory: &Arc<FakeMemory>) -> PageTable {
        PageTable::new(memory.clone(), memory.clone()).unwrap()
    }

    fn bus(frame: u64) -> BusAddress {
        BusAddress::from_frame(frame)
    }

    #[test]
    fn insert_translate_clear() {
        let memory = FakeMemory::new();
        let mut pt = table(&memory);

        pt.insert(GpuAddress::new(0x10000), &[bus(0x100), bus(0x2000)]).unwrap();
        assert_eq!(pt.translate(GpuAddress::new(0x10010)), Some(bus(0x100) + 0x10));
        assert_eq!(pt.translate(GpuAddress::new(0x11FFC)), Some(bus(0x2000) + 0xFFC));
        assert_eq!(pt.translate(GpuAddress::new(0x12000)), None);
        assert_eq!(pt.table_count(), 1);

        pt.clear(GpuAddress::new(0x10000), 2).unwrap();
        assert_eq!(pt.translate(GpuAddress::new(0x10000)), None);
        assert_eq!(
            pt.clear(GpuAddress::new(0x10000), 1),
            Err(PageTableError::NotPresent(GpuAddress::new(0x10000)))
        );
    }

    #[test]
    fn master_table_points_at_page_table() {
        let memory = FakeMemory::new();
        let mut pt = table(&memory);
        pt.insert(GpuAddress::new(0x0040_0000), &[bus(0x300)]).unwrap();

        let master_entry = memory.read_bus_u32(pt.root_bus_address() + 4).unwrap();
        let table_bus = PageTableEntry::from_bits(master_entry).bus_address().unwrap();
        let leaf = memory.read_bus_u32(table_bus).unwrap();
        assert_eq!(PageTableEntry::from_bits(leaf).bus_address(), Some(bus(0x300)));
    }

    #[test]
    fn range_spanning_two_tables() {
        let memory = FakeMemory::new();
        let mut pt = table(&memory);
        pt.insert(GpuAddress::new(0x003F_F000), &[bus(1), bus(2)]).unwrap();
        assert_eq!(pt.table_count(), 2);
        assert_eq!(pt.translate(GpuAddress::new(0x0040_0000)), Some(bus(2)));
    }

    #[test]
    fn rejects_bad_ranges() {
        let memory = FakeMemory::new();
        let mut pt = table(&memory);
        assert_eq!(
            pt.insert(GpuAddress::new(0x1004), &[bus(1)]),
            Err(PageTableError::Unaligned(GpuAddress::new(0x1004)))
        );
        assert!(matches!(
            pt.insert(GpuAddress::new(0xFFFF_F000), &[bus(1), bus(2)]),
            Err(PageTableError::OutOfRange { .. })
        ));
        assert!(matches!(
            pt.insert(GpuAddress::new(0x1000), &[]),
            Err(PageTableError::OutOfRange { .. })
        ));
        assert_eq!(
            pt.insert(GpuAddress::new(0x1000), &[BusAddress::new(0x1234)]),
            Err(PageTableError::InvalidBusAddress(BusAddress::new(0x1234)))
        );
    }

    #[test]
    fn overlapping_insert_changes_nothing() {
        let memory = FakeMemory::new();
        let mut pt = table(&memory);
        pt.insert(GpuAddress::new(0x2000), &[bus(7)]).unwrap();
        assert_eq!(
            pt.insert(GpuAddress::new(0x1000), &[bus(8), bus(9)]),
            Err(PageTableError::AlreadyPresent(GpuAddress::new(0x2000)))
        );
        assert_eq!(pt.translate(GpuAddress::new(0x1000)), None);
        assert_eq!(pt.translate(GpuAddress::new(0x2000)), Some(bus(7)));
    }

    #[test]
    fn failed_table_allocation_writes_no_leaf() {
        // Room for the master table and one page table only.
        let memory = FakeMemory::with_limit(2 * PAGE_SIZE);
        let mut pt = table(&memory);
        let result = pt.insert(GpuAddress::new(0x003F_F000), &[bus(1), bus(2)]);
        assert_eq!(result, Err(PageTableError::Platform(PlatformError::OutOfMemory)));
        assert_eq!(pt.translate(GpuAddress::new(0x003F_F000)), None);
    }
}
