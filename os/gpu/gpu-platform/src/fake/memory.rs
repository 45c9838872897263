use crate::{BufferAllocator, BusMapper, BusMapping, PlatformBuffer, PlatformError};
use gpu_addresses::{BusAddress, PAGE_SIZE, bytes_to_pages};
use log::{trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Zero-initialized, page-granular buffer backed by a `Vec<u32>`.
pub struct FakeBuffer {
    id: u64,
    name: String,
    size: u64,
    words: Mutex<Vec<u32>>,
}

impl FakeBuffer {
    /// Create a buffer of at least `size` bytes (rounded up to whole pages).
    #[must_use]
    pub fn new(size: u64, name: &str) -> Arc<Self> {
        let size = bytes_to_pages(size.max(1)) * PAGE_SIZE;
        #[allow(clippy::cast_possible_truncation)]
        let words = vec![0u32; (size / 4) as usize];
        Arc::new(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            size,
            words: Mutex::new(words),
        })
    }

    fn word_index(&self, offset: u64) -> Result<usize, PlatformError> {
        if offset % 4 != 0 || offset.checked_add(4).is_none_or(|end| end > self.size) {
            return Err(PlatformError::OutOfRange {
                offset,
                size: self.size,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok((offset / 4) as usize)
    }
}

impl PlatformBuffer for FakeBuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_u32(&self, offset: u64) -> Result<u32, PlatformError> {
        let index = self.word_index(offset)?;
        Ok(self.words.lock()[index])
    }

    fn write_u32(&self, offset: u64, value: u32) -> Result<(), PlatformError> {
        let index = self.word_index(offset)?;
        self.words.lock()[index] = value;
        Ok(())
    }
}

/// Buffer page backing one bus frame.
struct BusPage {
    buffer: Arc<dyn PlatformBuffer>,
    page: u64,
}

struct FakeMemoryState {
    next_frame: u64,
    frames: HashMap<u64, BusPage>,
    live_mappings: usize,
    allocated_bytes: u64,
}

/// Bus address space plus buffer allocator.
pub struct FakeMemory {
    self_ref: Weak<FakeMemory>,
    limit_bytes: Option<u64>,
    state: Mutex<FakeMemoryState>,
}

impl FakeMemory {
    /// First frame handed out; keeps bus addresses visibly distinct from GPU addresses.
    const FIRST_FRAME: u64 = 0x8_0000;

    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Allocator that fails once `limit_bytes` have been handed out.
    #[must_use]
    pub fn with_limit(limit_bytes: u64) -> Arc<Self> {
        Self::build(Some(limit_bytes))
    }

    fn build(limit_bytes: Option<u64>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            limit_bytes,
            state: Mutex::new(FakeMemoryState {
                next_frame: Self::FIRST_FRAME,
                frames: HashMap::new(),
                live_mappings: 0,
                allocated_bytes: 0,
            }),
        })
    }

    fn resolve(&self, bus: BusAddress) -> Result<(Arc<dyn PlatformBuffer>, u64), PlatformError> {
        let state = self.state.lock();
        let page = state
            .frames
            .get(&bus.frame())
            .ok_or(PlatformError::UnmappedBusAddress(bus))?;
        let offset = page.page * PAGE_SIZE + (bus.as_u64() & (PAGE_SIZE - 1));
        Ok((Arc::clone(&page.buffer), offset))
    }

    /// DMA read of the dword at `bus`.
    ///
    /// # Errors
    /// [`PlatformError::UnmappedBusAddress`] if no live mapping covers `bus`.
    pub fn read_bus_u32(&self, bus: BusAddress) -> Result<u32, PlatformError> {
        let (buffer, offset) = self.resolve(bus)?;
        buffer.read_u32(offset)
    }

    /// DMA write of the dword at `bus`.
    ///
    /// # Errors
    /// [`PlatformError::UnmappedBusAddress`] if no live mapping covers `bus`.
    pub fn write_bus_u32(&self, bus: BusAddress, value: u32) -> Result<(), PlatformError> {
        let (buffer, offset) = self.resolve(bus)?;
        buffer.write_u32(offset, value)
    }

    #[must_use]
    pub fn is_bus_mapped(&self, bus: BusAddress) -> bool {
        self.state.lock().frames.contains_key(&bus.frame())
    }

    /// Number of bus mappings that have not been dropped yet.
    #[must_use]
    pub fn live_mapping_count(&self) -> usize {
        self.state.lock().live_mappings
    }

    fn unmap(&self, bus_addresses: &[BusAddress]) {
        let mut state = self.state.lock();
        for bus in bus_addresses {
            state.frames.remove(&bus.frame());
        }
        state.live_mappings -= 1;
        trace!("unmapped {} bus pages", bus_addresses.len());
    }
}

impl BufferAllocator for FakeMemory {
    fn allocate(&self, size: u64, name: &str) -> Result<Arc<dyn PlatformBuffer>, PlatformError> {
        let buffer = {
            let mut state = self.state.lock();
            let total = state.allocated_bytes.saturating_add(size);
            if let Some(limit) = self.limit_bytes.filter(|&limit| total > limit) {
                warn!(
                    "allocation of {size:#x} bytes for {name} exceeds the {limit:#x} byte limit"
                );
                return Err(PlatformError::OutOfMemory);
            }
            state.allocated_bytes = total;
            FakeBuffer::new(size, name)
        };
        Ok(buffer)
    }
}

impl BusMapper for FakeMemory {
    fn map_page_range_bus(
        &self,
        buffer: &Arc<dyn PlatformBuffer>,
        page_offset: u64,
        page_count: u64,
    ) -> Result<Box<dyn BusMapping>, PlatformError> {
        let buffer_pages = buffer.size() / PAGE_SIZE;
        if page_count == 0
            || page_offset
                .checked_add(page_count)
                .is_none_or(|end| end > buffer_pages)
        {
            return Err(PlatformError::InvalidPageRange {
                page_offset,
                page_count,
                buffer_pages,
            });
        }

        let mut state = self.state.lock();
        let first = state.next_frame;
        state.next_frame += page_count;
        state.live_mappings += 1;

        trace!(
            "buffer {} pages {page_offset}..{} mapped at frame {first:#x}",
            buffer.id(),
            page_offset + page_count
        );
        let bus_addresses = (0..page_count)
            .map(|i| {
                state.frames.insert(
                    first + i,
                    BusPage {
                        buffer: Arc::clone(buffer),
                        page: page_offset + i,
                    },
                );
                BusAddress::from_frame(first + i)
            })
            .collect();

        Ok(Box::new(FakeBusMapping {
            memory: self.self_ref.clone(),
            page_offset,
            page_count,
            bus_addresses,
        }))
    }
}

/// Bus mapping handed out by [`FakeMemory`]; unpins its frames on drop.
pub struct FakeBusMapping {
    memory: Weak<FakeMemory>,
    page_offset: u64,
    page_count: u64,
    bus_addresses: Vec<BusAddress>,
}

impl BusMapping for FakeBusMapping {
    fn page_offset(&self) -> u64 {
        self.page_offset
    }

    fn page_count(&self) -> u64 {
        self.page_count
    }

    fn bus_addresses(&self) -> &[BusAddress] {
        &self.bus_addresses
    }
}

impl Drop for FakeBusMapping {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.upgrade() {
            memory.unmap(&self.bus_addresses);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bus_reads_follow_the_mapping() {
        let memory = FakeMemory::new();
        let buffer = memory.allocate(2 * PAGE_SIZE, "test").unwrap();
        buffer.write_u32(PAGE_SIZE + 8, 0xCAFE).unwrap();

        let mapping = memory.map_page_range_bus(&buffer, 1, 1).unwrap();
        let bus = mapping.bus_addresses()[0];
        assert!(memory.is_bus_mapped(bus));
        assert_eq!(memory.read_bus_u32(bus + 8), Ok(0xCAFE));
        assert_eq!(memory.live_mapping_count(), 1);

        memory.write_bus_u32(bus + 12, 0xBEEF).unwrap();
        assert_eq!(buffer.read_u32(PAGE_SIZE + 12), Ok(0xBEEF));

        drop(mapping);
        assert!(!memory.is_bus_mapped(bus));
        assert_eq!(memory.live_mapping_count(), 0);
        assert_eq!(
            memory.read_bus_u32(bus),
            Err(PlatformError::UnmappedBusAddress(bus))
        );
        assert_eq!(
            memory.write_bus_u32(bus, 0),
            Err(PlatformError::UnmappedBusAddress(bus))
        );
    }

    #[test]
    fn page_range_is_validated() {
        let memory = FakeMemory::new();
        let buffer = memory.allocate(PAGE_SIZE, "test").unwrap();
        assert!(memory.map_page_range_bus(&buffer, 0, 2).is_err());
        assert!(memory.map_page_range_bus(&buffer, 1, 1).is_err());
        assert!(memory.map_page_range_bus(&buffer, 0, 0).is_err());
    }

    #[test]
    fn buffer_bounds() {
        let buffer = FakeBuffer::new(10, "tiny");
        assert_eq!(buffer.size(), PAGE_SIZE);
        assert!(buffer.read_u32(PAGE_SIZE - 4).is_ok());
        assert!(buffer.read_u32(PAGE_SIZE).is_err());
        assert!(buffer.write_u32(2, 0).is_err());
    }

    #[test]
    fn allocation_limit() {
        let memory = FakeMemory::with_limit(PAGE_SIZE);
        assert!(memory.allocate(PAGE_SIZE, "a").is_ok());
        assert_eq!(
            memory.allocate(PAGE_SIZE, "b").err(),
            Some(PlatformError::OutOfMemory)
        );
    }
}
