use parking_lot::Mutex;

/// No slot is free.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("all {size} page table slots are in use")]
pub struct SlotAllocError {
    pub size: u32,
}

struct SlotState {
    busy: Vec<bool>,
    next_index: usize,
}

/// Fixed pool of page-table-array slots.
///
/// [`alloc`](Self::alloc) scans round-robin from just past the last handed
/// out slot, so a freed slot is not immediately reused. Any thread may
/// allocate or free.
pub struct PageTableSlotAllocator {
    size: u32,
    state: Mutex<SlotState>,
}

impl PageTableSlotAllocator {
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self {
            size,
            state: Mutex::new(SlotState {
                busy: vec![false; size as usize],
                next_index: 0,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Claim a free slot.
    ///
    /// # Errors
    /// [`SlotAllocError`] if all slots are busy; nothing changes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn alloc(&self) -> Result<u32, SlotAllocError> {
        let mut state = self.state.lock();
        let len = state.busy.len();
        let start = state.next_index;
        let slot = (0..len)
            .map(|i| (start + i) % len)
            .find(|&i| !state.busy[i])
            .ok_or(SlotAllocError { size: self.size })?;

        state.busy[slot] = true;
        state.next_index = (slot + 1) % len;
        Ok(slot as u32)
    }

    /// Return `slot` to the pool.
    ///
    /// # Panics
    /// If `slot` is out of range or already free.
    pub fn free(&self, slot: u32) {
        let mut state = self.state.lock();
        assert!(slot < self.size, "page table slot {slot} out of range");
        let busy = &mut state.busy[slot as usize];
        assert!(*busy, "page table slot {slot} freed twice");
        *busy = false;
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn free_count(&self) -> u32 {
        self.state.lock().busy.iter().filter(|busy| !**busy).count() as u32
    }
}
