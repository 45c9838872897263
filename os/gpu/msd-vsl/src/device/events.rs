use super::DeviceError;
use crate::mapped_batch::MappedBatch;
use crate::ringbuffer::Ringbuffer;
use gpu_registers::instructions::event;
use std::collections::VecDeque;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum EventState {
    Free,
    Allocated,
    Submitted,
}

struct Event {
    state: EventState,
    batch: Option<Box<dyn MappedBatch>>,
    /// Ring offset of the `WAIT` following the event.
    ring_offset: u32,
}

/// A completed event: its batch and where the front end is now waiting.
pub struct CompletedEvent {
    pub batch: Box<dyn MappedBatch>,
    pub ring_offset: u32,
}

/// The pool of interrupt events, `free → allocated → submitted → free`.
///
/// Submitted events are also kept in submission order, which is the order
/// the front end reaches them.
pub struct Events {
    slots: Vec<Event>,
    inflight: VecDeque<u32>,
}

impl Events {
    pub fn new(count: u32) -> Self {
        Self {
            slots: (0..count)
                .map(|_| Event {
                    state: EventState::Free,
                    batch: None,
                    ring_offset: 0,
                })
                .collect(),
            inflight: VecDeque::new(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn alloc(&mut self) -> Result<u32, DeviceError> {
        let id = self
            .slots
            .iter()
            .position(|e| e.state == EventState::Free)
            .ok_or(DeviceError::NoFreeEvent)?;
        self.slots[id].state = EventState::Allocated;
        Ok(id as u32)
    }

    /// Append the `EVENT` instruction for allocated event `id`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&self, ringbuffer: &mut Ringbuffer, id: u32) -> Result<(), DeviceError> {
        if self.slot(id)?.state != EventState::Allocated {
            return Err(DeviceError::EventNotAllocated(id));
        }
        ringbuffer.write_instruction(event(id as u8))?;
        Ok(())
    }

    pub fn submit(
        &mut self,
        id: u32,
        batch: Box<dyn MappedBatch>,
        ring_offset: u32,
    ) -> Result<(), DeviceError> {
        let slot = self.slot_mut(id)?;
        if slot.state != EventState::Allocated {
            return Err(DeviceError::EventNotAllocated(id));
        }
        slot.state = EventState::Submitted;
        slot.batch = Some(batch);
        slot.ring_offset = ring_offset;
        self.inflight.push_back(id);
        Ok(())
    }

    pub fn complete(&mut self, id: u32) -> Result<CompletedEvent, DeviceError> {
        let slot = self.slot_mut(id)?;
        if slot.state != EventState::Submitted {
            return Err(DeviceError::EventNotSubmitted(id));
        }
        let batch = slot.batch.take().ok_or(DeviceError::EventNotSubmitted(id))?;
        slot.state = EventState::Free;
        let ring_offset = slot.ring_offset;
        self.inflight.retain(|&inflight| inflight != id);
        Ok(CompletedEvent { batch, ring_offset })
    }

    /// Return an allocated, never submitted event.
    pub fn free(&mut self, id: u32) -> Result<(), DeviceError> {
        let slot = self.slot_mut(id)?;
        if slot.state != EventState::Allocated {
            return Err(DeviceError::EventNotAllocated(id));
        }
        slot.state = EventState::Free;
        Ok(())
    }

    /// Submitted event ids, oldest first.
    pub fn inflight(&self) -> impl Iterator<Item = u32> + '_ {
        self.inflight.iter().copied()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn oldest_batch(&self) -> Option<&dyn MappedBatch> {
        let id = *self.inflight.front()?;
        self.slots.get(id as usize)?.batch.as_deref()
    }

    fn slot(&self, id: u32) -> Result<&Event, DeviceError> {
        self.slots
            .get(id as usize)
            .ok_or(DeviceError::InvalidEvent(id))
    }

    fn slot_mut(&mut self, id: u32) -> Result<&mut Event, DeviceError> {
        self.slots
            .get_mut(id as usize)
            .ok_or(DeviceError::InvalidEvent(id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffer::MsdVslBuffer;
    use crate::context::MsdVslContext;
    use crate::mapped_batch::EventBatch;
    use crate::mmu::Mmu;
    use gpu_addresses::{GpuAddress, PAGE_SIZE};
    use gpu_platform::fake::FakeMemory;
    use gpu_registers::instructions::{Instruction, STATE_EVENT};
    use std::sync::{Arc, Weak};

    fn context(memory: &Arc<FakeMemory>) -> Arc<MsdVslContext> {
        let mmu = Mmu::new(memory.clone(), memory.clone(), 2).unwrap();
        let address_space = mmu.create_address_space(1).unwrap();
        let ring = MsdVslBuffer::create(&**memory, PAGE_SIZE, "ring").unwrap();
        let mapping = address_space
            .map_buffer_gpu(&ring, GpuAddress::new(0x0100_0000), 0, 1)
            .unwrap();
        MsdVslContext::new(Weak::new(), address_space, mapping)
    }

    fn batch(context: &Arc<MsdVslContext>) -> Box<dyn MappedBatch> {
        Box::new(EventBatch::new(Arc::clone(context), Vec::new(), Vec::new()))
    }

    #[test]
    fn lifecycle() {
        let memory = FakeMemory::new();
        let context = context(&memory);
        let mut events = Events::new(2);

        let a = events.alloc().unwrap();
        let b = events.alloc().unwrap();
        assert_ne!(a, b);
        assert!(matches!(events.alloc(), Err(DeviceError::NoFreeEvent)));

        assert!(matches!(
            events.complete(a),
            Err(DeviceError::EventNotSubmitted(_))
        ));
        events.submit(a, batch(&context), 0x40).unwrap();
        assert!(matches!(
            events.free(a),
            Err(DeviceError::EventNotAllocated(_))
        ));
        events.free(b).unwrap();
        assert!(events.oldest_batch().is_some());

        let done = events.complete(a).unwrap();
        assert_eq!(done.ring_offset, 0x40);
        assert!(matches!(
            events.complete(a),
            Err(DeviceError::EventNotSubmitted(_))
        ));
        assert!(matches!(
            events.complete(7),
            Err(DeviceError::InvalidEvent(7))
        ));
        assert_eq!(events.inflight_count(), 0);
        assert!(events.oldest_batch().is_none());
    }

    #[test]
    fn inflight_is_in_submission_order() {
        let memory = FakeMemory::new();
        let context = context(&memory);
        let mut events = Events::new(4);
        let ids: Vec<u32> = (0..3).map(|_| events.alloc().unwrap()).collect();
        for &id in ids.iter().rev() {
            events.submit(id, batch(&context), id * 8).unwrap();
        }
        assert_eq!(events.inflight().collect::<Vec<_>>(), vec![2, 1, 0]);

        events.complete(1).unwrap();
        assert_eq!(events.inflight().collect::<Vec<_>>(), vec![2, 0]);
        assert_eq!(events.alloc().unwrap(), 1);
    }

    #[test]
    fn write_emits_event_instruction() {
        let memory = FakeMemory::new();
        let buffer = MsdVslBuffer::create(&*memory, PAGE_SIZE, "ring").unwrap();
        let mut ring = Ringbuffer::new(buffer, PAGE_SIZE).unwrap();
        let mut events = Events::new(4);

        assert!(matches!(
            events.write(&mut ring, 3),
            Err(DeviceError::EventNotAllocated(3))
        ));
        let id = events.alloc().unwrap();
        events.write(&mut ring, id).unwrap();

        let words = [ring.read32(0).unwrap(), ring.read32(4).unwrap()];
        assert!(matches!(
            Instruction::decode(words),
            Ok(Instruction::LoadState { state: STATE_EVENT, .. })
        ));
    }
}
