//! # Client Command Buffers
//!
//! A [`CommandBuffer`] names one of its exec resources as the *batch buffer*
//! and a byte range in it holding front-end instructions:
//!
//! ```text
//!   batch buffer
//!   ├───────────┬──────────────────────────┬──────────┬────────┤
//!   0   batch_start_offset      batch content     LINK   size
//!               │◄──── length (×8) ───────►│◄── 8 ───►│
//! ```
//!
//! The device appends a `LINK` right after the content, back into the ring,
//! so the buffer needs eight spare bytes there.
//! [`CommandBuffer::prepare_for_execution`] checks that layout and pins a
//! live [`GpuMapping`] for every resource; those mappings stay referenced
//! until the batch is dropped after completion.

use crate::buffer::MsdVslBuffer;
use crate::context::MsdVslContext;
use crate::gpu_mapping::GpuMapping;
use crate::mapped_batch::{MappedBatch, Semaphore};
use gpu_addresses::GpuAddress;
use gpu_platform::PlatformError;
use gpu_registers::instructions::{INSTRUCTION_BYTES, link_header};
use log::trace;
use std::sync::Arc;

/// Where the instructions live among the resources.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CommandBufferDescriptor {
    pub batch_buffer_resource_index: u32,
    /// Byte offset of the first instruction in the batch buffer.
    pub batch_start_offset: u64,
    pub batch_length: u64,
}

/// A buffer range the batch reads or writes.
#[derive(Debug, Clone)]
pub struct ExecResource {
    pub buffer: Arc<MsdVslBuffer>,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandBufferError {
    #[error("command buffer has no resources")]
    NoResources,
    #[error("batch buffer index {index} out of {count} resources")]
    InvalidResourceIndex { index: u32, count: usize },
    #[error("batch start offset {offset:#x} is not instruction aligned")]
    Misaligned { offset: u64 },
    #[error("resource {index} [{offset:#x}+{length:#x}) exceeds its buffer of {size:#x} bytes")]
    ResourceOutOfBounds {
        index: usize,
        offset: u64,
        length: u64,
        size: u64,
    },
    #[error("no room for the trailing LINK at {end:#x} in a buffer of {size:#x} bytes")]
    NoSpaceForLink { end: u64, size: u64 },
    #[error("resource {index} (buffer {buffer_id}) is not mapped")]
    ResourceNotMapped { index: usize, buffer_id: u64 },
    #[error("batch of {length} bytes needs a prefetch above 16 bits")]
    PrefetchOverflow { length: u64 },
    #[error("command buffer was not prepared for execution")]
    NotPrepared,
    #[error("GPU address {0} does not fit a LINK")]
    AddressOutOfRange(GpuAddress),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Prefetch for a `LINK` into `length` bytes of content plus the trailing
/// `LINK`, or `None` if it does not fit the 16-bit field.
#[must_use]
pub fn prefetch_for(length: u64) -> Option<u16> {
    let units = length.checked_add(u64::from(INSTRUCTION_BYTES))? / u64::from(INSTRUCTION_BYTES);
    u16::try_from(units).ok()
}

pub struct CommandBuffer {
    context: Arc<MsdVslContext>,
    descriptor: CommandBufferDescriptor,
    resources: Vec<ExecResource>,
    wait_semaphores: Vec<Semaphore>,
    signal_semaphores: Vec<Semaphore>,
    mappings: Vec<Arc<GpuMapping>>,
    batch_gpu_addr: Option<GpuAddress>,
    sequence_number: u64,
}

impl CommandBuffer {
    #[must_use]
    pub const fn new(
        context: Arc<MsdVslContext>,
        descriptor: CommandBufferDescriptor,
        resources: Vec<ExecResource>,
        wait_semaphores: Vec<Semaphore>,
        signal_semaphores: Vec<Semaphore>,
    ) -> Self {
        Self {
            context,
            descriptor,
            resources,
            wait_semaphores,
            signal_semaphores,
            mappings: Vec::new(),
            batch_gpu_addr: None,
            sequence_number: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn descriptor(&self) -> &CommandBufferDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn resources(&self) -> &[ExecResource] {
        &self.resources
    }

    /// Mappings pinned by [`prepare_for_execution`](Self::prepare_for_execution), one per resource.
    #[must_use]
    pub fn mappings(&self) -> &[Arc<GpuMapping>] {
        &self.mappings
    }

    #[must_use]
    pub const fn is_prepared(&self) -> bool {
        self.batch_gpu_addr.is_some()
    }

    /// Validate the layout and resolve every resource to a live mapping in
    /// the context's address space.
    ///
    /// # Errors
    /// Any [`CommandBufferError`] layout violation, or
    /// [`CommandBufferError::ResourceNotMapped`] if a resource (for the batch
    /// buffer: the content plus the trailing `LINK`) has no covering mapping.
    /// On error the buffer stays unprepared.
    pub fn prepare_for_execution(&mut self) -> Result<(), CommandBufferError> {
        if self.resources.is_empty() {
            return Err(CommandBufferError::NoResources);
        }
        let index = self.descriptor.batch_buffer_resource_index;
        let batch_index = usize::try_from(index)
            .ok()
            .filter(|&i| i < self.resources.len())
            .ok_or(CommandBufferError::InvalidResourceIndex {
                index,
                count: self.resources.len(),
            })?;

        let start = self.descriptor.batch_start_offset;
        if start % u64::from(INSTRUCTION_BYTES) != 0 {
            return Err(CommandBufferError::Misaligned { offset: start });
        }

        for (i, resource) in self.resources.iter().enumerate() {
            let size = resource.buffer.size();
            if resource
                .offset
                .checked_add(resource.length)
                .is_none_or(|end| end > size)
            {
                return Err(CommandBufferError::ResourceOutOfBounds {
                    index: i,
                    offset: resource.offset,
                    length: resource.length,
                    size,
                });
            }
        }

        let length = self.length();
        let batch_buffer = &self.resources[batch_index].buffer;
        let link_end = start
            .checked_add(length)
            .and_then(|end| end.checked_add(u64::from(INSTRUCTION_BYTES)))
            .unwrap_or(u64::MAX);
        if link_end > batch_buffer.size() {
            return Err(CommandBufferError::NoSpaceForLink {
                end: link_end,
                size: batch_buffer.size(),
            });
        }
        if prefetch_for(length).is_none() {
            return Err(CommandBufferError::PrefetchOverflow { length });
        }

        let address_space = self.context.address_space();
        let mut mappings = Vec::with_capacity(self.resources.len());
        for (i, resource) in self.resources.iter().enumerate() {
            let (offset, length) = if i == batch_index {
                (start, link_end - start)
            } else {
                (resource.offset, resource.length)
            };
            let mapping = address_space
                .find_mapping(&resource.buffer, offset, length)
                .ok_or(CommandBufferError::ResourceNotMapped {
                    index: i,
                    buffer_id: resource.buffer.id(),
                })?;
            mappings.push(mapping);
        }

        let batch_gpu_addr = mappings[batch_index]
            .gpu_address_of(start)
            .ok_or(CommandBufferError::ResourceNotMapped {
                index: batch_index,
                buffer_id: batch_buffer.id(),
            })?;
        trace!(
            "command buffer prepared: {} resources, batch at {batch_gpu_addr} ({length} bytes)",
            mappings.len()
        );
        self.mappings = mappings;
        self.batch_gpu_addr = Some(batch_gpu_addr);
        Ok(())
    }

    fn batch_buffer(&self) -> Option<&Arc<MsdVslBuffer>> {
        let index = usize::try_from(self.descriptor.batch_buffer_resource_index).ok()?;
        self.resources.get(index).map(|resource| &resource.buffer)
    }
}

impl MappedBatch for CommandBuffer {
    fn context(&self) -> &Arc<MsdVslContext> {
        &self.context
    }

    fn gpu_address(&self) -> Option<GpuAddress> {
        self.batch_gpu_addr
    }

    fn length(&self) -> u64 {
        self.descriptor
            .batch_length
            .next_multiple_of(u64::from(INSTRUCTION_BYTES))
    }

    fn is_command_buffer(&self) -> bool {
        true
    }

    /// Write the `LINK` into the eight bytes after the content, target first.
    fn write_link(&mut self, prefetch: u16, target: GpuAddress) -> Result<(), CommandBufferError> {
        if !self.is_prepared() {
            return Err(CommandBufferError::NotPrepared);
        }
        let address = target
            .to_u32()
            .ok_or(CommandBufferError::AddressOutOfRange(target))?;
        let offset = self.descriptor.batch_start_offset + self.length();
        let buffer = self
            .batch_buffer()
            .ok_or(CommandBufferError::NotPrepared)?
            .platform_buffer();
        buffer.write_u32(offset + 4, address)?;
        buffer.write_u32(offset, link_header(prefetch))?;
        Ok(())
    }

    fn wait_semaphores(&self) -> &[Semaphore] {
        &self.wait_semaphores
    }

    fn take_signal_semaphores(&mut self) -> Vec<Semaphore> {
        core::mem::take(&mut self.signal_semaphores)
    }

    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    fn set_sequence_number(&mut self, sequence_number: u64) {
        self.sequence_number = sequence_number;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mmu::Mmu;
    use gpu_addresses::PAGE_SIZE;
    use gpu_platform::fake::FakeMemory;
    use gpu_registers::instructions::Instruction;
    use std::sync::Weak;

    const BATCH_VA: u64 = 0x0010_0000;

    struct Fixture {
        memory: Arc<FakeMemory>,
        context: Arc<MsdVslContext>,
        batch: Arc<MsdVslBuffer>,
    }

    fn fixture() -> Fixture {
        let memory = FakeMemory::new();
        let mmu = Mmu::new(memory.clone(), memory.clone(), 2).unwrap();
        let address_space = mmu.create_address_space(1).unwrap();
        let ring = MsdVslBuffer::create(&*memory, PAGE_SIZE, "ring").unwrap();
        let ring_mapping = address_space
            .map_buffer_gpu(&ring, GpuAddress::new(0x0100_0000), 0, 1)
            .unwrap();
        let batch = MsdVslBuffer::create(&*memory, PAGE_SIZE, "batch").unwrap();
        address_space
            .map_buffer_gpu(&batch, GpuAddress::new(BATCH_VA), 0, 1)
            .unwrap();
        Fixture {
            memory,
            context: MsdVslContext::new(Weak::new(), address_space, ring_mapping),
            batch,
        }
    }

    fn command_buffer(
        fixture: &Fixture,
        start: u64,
        length: u64,
        resources: Vec<ExecResource>,
    ) -> CommandBuffer {
        CommandBuffer::new(
            Arc::clone(&fixture.context),
            CommandBufferDescriptor {
                batch_buffer_resource_index: 0,
                batch_start_offset: start,
                batch_length: length,
            },
            resources,
            Vec::new(),
            Vec::new(),
        )
    }

    fn whole(buffer: &Arc<MsdVslBuffer>) -> ExecResource {
        ExecResource {
            buffer: Arc::clone(buffer),
            offset: 0,
            length: buffer.size(),
        }
    }

    #[test]
    fn prefetch_counts_content_and_link() {
        assert_eq!(prefetch_for(0), Some(1));
        assert_eq!(prefetch_for(8), Some(2));
        assert_eq!(prefetch_for(0x100), Some(0x21));
        assert_eq!(prefetch_for(u64::from(u16::MAX) * 8), None);
        assert_eq!(prefetch_for(u64::MAX), None);
    }

    #[test]
    fn layout_is_validated() {
        let f = fixture();

        let mut cb = command_buffer(&f, 0, 8, Vec::new());
        assert_eq!(cb.prepare_for_execution(), Err(CommandBufferError::NoResources));

        let mut cb = CommandBuffer::new(
            Arc::clone(&f.context),
            CommandBufferDescriptor {
                batch_buffer_resource_index: 1,
                batch_start_offset: 0,
                batch_length: 8,
            },
            vec![whole(&f.batch)],
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(
            cb.prepare_for_execution(),
            Err(CommandBufferError::InvalidResourceIndex { index: 1, count: 1 })
        );

        let mut cb = command_buffer(&f, 4, 8, vec![whole(&f.batch)]);
        assert_eq!(
            cb.prepare_for_execution(),
            Err(CommandBufferError::Misaligned { offset: 4 })
        );

        let oversized = ExecResource {
            buffer: Arc::clone(&f.batch),
            offset: 8,
            length: PAGE_SIZE,
        };
        let mut cb = command_buffer(&f, 0, 8, vec![oversized]);
        assert!(matches!(
            cb.prepare_for_execution(),
            Err(CommandBufferError::ResourceOutOfBounds { index: 0, .. })
        ));

        // Content reaching the last eight bytes leaves no room for the LINK.
        let mut cb = command_buffer(&f, PAGE_SIZE - 16, 16, vec![whole(&f.batch)]);
        assert_eq!(
            cb.prepare_for_execution(),
            Err(CommandBufferError::NoSpaceForLink {
                end: PAGE_SIZE + 8,
                size: PAGE_SIZE
            })
        );
        assert!(!cb.is_prepared());

        let mut cb = command_buffer(&f, PAGE_SIZE - 16, 8, vec![whole(&f.batch)]);
        assert_eq!(cb.prepare_for_execution(), Ok(()));
    }

    #[test]
    fn unmapped_resource_is_rejected() {
        let f = fixture();
        let other = MsdVslBuffer::create(&*f.memory, PAGE_SIZE, "other").unwrap();
        let mut cb = command_buffer(&f, 0, 8, vec![whole(&f.batch), whole(&other)]);
        assert_eq!(
            cb.prepare_for_execution(),
            Err(CommandBufferError::ResourceNotMapped {
                index: 1,
                buffer_id: other.id()
            })
        );
        assert!(cb.mappings().is_empty());
        assert_eq!(cb.gpu_address(), None);
    }

    #[test]
    fn prepared_buffer_pins_its_mappings() {
        let f = fixture();
        let mut cb = command_buffer(&f, 0x40, 12, vec![whole(&f.batch)]);
        cb.prepare_for_execution().unwrap();

        assert_eq!(cb.length(), 16);
        assert_eq!(cb.gpu_address(), Some(GpuAddress::new(BATCH_VA + 0x40)));
        assert_eq!(cb.mappings().len(), 1);
        // The address space index and the command buffer.
        assert_eq!(Arc::strong_count(&cb.mappings()[0]), 2);
    }

    #[test]
    fn link_follows_the_content() {
        let f = fixture();
        let mut cb = command_buffer(&f, 0x40, 16, vec![whole(&f.batch)]);
        assert_eq!(
            cb.write_link(3, GpuAddress::new(0x0100_0010)),
            Err(CommandBufferError::NotPrepared)
        );

        cb.prepare_for_execution().unwrap();
        assert_eq!(
            cb.write_link(3, GpuAddress::new(1 << 32)),
            Err(CommandBufferError::AddressOutOfRange(GpuAddress::new(1 << 32)))
        );
        cb.write_link(3, GpuAddress::new(0x0100_0010)).unwrap();

        let buffer = f.batch.platform_buffer();
        let words = [buffer.read_u32(0x50).unwrap(), buffer.read_u32(0x54).unwrap()];
        assert_eq!(
            Instruction::decode(words),
            Ok(Instruction::Link {
                prefetch: 3,
                address: 0x0100_0010
            })
        );
    }
}
