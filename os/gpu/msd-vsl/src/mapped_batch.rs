use crate::address_space::AddressSpace;
use crate::command_buffer::CommandBufferError;
use crate::context::MsdVslContext;
use gpu_addresses::GpuAddress;
use gpu_platform::{BusMapping, PlatformSemaphore};
use log::debug;
use std::sync::Arc;

pub type Semaphore = Arc<dyn PlatformSemaphore>;

/// One unit of work queued on the device.
///
/// The device owns a batch from submission until the event that follows it
/// in the ring fires. Dropping the batch then releases whatever it held for
/// the GPU (resource mappings, deferred bus mappings); its signal semaphores
/// are taken first and signalled after the drop.
pub trait MappedBatch: Send {
    fn context(&self) -> &Arc<MsdVslContext>;

    /// GPU address of the first instruction, or `None` for batches without
    /// executable content.
    fn gpu_address(&self) -> Option<GpuAddress>;

    /// Bytes of executable content, rounded up to whole instructions.
    fn length(&self) -> u64;

    fn is_command_buffer(&self) -> bool {
        false
    }

    /// Append a `LINK` after the executable content. Batches without content
    /// have nothing to link from.
    ///
    /// # Errors
    /// Buffer access failures.
    fn write_link(&mut self, prefetch: u16, target: GpuAddress) -> Result<(), CommandBufferError> {
        let _ = (prefetch, target);
        Ok(())
    }

    fn wait_semaphores(&self) -> &[Semaphore];

    fn take_signal_semaphores(&mut self) -> Vec<Semaphore>;

    fn sequence_number(&self) -> u64;

    fn set_sequence_number(&mut self, sequence_number: u64);

    /// Address space the batch executes in.
    fn address_space(&self) -> &Arc<AddressSpace> {
        self.context().address_space()
    }

    /// `true` once every wait semaphore is signalled.
    fn is_ready(&self) -> bool {
        self.wait_semaphores().iter().all(|s| s.is_signaled())
    }
}

/// A batch without executable content that only signals semaphores.
pub struct EventBatch {
    context: Arc<MsdVslContext>,
    wait_semaphores: Vec<Semaphore>,
    signal_semaphores: Vec<Semaphore>,
    sequence_number: u64,
}

impl EventBatch {
    #[must_use]
    pub const fn new(
        context: Arc<MsdVslContext>,
        wait_semaphores: Vec<Semaphore>,
        signal_semaphores: Vec<Semaphore>,
    ) -> Self {
        Self {
            context,
            wait_semaphores,
            signal_semaphores,
            sequence_number: 0,
        }
    }
}

impl MappedBatch for EventBatch {
    fn context(&self) -> &Arc<MsdVslContext> {
        &self.context
    }

    fn gpu_address(&self) -> Option<GpuAddress> {
        None
    }

    fn length(&self) -> u64 {
        0
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

/// Carries bus mappings whose page-table entries are already cleared.
///
/// Submitted with a TLB flush; the pages stay pinned until the event after
/// that flush fires and the batch is dropped.
pub struct MappingReleaseBatch {
    context: Arc<MsdVslContext>,
    mappings: Vec<Box<dyn BusMapping>>,
    sequence_number: u64,
}

impl MappingReleaseBatch {
    #[must_use]
    pub fn new(context: Arc<MsdVslContext>, mappings: Vec<Box<dyn BusMapping>>) -> Self {
        Self {
            context,
            mappings,
            sequence_number: 0,
        }
    }

    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }
}

impl MappedBatch for MappingReleaseBatch {
    fn context(&self) -> &Arc<MsdVslContext> {
        &self.context
    }

    fn gpu_address(&self) -> Option<GpuAddress> {
        None
    }

    fn length(&self) -> u64 {
        0
    }

    fn wait_semaphores(&self) -> &[Semaphore] {
        &[]
    }

    fn take_signal_semaphores(&mut self) -> Vec<Semaphore> {
        Vec::new()
    }

    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    fn set_sequence_number(&mut self, sequence_number: u64) {
        self.sequence_number = sequence_number;
    }
}

impl Drop for MappingReleaseBatch {
    fn drop(&mut self) {
        if !self.mappings.is_empty() {
            debug!(
                "batch {}: unpinning {} released mappings",
                self.sequence_number,
                self.mappings.len()
            );
        }
    }
}
