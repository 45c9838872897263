//! Device configuration.

use crate::device::DeviceError;
use gpu_addresses::{GPU_ADDRESS_SPACE_SIZE, GpuAddress, is_page_aligned};
use gpu_registers::instructions::INSTRUCTION_BYTES;
use gpu_registers::irq::MAX_EVENTS;
use gpu_vmem::MAX_SLOTS;
use std::time::Duration;

/// Tunables of an [`MsdVslDevice`](crate::MsdVslDevice).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceConfig {
    /// Ring buffer size in bytes. Page aligned.
    pub ringbuffer_size: u64,

    /// GPU address the ring buffer is mapped at in every address space.
    pub ringbuffer_gpu_addr: GpuAddress,

    /// Number of page-table-array slots, i.e. concurrently live address spaces.
    pub page_table_slots: u32,

    /// Size of the interrupt event pool.
    pub event_count: u32,

    /// Cycle count of the idle-loop `WAIT`.
    pub wait_cycles: u16,

    /// How often the device thread re-checks batches blocked on wait semaphores.
    pub request_poll_interval: Duration,
}

impl DeviceConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ringbuffer_size: 32 * 1024,
            ringbuffer_gpu_addr: GpuAddress::new(0x0100_0000),
            page_table_slots: 16,
            event_count: MAX_EVENTS,
            wait_cycles: 200,
            request_poll_interval: Duration::from_millis(1),
        }
    }

    /// Reject inconsistent values.
    ///
    /// # Errors
    /// [`DeviceError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), DeviceError> {
        let size = self.ringbuffer_size;
        if size == 0 || !is_page_aligned(size) || size % u64::from(INSTRUCTION_BYTES) != 0 {
            return Err(DeviceError::InvalidConfig("ringbuffer_size"));
        }
        if size > u64::from(u32::MAX) {
            return Err(DeviceError::InvalidConfig("ringbuffer_size"));
        }
        let gpu = self.ringbuffer_gpu_addr;
        if !gpu.is_page_aligned()
            || gpu
                .as_u64()
                .checked_add(size)
                .is_none_or(|end| end > GPU_ADDRESS_SPACE_SIZE)
        {
            return Err(DeviceError::InvalidConfig("ringbuffer_gpu_addr"));
        }
        if self.page_table_slots < 2 || self.page_table_slots > MAX_SLOTS {
            return Err(DeviceError::InvalidConfig("page_table_slots"));
        }
        if self.event_count == 0 || self.event_count > MAX_EVENTS {
            return Err(DeviceError::InvalidConfig("event_count"));
        }
        if self.wait_cycles == 0 {
            return Err(DeviceError::InvalidConfig("wait_cycles"));
        }
        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}
