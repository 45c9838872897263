use crate::gpu::SimGpu;
use crate::interrupt::SimInterrupt;
use gpu_platform::fake::FakeMemory;
use gpu_platform::{BufferAllocator, BusMapper, PlatformDevice, PlatformInterrupt, RegisterIo};
use std::sync::Arc;

/// [`PlatformDevice`] over [`FakeMemory`] and a [`SimGpu`].
pub struct SimPlatform {
    memory: Arc<FakeMemory>,
    gpu: Arc<SimGpu>,
    interrupt: Arc<SimInterrupt>,
}

impl SimPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::with_memory(FakeMemory::new())
    }

    /// Use `memory`, e.g. one built with [`FakeMemory::with_limit`].
    #[must_use]
    pub fn with_memory(memory: Arc<FakeMemory>) -> Self {
        let interrupt = SimInterrupt::new();
        let gpu = SimGpu::new(Arc::clone(&memory), Arc::clone(&interrupt));
        Self {
            memory,
            gpu,
            interrupt,
        }
    }

    #[inline]
    #[must_use]
    pub const fn memory(&self) -> &Arc<FakeMemory> {
        &self.memory
    }

    #[inline]
    #[must_use]
    pub const fn gpu(&self) -> &Arc<SimGpu> {
        &self.gpu
    }

    #[inline]
    #[must_use]
    pub const fn sim_interrupt(&self) -> &Arc<SimInterrupt> {
        &self.interrupt
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformDevice for SimPlatform {
    fn register_io(&self) -> Arc<dyn RegisterIo> {
        self.gpu.clone()
    }

    fn bus_mapper(&self) -> Arc<dyn BusMapper> {
        self.memory.clone()
    }

    fn buffer_allocator(&self) -> Arc<dyn BufferAllocator> {
        self.memory.clone()
    }

    fn interrupt(&self) -> Arc<dyn PlatformInterrupt> {
        self.interrupt.clone()
    }
}
