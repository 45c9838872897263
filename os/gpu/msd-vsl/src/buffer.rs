use gpu_platform::{BufferAllocator, PlatformBuffer, PlatformError};
use std::sync::Arc;

/// A client or driver buffer as seen by the core.
///
/// Shared as `Arc<MsdVslBuffer>`: every [`GpuMapping`](crate::GpuMapping) of
/// the buffer holds one strong reference.
pub struct MsdVslBuffer {
    platform_buffer: Arc<dyn PlatformBuffer>,
}

impl MsdVslBuffer {
    #[must_use]
    pub fn new(platform_buffer: Arc<dyn PlatformBuffer>) -> Arc<Self> {
        Arc::new(Self { platform_buffer })
    }

    /// Allocate a zeroed buffer of at least `size` bytes.
    ///
    /// # Errors
    /// Propagates the allocator's failure.
    pub fn create(
        allocator: &dyn BufferAllocator,
        size: u64,
        name: &str,
    ) -> Result<Arc<Self>, PlatformError> {
        Ok(Self::new(allocator.allocate(size, name)?))
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.platform_buffer.id()
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.platform_buffer.size()
    }

    #[inline]
    #[must_use]
    pub fn platform_buffer(&self) -> &Arc<dyn PlatformBuffer> {
        &self.platform_buffer
    }
}

impl core::fmt::Debug for MsdVslBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MsdVslBuffer")
            .field("id", &self.id())
            .field("name", &self.platform_buffer.name())
            .field("size", &self.size())
            .finish()
    }
}
