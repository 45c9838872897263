use crate::address_space::AddressSpace;
use crate::command_buffer::{CommandBuffer, CommandBufferDescriptor, ExecResource};
use crate::connection::MsdVslConnection;
use crate::error::MsdError;
use crate::gpu_mapping::GpuMapping;
use crate::mapped_batch::{EventBatch, MappedBatch, Semaphore};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// An execution context of one connection.
///
/// Shares the connection's address space and its mapping of the device ring
/// buffer. The connection is referenced weakly; a context outliving it can no
/// longer submit.
pub struct MsdVslContext {
    connection: Weak<MsdVslConnection>,
    address_space: Arc<AddressSpace>,
    ringbuffer_mapping: Arc<GpuMapping>,
    killed: AtomicBool,
}

impl MsdVslContext {
    pub(crate) fn new(
        connection: Weak<MsdVslConnection>,
        address_space: Arc<AddressSpace>,
        ringbuffer_mapping: Arc<GpuMapping>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            address_space,
            ringbuffer_mapping,
            killed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn connection(&self) -> Option<Arc<MsdVslConnection>> {
        self.connection.upgrade()
    }

    #[inline]
    #[must_use]
    pub const fn address_space(&self) -> &Arc<AddressSpace> {
        &self.address_space
    }

    #[inline]
    #[must_use]
    pub const fn ringbuffer_mapping(&self) -> &Arc<GpuMapping> {
        &self.ringbuffer_mapping
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Mark the context dead and notify its connection's client, once.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            "context of client {} killed",
            self.address_space.client_id()
        );
        if let Some(connection) = self.connection.upgrade() {
            connection.send_context_killed();
        }
    }

    /// Build a command buffer and resolve its resources.
    ///
    /// # Errors
    /// Layout violations and unmapped resources, see
    /// [`CommandBuffer::prepare_for_execution`].
    pub fn create_batch(
        self: &Arc<Self>,
        descriptor: CommandBufferDescriptor,
        resources: Vec<ExecResource>,
        wait_semaphores: Vec<Semaphore>,
        signal_semaphores: Vec<Semaphore>,
    ) -> Result<CommandBuffer, MsdError> {
        let mut batch = CommandBuffer::new(
            Arc::clone(self),
            descriptor,
            resources,
            wait_semaphores,
            signal_semaphores,
        );
        batch.prepare_for_execution()?;
        Ok(batch)
    }

    /// Queue `batch` on the device, preceded by any mapping releases the
    /// connection is holding back.
    ///
    /// # Errors
    /// - [`MsdError::ContextKilled`] after [`kill`](Self::kill).
    /// - [`MsdError::ConnectionGone`] / [`MsdError::DeviceGone`] during teardown.
    pub fn submit_batch(self: &Arc<Self>, batch: Box<dyn MappedBatch>) -> Result<(), MsdError> {
        if self.is_killed() {
            return Err(MsdError::ContextKilled);
        }
        let connection = self.connection.upgrade().ok_or(MsdError::ConnectionGone)?;
        connection.submit_pending_release_mappings(self)?;
        debug!(
            "client {}: submitting {} batch",
            connection.client_id(),
            if batch.is_command_buffer() {
                "command"
            } else {
                "event"
            }
        );
        connection.submit_batch(batch, false)
    }

    /// Submit a command buffer, or a semaphore-only batch when there are no
    /// resources.
    ///
    /// # Errors
    /// See [`create_batch`](Self::create_batch) and [`submit_batch`](Self::submit_batch).
    pub fn execute_command_buffer_with_resources(
        self: &Arc<Self>,
        descriptor: CommandBufferDescriptor,
        resources: Vec<ExecResource>,
        wait_semaphores: Vec<Semaphore>,
        signal_semaphores: Vec<Semaphore>,
    ) -> Result<(), MsdError> {
        if resources.is_empty() {
            let batch = EventBatch::new(Arc::clone(self), wait_semaphores, signal_semaphores);
            return self.submit_batch(Box::new(batch));
        }
        let batch = self.create_batch(descriptor, resources, wait_semaphores, signal_semaphores)?;
        self.submit_batch(Box::new(batch))
    }
}
