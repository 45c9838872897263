//! # Client Connections
//!
//! A connection owns one client's address space and arbitrates between
//! "unmap this now" from the client and "the GPU may still read it" from
//! in-flight work.
//!
//! Releasing a mapping removes it from the address space right away, so no
//! new batch can resolve it. What happens to its pages depends on who else
//! still holds the [`GpuMapping`]:
//!
//! | Other holders | Result |
//! |---------------|--------|
//! | none | page-table entries cleared, bus mapping parked on the pending list |
//! | an in-flight batch | `ContextKilled` notification, mapping left to the batch |
//!
//! Parked bus mappings ride on a [`MappingReleaseBatch`] that is submitted
//! with a TLB flush ahead of the client's next batch; they are unpinned only
//! after that flush has executed.

use crate::address_space::AddressSpace;
use crate::buffer::MsdVslBuffer;
use crate::context::MsdVslContext;
use crate::error::MsdError;
use crate::gpu_mapping::GpuMapping;
use crate::mapped_batch::{MappedBatch, MappingReleaseBatch};
use gpu_addresses::GpuAddress;
use gpu_platform::BusMapping;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Receives the batches of a connection; implemented by the device.
pub trait ConnectionOwner: Send + Sync {
    /// # Errors
    /// Implementation specific; the batch is dropped on error.
    fn submit_batch(&self, batch: Box<dyn MappedBatch>, do_flush: bool) -> Result<(), MsdError>;
}

/// Asynchronous notifications to the client.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Notification {
    ContextKilled,
}

pub type NotificationCallback = Arc<dyn Fn(Notification) + Send + Sync>;

pub struct MsdVslConnection {
    owner: Weak<dyn ConnectionOwner>,
    client_id: u64,
    address_space: Arc<AddressSpace>,
    ringbuffer_mapping: Arc<GpuMapping>,
    mappings_to_release: Mutex<Vec<Box<dyn BusMapping>>>,
    notification: Mutex<Option<NotificationCallback>>,
}

impl MsdVslConnection {
    /// `ringbuffer_mapping` is the device ring mapped into `address_space`.
    #[must_use]
    pub fn new(
        owner: Weak<dyn ConnectionOwner>,
        client_id: u64,
        address_space: Arc<AddressSpace>,
        ringbuffer_mapping: Arc<GpuMapping>,
    ) -> Arc<Self> {
        info!("connection for client {client_id} opened");
        Arc::new(Self {
            owner,
            client_id,
            address_space,
            ringbuffer_mapping,
            mappings_to_release: Mutex::new(Vec::new()),
            notification: Mutex::new(None),
        })
    }

    #[inline]
    #[must_use]
    pub const fn client_id(&self) -> u64 {
        self.client_id
    }

    #[inline]
    #[must_use]
    pub const fn address_space(&self) -> &Arc<AddressSpace> {
        &self.address_space
    }

    #[must_use]
    pub fn create_context(self: &Arc<Self>) -> Arc<MsdVslContext> {
        MsdVslContext::new(
            Arc::downgrade(self),
            Arc::clone(&self.address_space),
            Arc::clone(&self.ringbuffer_mapping),
        )
    }

    /// Map `page_count` pages of `buffer` at `gpu_addr`.
    ///
    /// # Errors
    /// Overlaps, bad page ranges and platform failures, see
    /// [`AddressSpace::map_buffer_gpu`].
    pub fn map_buffer_gpu(
        &self,
        buffer: &Arc<MsdVslBuffer>,
        gpu_addr: GpuAddress,
        page_offset: u64,
        page_count: u64,
    ) -> Result<(), MsdError> {
        self.address_space
            .map_buffer_gpu(buffer, gpu_addr, page_offset, page_count)?;
        Ok(())
    }

    /// Unmap the mapping of `buffer` at `gpu_addr`.
    ///
    /// Sends a `ContextKilled` notification if in-flight work still
    /// references the mapping; that is a client error, not a failure of this
    /// call.
    ///
    /// # Errors
    /// [`AddressSpaceError::NotFound`](crate::AddressSpaceError::NotFound) if there is no such mapping.
    pub fn release_mapping(
        &self,
        buffer: &MsdVslBuffer,
        gpu_addr: GpuAddress,
    ) -> Result<(), MsdError> {
        let mapping = self.address_space.remove_mapping(buffer, gpu_addr)?;
        if self.release_removed(mapping) {
            self.send_context_killed();
        }
        Ok(())
    }

    /// Unmap every mapping of `buffer`, e.g. because the client destroyed it.
    ///
    /// Sends at most one `ContextKilled` notification however many of the
    /// mappings were still referenced. Returns the number released.
    pub fn release_buffer(&self, buffer: &MsdVslBuffer) -> usize {
        let mappings = self.address_space.release_buffer(buffer);
        let count = mappings.len();
        if count > 0 {
            debug!(
                "client {}: buffer {} destroyed with {count} mappings",
                self.client_id,
                buffer.id()
            );
        }
        let killed = mappings
            .into_iter()
            .fold(false, |killed, mapping| self.release_removed(mapping) | killed);
        if killed {
            self.send_context_killed();
        }
        count
    }

    /// Returns `true` if the mapping was still shared.
    fn release_removed(&self, mapping: Arc<GpuMapping>) -> bool {
        match Arc::try_unwrap(mapping) {
            Ok(mapping) => {
                if let Some(bus_mapping) = mapping.release() {
                    self.mappings_to_release.lock().push(bus_mapping);
                }
                false
            }
            Err(mapping) => {
                warn!(
                    "client {}: released mapping at {} is still in use ({} references)",
                    self.client_id,
                    mapping.gpu_addr(),
                    Arc::strong_count(&mapping)
                );
                true
            }
        }
    }

    /// Bus mappings waiting for a flush before they can be unpinned.
    #[must_use]
    pub fn pending_release_count(&self) -> usize {
        self.mappings_to_release.lock().len()
    }

    /// Submit the pending bus mappings on a flushing [`MappingReleaseBatch`].
    /// Does nothing when none are pending.
    ///
    /// # Errors
    /// [`MsdError::DeviceGone`] or the device's submission failure.
    pub fn submit_pending_release_mappings(
        &self,
        context: &Arc<MsdVslContext>,
    ) -> Result<(), MsdError> {
        let mappings = core::mem::take(&mut *self.mappings_to_release.lock());
        if mappings.is_empty() {
            return Ok(());
        }
        debug!(
            "client {}: flushing {} released mappings",
            self.client_id,
            mappings.len()
        );
        let batch = MappingReleaseBatch::new(Arc::clone(context), mappings);
        self.submit_batch(Box::new(batch), true)
    }

    /// Hand `batch` to the device.
    ///
    /// # Errors
    /// [`MsdError::DeviceGone`] or the device's submission failure.
    pub fn submit_batch(&self, batch: Box<dyn MappedBatch>, do_flush: bool) -> Result<(), MsdError> {
        let owner = self.owner.upgrade().ok_or(MsdError::DeviceGone)?;
        owner.submit_batch(batch, do_flush)
    }

    /// Install (or with `None`, remove) the notification callback.
    pub fn set_notification_callback(&self, callback: Option<NotificationCallback>) {
        *self.notification.lock() = callback;
    }

    /// Tell the client its context is dead. Every call notifies.
    ///
    /// Only the callback runs: contexts keep accepting submissions, and
    /// tearing the connection down is up to its owner.
    pub fn send_context_killed(&self) {
        warn!("client {}: context killed", self.client_id);
        let callback = self.notification.lock().clone();
        if let Some(callback) = callback {
            callback(Notification::ContextKilled);
        }
    }
}

impl Drop for MsdVslConnection {
    fn drop(&mut self) {
        info!("connection for client {} closed", self.client_id);
    }
}
