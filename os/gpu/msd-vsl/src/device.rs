//! # The Device
//!
//! [`MsdVslDevice`] owns the ring buffer, the MMU and the interrupt events,
//! and is the only writer of the ring.
//!
//! ## Idle loop and submission
//!
//! At rest the front end spins on a `WAIT` followed by a `LINK` back to it.
//! A submission appends new ring content and then turns that `WAIT` into a
//! `LINK` into the new work:
//!
//! ```text
//!  ring:  │ WAIT→LINK │ LINK │ preamble │ EVENT │ WAIT │ LINK │
//!              │                  │        ▲       ▲      │
//!              │   (only when     │        │       └──────┘ new idle loop
//!              │    needed)       ▼        │
//!              └───────────► command buffer … LINK
//! ```
//!
//! The optional preamble selects the batch's page-table slot and flushes
//! the MMU, then links into the command buffer. Without a preamble the old
//! `WAIT` links straight into the command buffer.
//!
//! The patch writes the `LINK` target first and, after a barrier, the
//! opcode dword, so the front end never fetches a `LINK` with a stale
//! target.
//!
//! ## Threads and locks
//!
//! Clients enqueue batches from any thread with
//! [`submit_batch`](ConnectionOwner::submit_batch). The device thread drains
//! the queue with [`process_request_queue`](MsdVslDevice::process_request_queue),
//! which also runs [`process_interrupt`](MsdVslDevice::process_interrupt)
//! when the interrupt thread has flagged one. Both threads hold only a
//! `Weak` reference to the device between iterations.
//!
//! | Lock | Guards |
//! |------|--------|
//! | `core` | ring buffer, events, current address space, sequence numbers |
//! | `requests` | queued batches, interrupt flag, shutdown flag |
//!
//! `core` is always taken before `requests`. Completed and failed batches
//! are dropped, and clients notified, only after `core` is released.

mod events;

use crate::address_space::{AddressSpace, AddressSpaceError};
use crate::buffer::MsdVslBuffer;
use crate::command_buffer::{CommandBufferError, prefetch_for};
use crate::config::DeviceConfig;
use crate::connection::{ConnectionOwner, MsdVslConnection};
use crate::error::{MsdError, Status, platform_status};
use crate::gpu_mapping::GpuMapping;
use crate::mapped_batch::MappedBatch;
use crate::mmu::Mmu;
use crate::ringbuffer::{Ringbuffer, RingbufferError};
use events::Events;
use gpu_addresses::GpuAddress;
use gpu_platform::{PlatformDevice, PlatformError, PlatformInterrupt, RegisterIo, barrier};
use gpu_registers::Register;
use gpu_registers::fetch_engine::{FeCommandAddress, FeCommandControl, FeDmaAddress};
use gpu_registers::idle::IdleState;
use gpu_registers::instructions::{
    INSTRUCTION_BYTES, end_header, flush_mmu, link, link_header, select_page_table_slot, wait,
};
use gpu_registers::irq::{IrqAck, IrqEnable};
use gpu_registers::mmu::{
    MmuControl, MmuPageTableArrayAddressHigh, MmuPageTableArrayAddressLow, MmuPageTableArrayControl,
};
use gpu_vmem::PageTableError;
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Client id of the device's own address space.
pub const DEVICE_CLIENT_ID: u64 = 0;

/// Prefetch of the idle loop's `LINK` back to its `WAIT`: the `WAIT` and the `LINK`.
const WAIT_LINK_PREFETCH: u16 = 2;

/// Prefetch of the `LINK` from a command buffer back into the ring: `EVENT`, `WAIT`, `LINK`.
const RETURN_PREFETCH: u16 = 3;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("no free interrupt event")]
    NoFreeEvent,
    #[error("event {0} does not exist")]
    InvalidEvent(u32),
    #[error("event {0} is not submitted")]
    EventNotSubmitted(u32),
    #[error("event {0} is not allocated")]
    EventNotAllocated(u32),
    #[error("batch of {length} bytes needs a prefetch above 16 bits")]
    PrefetchOverflow { length: u64 },
    #[error("GPU address {0} does not fit a LINK")]
    AddressOutOfRange(GpuAddress),
    #[error("device is shutting down")]
    ShuttingDown,
    #[error("failed to spawn {name} thread")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Ringbuffer(#[from] RingbufferError),
    #[error(transparent)]
    AddressSpace(#[from] AddressSpaceError),
    #[error(transparent)]
    PageTable(#[from] PageTableError),
    #[error(transparent)]
    CommandBuffer(#[from] CommandBufferError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl DeviceError {
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::InvalidConfig(_) | Self::PrefetchOverflow { .. } | Self::CommandBuffer(_) => {
                Status::InvalidArgs
            }
            Self::NoFreeEvent | Self::Ringbuffer(RingbufferError::Full { .. }) => {
                Status::MemoryError
            }
            Self::AddressSpace(e) => crate::error::address_space_status(e),
            Self::Platform(e) | Self::PageTable(PageTableError::Platform(e)) => platform_status(e),
            Self::InvalidEvent(_)
            | Self::EventNotSubmitted(_)
            | Self::EventNotAllocated(_)
            | Self::AddressOutOfRange(_)
            | Self::ShuttingDown
            | Self::ThreadSpawn { .. }
            | Self::Ringbuffer(_)
            | Self::PageTable(_) => Status::InternalError,
        }
    }
}

struct BatchRequest {
    batch: Box<dyn MappedBatch>,
    do_flush: bool,
}

#[derive(Default)]
struct RequestQueue {
    batches: VecDeque<BatchRequest>,
    /// A batch was queued since the device thread last looked.
    submitted: bool,
    interrupt_pending: bool,
    shutting_down: bool,
}

struct DeviceCore {
    ringbuffer: Ringbuffer,
    events: Events,
    /// Address space the front end currently translates through.
    current_address_space: Arc<AddressSpace>,
    /// Ring offset of the trailing `WAIT`.
    last_wait_offset: u32,
    next_sequence: u64,
    last_completed_sequence: u64,
    stopped: bool,
}

/// Outcome of writing one batch into the ring.
enum RingWrite {
    Submitted,
    /// Out of events or ring space; retry after completions.
    Deferred(Box<dyn MappedBatch>),
}

pub struct MsdVslDevice {
    config: DeviceConfig,
    register_io: Arc<dyn RegisterIo>,
    interrupt: Arc<dyn PlatformInterrupt>,
    mmu: Arc<Mmu>,
    address_space: Arc<AddressSpace>,
    ringbuffer_buffer: Arc<MsdVslBuffer>,
    // Keeps the ring mapped in the device address space.
    _ringbuffer_mapping: Arc<GpuMapping>,
    core: Mutex<DeviceCore>,
    requests: Mutex<RequestQueue>,
    request_signal: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<Self>,
}

impl MsdVslDevice {
    /// Bring up the MMU and the front end and start the idle loop.
    ///
    /// # Errors
    /// - [`DeviceError::InvalidConfig`] for a bad `config`.
    /// - Allocation, mapping and ring failures.
    pub fn create(
        platform: &dyn PlatformDevice,
        config: DeviceConfig,
    ) -> Result<Arc<Self>, DeviceError> {
        config.validate()?;
        let register_io = platform.register_io();
        let allocator = platform.buffer_allocator();

        let mmu = Mmu::new(
            Arc::clone(&allocator),
            platform.bus_mapper(),
            config.page_table_slots,
        )?;
        let address_space = mmu.create_address_space(DEVICE_CLIENT_ID)?;

        let ringbuffer_buffer =
            MsdVslBuffer::create(allocator.as_ref(), config.ringbuffer_size, "ringbuffer")?;
        let mut ringbuffer = Ringbuffer::new(Arc::clone(&ringbuffer_buffer), config.ringbuffer_size)?;
        let ringbuffer_mapping = ringbuffer.map(&address_space, config.ringbuffer_gpu_addr)?;
        let ring_gpu = link_address(config.ringbuffer_gpu_addr)?;

        let pta = mmu.page_table_arrays().bus_address().as_u64();
        #[allow(clippy::cast_possible_truncation)]
        {
            MmuPageTableArrayAddressLow::new()
                .with_address(pta as u32)
                .store(register_io.as_ref());
            MmuPageTableArrayAddressHigh::new()
                .with_address((pta >> 32) as u32)
                .store(register_io.as_ref());
            MmuPageTableArrayControl::new()
                .with_slot(address_space.page_table_array_slot() as u16)
                .store(register_io.as_ref());
        }
        MmuControl::new().with_enable(true).store(register_io.as_ref());
        IrqEnable::all().store(register_io.as_ref());

        // WAIT at offset 0, LINK back to it.
        ringbuffer.write_instruction(wait(config.wait_cycles))?;
        ringbuffer.write_instruction(link(WAIT_LINK_PREFETCH, ring_gpu))?;
        FeCommandAddress::new()
            .with_address(ring_gpu)
            .store(register_io.as_ref());
        FeCommandControl::new()
            .with_prefetch(WAIT_LINK_PREFETCH)
            .with_enable(true)
            .store(register_io.as_ref());
        info!(
            "ring buffer of {:#x} bytes started at {}",
            config.ringbuffer_size, config.ringbuffer_gpu_addr
        );

        let core = DeviceCore {
            ringbuffer,
            events: Events::new(config.event_count),
            current_address_space: Arc::clone(&address_space),
            last_wait_offset: 0,
            next_sequence: 1,
            last_completed_sequence: 0,
            stopped: false,
        };
        Ok(Arc::new_cyclic(|self_ref| Self {
            config,
            register_io,
            interrupt: platform.interrupt(),
            mmu,
            address_space,
            ringbuffer_buffer,
            _ringbuffer_mapping: ringbuffer_mapping,
            core: Mutex::new(core),
            requests: Mutex::new(RequestQueue::default()),
            request_signal: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        }))
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The device's own address space.
    #[inline]
    #[must_use]
    pub const fn address_space(&self) -> &Arc<AddressSpace> {
        &self.address_space
    }

    #[inline]
    #[must_use]
    pub const fn ringbuffer_buffer(&self) -> &Arc<MsdVslBuffer> {
        &self.ringbuffer_buffer
    }

    #[inline]
    #[must_use]
    pub const fn ringbuffer_gpu_address(&self) -> GpuAddress {
        self.config.ringbuffer_gpu_addr
    }

    /// Open a connection with its own address space.
    ///
    /// # Errors
    /// No free page-table slot, or failure to map the ring buffer.
    pub fn open(&self, client_id: u64) -> Result<Arc<MsdVslConnection>, DeviceError> {
        let address_space = self.mmu.create_address_space(client_id)?;
        let ringbuffer_mapping = self
            .core
            .lock()
            .ringbuffer
            .map(&address_space, self.config.ringbuffer_gpu_addr)?;
        let owner: Weak<dyn ConnectionOwner> = self.self_ref.clone();
        Ok(MsdVslConnection::new(
            owner,
            client_id,
            address_space,
            ringbuffer_mapping,
        ))
    }

    /// Spawn the device and interrupt threads.
    ///
    /// # Errors
    /// [`DeviceError::ThreadSpawn`] if a thread cannot be created.
    pub fn start(&self) -> Result<(), DeviceError> {
        let device = self.self_ref.clone();
        let device_thread = std::thread::Builder::new()
            .name("msd-vsl-device".into())
            .spawn(move || device_thread_loop(&device))
            .map_err(|source| DeviceError::ThreadSpawn {
                name: "device",
                source,
            })?;
        self.threads.lock().push(device_thread);

        let device = self.self_ref.clone();
        let interrupt = Arc::clone(&self.interrupt);
        let interrupt_thread = std::thread::Builder::new()
            .name("msd-vsl-interrupt".into())
            .spawn(move || interrupt_thread_loop(&device, interrupt.as_ref()))
            .map_err(|source| DeviceError::ThreadSpawn {
                name: "interrupt",
                source,
            })?;
        self.threads.lock().push(interrupt_thread);

        info!("device threads started");
        Ok(())
    }

    /// Stop the ring, drop queued work and join the device threads.
    pub fn shutdown(&self) {
        {
            let mut core = self.core.lock();
            if let Err(e) = Self::stop_ringbuffer(&mut core) {
                error!("failed to stop ring buffer: {e}");
            }
        }
        let abandoned = {
            let mut requests = self.requests.lock();
            requests.shutting_down = true;
            core::mem::take(&mut requests.batches)
        };
        self.request_signal.notify_all();
        self.interrupt.signal();
        if !abandoned.is_empty() {
            warn!("dropping {} queued batches at shutdown", abandoned.len());
        }
        drop(abandoned);

        let threads = core::mem::take(&mut *self.threads.lock());
        let current = std::thread::current().id();
        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }
            let name = thread.thread().name().unwrap_or("unnamed").to_owned();
            if thread.join().is_err() {
                error!("{name} thread panicked");
            }
        }
        info!("device shut down");
    }

    /// `StopRingbuffer`: turn the trailing `WAIT` into an `END`.
    fn stop_ringbuffer(core: &mut DeviceCore) -> Result<(), DeviceError> {
        if core.stopped {
            return Ok(());
        }
        let dwords = core.ringbuffer.dwords_since(core.last_wait_offset);
        core.ringbuffer.overwrite32(dwords, end_header())?;
        core.stopped = true;
        info!("ring buffer stopped at {:#x}", core.last_wait_offset);
        Ok(())
    }

    /// Run queued requests: a flagged interrupt first, then every batch at
    /// the front of the queue whose wait semaphores are signalled.
    ///
    /// Returns the number of batches written to the ring. A batch that fails
    /// is dropped and its context killed.
    pub fn process_request_queue(&self) -> usize {
        let interrupt_pending = {
            let mut requests = self.requests.lock();
            requests.submitted = false;
            core::mem::take(&mut requests.interrupt_pending)
        };
        if interrupt_pending {
            if let Err(e) = self.process_interrupt() {
                error!("interrupt processing failed: {e}");
            }
        }

        let mut submitted = 0;
        let mut failed = Vec::new();
        {
            let mut core = self.core.lock();
            loop {
                let request = {
                    let mut requests = self.requests.lock();
                    match requests.batches.front() {
                        Some(request) if request.batch.is_ready() => requests.batches.pop_front(),
                        _ => None,
                    }
                };
                let Some(BatchRequest { batch, do_flush }) = request else {
                    break;
                };

                let context = Arc::clone(batch.context());
                match self.write_batch(&mut core, batch, do_flush) {
                    Ok(RingWrite::Submitted) => submitted += 1,
                    Ok(RingWrite::Deferred(batch)) => {
                        trace!("batch deferred until events complete");
                        self.requests
                            .lock()
                            .batches
                            .push_front(BatchRequest { batch, do_flush });
                        break;
                    }
                    Err(e) => {
                        error!("batch submission failed: {e}");
                        failed.push(context);
                    }
                }
            }
        }
        for context in failed {
            context.kill();
        }
        submitted
    }

    /// Write `batch` into the ring and link the previous `WAIT` to it.
    fn write_batch(
        &self,
        core: &mut DeviceCore,
        mut batch: Box<dyn MappedBatch>,
        do_flush: bool,
    ) -> Result<RingWrite, DeviceError> {
        if core.stopped {
            return Err(DeviceError::ShuttingDown);
        }
        let event_id = match core.events.alloc() {
            Ok(id) => id,
            Err(DeviceError::NoFreeEvent) => return Ok(RingWrite::Deferred(batch)),
            Err(e) => return Err(e),
        };

        match self.write_batch_with_event(core, batch.as_mut(), do_flush, event_id) {
            Ok(Some(wait_offset)) => {
                let address_space = Arc::clone(batch.address_space());
                let sequence_number = core.next_sequence;
                core.next_sequence += 1;
                batch.set_sequence_number(sequence_number);
                for semaphore in batch.wait_semaphores() {
                    semaphore.reset();
                }
                core.events.submit(event_id, batch, wait_offset)?;
                core.current_address_space = address_space;
                debug!("batch {sequence_number} submitted with event {event_id}");
                Ok(RingWrite::Submitted)
            }
            Ok(None) => {
                core.events.free(event_id)?;
                Ok(RingWrite::Deferred(batch))
            }
            Err(e) => {
                core.events.free(event_id)?;
                Err(e)
            }
        }
    }

    /// Returns the ring offset of the new trailing `WAIT`, or `None` if the
    /// ring has no room yet.
    fn write_batch_with_event(
        &self,
        core: &mut DeviceCore,
        batch: &mut dyn MappedBatch,
        do_flush: bool,
        event_id: u32,
    ) -> Result<Option<u32>, DeviceError> {
        let ring_gpu = self.config.ringbuffer_gpu_addr;
        let switch = !Arc::ptr_eq(&core.current_address_space, batch.address_space());

        let mut preamble = Vec::with_capacity(3);
        if switch {
            #[allow(clippy::cast_possible_truncation)]
            let slot = batch.address_space().page_table_array_slot() as u16;
            preamble.push(select_page_table_slot(slot));
        }
        if switch || do_flush {
            preamble.push(flush_mmu());
        }

        let batch_target = match batch.gpu_address() {
            Some(gpu_addr) => {
                let length = batch.length();
                let prefetch = prefetch_for(length).ok_or(DeviceError::PrefetchOverflow { length })?;
                Some((link_address(gpu_addr)?, prefetch))
            }
            None => None,
        };
        if let Some((address, prefetch)) = batch_target {
            if !preamble.is_empty() {
                preamble.push(link(prefetch, address));
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let preamble_len = preamble.len() as u32;
        let total = (preamble_len + 3) * INSTRUCTION_BYTES;
        match core.ringbuffer.reserve_contiguous(total) {
            Ok(()) => {}
            Err(RingbufferError::Full { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let start = core.ringbuffer.tail();
        let event_offset = start + preamble_len * INSTRUCTION_BYTES;
        let wait_offset = event_offset + INSTRUCTION_BYTES;
        let start_gpu = ring_gpu + u64::from(start);
        let event_gpu = ring_gpu + u64::from(event_offset);
        let wait_gpu = link_address(ring_gpu + u64::from(wait_offset))?;

        batch.write_link(RETURN_PREFETCH, event_gpu)?;
        for instruction in preamble {
            core.ringbuffer.write_instruction(instruction)?;
        }
        core.events.write(&mut core.ringbuffer, event_id)?;
        core.ringbuffer.write_instruction(wait(self.config.wait_cycles))?;
        core.ringbuffer
            .write_instruction(link(WAIT_LINK_PREFETCH, wait_gpu))?;

        #[allow(clippy::cast_possible_truncation)]
        let (target, prefetch) = match batch_target {
            Some((address, prefetch)) if preamble_len == 0 => (address, prefetch),
            Some(_) => (link_address(start_gpu)?, preamble_len as u16),
            None => (link_address(start_gpu)?, (preamble_len + 3) as u16),
        };

        // Target first, then the opcode that makes it reachable.
        let dwords = core.ringbuffer.dwords_since(core.last_wait_offset);
        core.ringbuffer.overwrite32(dwords - 1, target)?;
        barrier();
        core.ringbuffer.overwrite32(dwords, link_header(prefetch))?;
        debug!(
            "WAIT at {:#x} linked to {target:#x} (prefetch {prefetch}); event {event_id}, new WAIT at {wait_offset:#x}",
            core.last_wait_offset
        );
        core.last_wait_offset = wait_offset;
        Ok(Some(wait_offset))
    }

    /// Acknowledge the interrupt, complete fired events in submission order
    /// and signal their semaphores.
    ///
    /// On a bus error or MMU exception the oldest batch still in flight after
    /// that is the one the front end stopped in. It is retired without
    /// signalling, its context is killed, and the front end restarts at the
    /// ring position following it, so work queued behind it still runs.
    ///
    /// # Errors
    /// Ring bookkeeping failures; the interrupt is re-armed regardless.
    pub fn process_interrupt(&self) -> Result<(), DeviceError> {
        let ack = IrqAck::load(self.register_io.as_ref());
        trace!("interrupt {:#010x}", ack.into_bits());

        let mut completed = Vec::new();
        let mut faulted = None;
        let result = {
            let mut core = self.core.lock();
            let result = Self::complete_events(&mut core, ack, &mut completed);
            if ack.has_error() {
                error!(
                    "GPU fault (bus error: {}, MMU exception: {}) at {:#x}",
                    ack.bus_error(),
                    ack.mmu_exception(),
                    FeDmaAddress::load(self.register_io.as_ref()).address()
                );
                match self.recover_from_fault(&mut core) {
                    Ok(batch) => faulted = batch,
                    Err(e) => error!("failed to restart the front end: {e}"),
                }
            }
            result
        };

        for mut batch in completed {
            let semaphores = batch.take_signal_semaphores();
            drop(batch);
            for semaphore in semaphores {
                semaphore.signal();
            }
        }
        if let Some(batch) = faulted {
            let context = Arc::clone(batch.context());
            drop(batch);
            context.kill();
        }
        self.interrupt.complete();
        result
    }

    /// Retire the batch the front end faulted in and restart fetching at the
    /// `WAIT` that follows it.
    fn recover_from_fault(
        &self,
        core: &mut DeviceCore,
    ) -> Result<Option<Box<dyn MappedBatch>>, DeviceError> {
        let Some(id) = core.events.inflight().next() else {
            self.restart_front_end(core.last_wait_offset)?;
            return Ok(None);
        };
        let event = core.events.complete(id)?;
        core.ringbuffer.update_head(event.ring_offset)?;
        core.last_completed_sequence = event.batch.sequence_number();
        warn!(
            "batch {} faulted; event {id} retired",
            core.last_completed_sequence
        );
        self.restart_front_end(event.ring_offset)?;
        Ok(Some(event.batch))
    }

    /// Point the front end at the `WAIT` at ring `offset`. The `WAIT` may
    /// already be patched into a `LINK` to later work.
    fn restart_front_end(&self, offset: u32) -> Result<(), DeviceError> {
        let address = link_address(self.config.ringbuffer_gpu_addr + u64::from(offset))?;
        FeCommandAddress::new()
            .with_address(address)
            .store(self.register_io.as_ref());
        FeCommandControl::new()
            .with_prefetch(WAIT_LINK_PREFETCH)
            .with_enable(true)
            .store(self.register_io.as_ref());
        info!("front end restarted at {address:#x}");
        Ok(())
    }

    fn complete_events(
        core: &mut DeviceCore,
        ack: IrqAck,
        completed: &mut Vec<Box<dyn MappedBatch>>,
    ) -> Result<(), DeviceError> {
        let fired: Vec<u32> = core
            .events
            .inflight()
            .filter(|&id| ack.is_event_set(id))
            .collect();
        let mut stray = ack.events();
        for id in fired {
            let event = core.events.complete(id)?;
            core.ringbuffer.update_head(event.ring_offset)?;
            core.last_completed_sequence = event.batch.sequence_number();
            trace!(
                "event {id} completed batch {}",
                core.last_completed_sequence
            );
            completed.push(event.batch);
            stray &= !(1 << id);
        }

        if stray != 0 {
            warn!("interrupt events {stray:#x} fired without a submission");
            return Err(DeviceError::EventNotSubmitted(stray.trailing_zeros()));
        }
        Ok(())
    }

    /// `true` when the front end is idle on its trailing `WAIT`.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        IdleState::load(self.register_io.as_ref()).is_idle()
    }

    /// Where the front end is fetching.
    #[must_use]
    pub fn dma_address(&self) -> GpuAddress {
        GpuAddress::new(u64::from(
            FeDmaAddress::load(self.register_io.as_ref()).address(),
        ))
    }

    #[must_use]
    pub fn last_completed_sequence(&self) -> u64 {
        self.core.lock().last_completed_sequence
    }

    /// Batches written to the ring whose event has not fired.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.core.lock().events.inflight_count()
    }

    /// Batches queued but not yet written to the ring.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.requests.lock().batches.len()
    }

    /// Ring offset of the trailing `WAIT` and the ring's `(head, tail)`.
    #[must_use]
    pub fn ringbuffer_state(&self) -> (u32, u32, u32) {
        let core = self.core.lock();
        (
            core.last_wait_offset,
            core.ringbuffer.head(),
            core.ringbuffer.tail(),
        )
    }
}

impl ConnectionOwner for MsdVslDevice {
    fn submit_batch(&self, batch: Box<dyn MappedBatch>, do_flush: bool) -> Result<(), MsdError> {
        let mut requests = self.requests.lock();
        if requests.shutting_down {
            return Err(DeviceError::ShuttingDown.into());
        }
        requests.batches.push_back(BatchRequest { batch, do_flush });
        requests.submitted = true;
        self.request_signal.notify_one();
        Ok(())
    }
}

impl Drop for MsdVslDevice {
    fn drop(&mut self) {
        self.requests.get_mut().shutting_down = true;
        self.request_signal.notify_all();
        self.interrupt.signal();
    }
}

fn link_address(gpu_addr: GpuAddress) -> Result<u32, DeviceError> {
    gpu_addr
        .to_u32()
        .ok_or(DeviceError::AddressOutOfRange(gpu_addr))
}

fn device_thread_loop(device: &Weak<MsdVslDevice>) {
    debug!("device thread running");
    while let Some(device) = device.upgrade() {
        {
            let mut requests = device.requests.lock();
            if requests.shutting_down {
                break;
            }
            if !requests.submitted && !requests.interrupt_pending {
                device
                    .request_signal
                    .wait_for(&mut requests, device.config.request_poll_interval);
            }
            if requests.shutting_down {
                break;
            }
        }
        device.process_request_queue();
    }
    debug!("device thread exiting");
}

fn interrupt_thread_loop(device: &Weak<MsdVslDevice>, interrupt: &dyn PlatformInterrupt) {
    debug!("interrupt thread running");
    while interrupt.wait() {
        let Some(device) = device.upgrade() else {
            break;
        };
        let mut requests = device.requests.lock();
        if requests.shutting_down {
            break;
        }
        requests.interrupt_pending = true;
        device.request_signal.notify_one();
    }
    debug!("interrupt thread exiting");
}
