use gpu_addresses::{GpuAddress, PAGE_SIZE};
use gpu_platform::PlatformSemaphore;
use gpu_platform::fake::FakeSemaphore;
use gpu_registers::instructions::{Instruction, link, load_state};
use gpu_sim::{Fault, FrontEnd, SimLogger, SimPlatform};
use log::LevelFilter;
use msd_vsl::{
    AddressSpaceError, CommandBufferDescriptor, DeviceConfig, DeviceError, ExecResource,
    MsdError, MsdVslBuffer, MsdVslConnection, MsdVslContext, MsdVslDevice, Notification,
    NotificationCallback, Semaphore, Status,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const BATCH_VA: u64 = 0x10000;

fn device_with(config: DeviceConfig) -> (SimPlatform, Arc<MsdVslDevice>) {
    let _ = SimLogger::new(LevelFilter::Debug).init();
    let platform = SimPlatform::new();
    let device = MsdVslDevice::create(&platform, config).unwrap();
    assert_eq!(platform.gpu().run_until_idle(), FrontEnd::Waiting);
    (platform, device)
}

fn device() -> (SimPlatform, Arc<MsdVslDevice>) {
    device_with(DeviceConfig::new())
}

/// A one-page batch buffer holding `instructions`, mapped at [`BATCH_VA`].
fn batch_buffer(
    platform: &SimPlatform,
    connection: &MsdVslConnection,
    instructions: &[[u32; 2]],
) -> Arc<MsdVslBuffer> {
    let buffer = MsdVslBuffer::create(platform.memory().as_ref(), PAGE_SIZE, "batch").unwrap();
    for (i, words) in (0u64..).zip(instructions) {
        buffer.platform_buffer().write_u32(i * 8, words[0]).unwrap();
        buffer.platform_buffer().write_u32(i * 8 + 4, words[1]).unwrap();
    }
    connection
        .map_buffer_gpu(&buffer, GpuAddress::new(BATCH_VA), 0, 1)
        .unwrap();
    buffer
}

fn submit(
    context: &Arc<MsdVslContext>,
    buffer: &Arc<MsdVslBuffer>,
    length: u64,
    signal: &Arc<FakeSemaphore>,
) -> Result<(), MsdError> {
    let signal: Semaphore = signal.clone();
    context.execute_command_buffer_with_resources(
        CommandBufferDescriptor {
            batch_buffer_resource_index: 0,
            batch_start_offset: 0,
            batch_length: length,
        },
        vec![ExecResource {
            buffer: Arc::clone(buffer),
            offset: 0,
            length: buffer.size(),
        }],
        Vec::new(),
        vec![signal],
    )
}

fn submit_event(context: &Arc<MsdVslContext>, wait: Vec<Semaphore>, signal: Vec<Semaphore>) {
    context
        .execute_command_buffer_with_resources(
            CommandBufferDescriptor::default(),
            Vec::new(),
            wait,
            signal,
        )
        .unwrap();
}

fn kill_counter(connection: &MsdVslConnection) -> Arc<AtomicUsize> {
    let kills = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&kills);
    let callback: NotificationCallback = Arc::new(move |notification| {
        assert_eq!(notification, Notification::ContextKilled);
        counter.fetch_add(1, Ordering::SeqCst);
    });
    connection.set_notification_callback(Some(callback));
    kills
}

#[test]
fn command_buffer_runs_and_links_back() {
    let (platform, device) = device();
    let connection = device.open(1).unwrap();
    let context = connection.create_context();
    let buffer = batch_buffer(&platform, &connection, &[load_state(0x0700, 0x1234_5678)]);
    let done = FakeSemaphore::new();

    submit(&context, &buffer, 8, &done).unwrap();
    assert_eq!(device.queued_count(), 1);
    assert_eq!(device.process_request_queue(), 1);
    assert_eq!(device.inflight_count(), 1);
    assert!(!device.is_idle());

    assert_eq!(platform.gpu().run_until_idle(), FrontEnd::Waiting);
    assert!(device.is_idle());
    assert_eq!(platform.gpu().register(0x0700), 0x1234_5678);
    // Switching to the client's address space flushed the MMU.
    assert_eq!(platform.gpu().flush_count(), 1);

    assert!(!done.is_signaled());
    device.process_interrupt().unwrap();
    assert!(done.is_signaled());
    assert_eq!(device.inflight_count(), 0);
    assert_eq!(device.last_completed_sequence(), 1);

    // Parked on the ring's new trailing WAIT, not inside the batch.
    let (last_wait, head, _) = device.ringbuffer_state();
    assert_eq!(head, last_wait);
    let ring = device.ringbuffer_gpu_address().as_u64();
    let dma = device.dma_address().as_u64();
    assert_eq!(dma, ring + u64::from(last_wait));
    assert!(!(BATCH_VA..BATCH_VA + PAGE_SIZE).contains(&dma));

    let ring_buffer = device.ringbuffer_buffer().platform_buffer();
    let offset = u64::from(last_wait);
    let words = [
        ring_buffer.read_u32(offset).unwrap(),
        ring_buffer.read_u32(offset + 4).unwrap(),
    ];
    assert!(matches!(
        Instruction::decode(words),
        Ok(Instruction::Wait { .. })
    ));
}

#[test]
fn duplicate_mapping_is_rejected() {
    let (platform, device) = device();
    let connection = device.open(1).unwrap();
    let allocator = platform.memory().as_ref();
    let first = MsdVslBuffer::create(allocator, 2 * PAGE_SIZE, "first").unwrap();
    let second = MsdVslBuffer::create(allocator, 2 * PAGE_SIZE, "second").unwrap();
    let at = GpuAddress::new(0x1000);

    connection.map_buffer_gpu(&first, at, 0, 2).unwrap();
    let before = connection.address_space().mapping_count();
    let err = connection.map_buffer_gpu(&second, at, 0, 2).unwrap_err();
    assert!(matches!(
        err,
        MsdError::AddressSpace(AddressSpaceError::Overlap { .. })
    ));
    assert_eq!(err.status(), Status::InvalidArgs);

    let address_space = connection.address_space();
    assert_eq!(address_space.mapping_count(), before);
    let mapping = address_space.mapping_at(at + PAGE_SIZE).unwrap();
    assert_eq!(mapping.buffer().id(), first.id());
    assert!(address_space.find_mapping(&first, 0, 2 * PAGE_SIZE).is_some());
    assert!(address_space.find_mapping(&second, 0, PAGE_SIZE).is_none());
    assert!(address_space.translate(at).is_some());
}

#[test]
fn released_mapping_is_unpinned_after_flush() {
    let (platform, device) = device();
    let connection = device.open(1).unwrap();
    let context = connection.create_context();
    let kills = kill_counter(&connection);
    let buffer = batch_buffer(&platform, &connection, &[]);
    let memory = platform.memory();
    let pinned = memory.live_mapping_count();

    connection
        .release_mapping(&buffer, GpuAddress::new(BATCH_VA))
        .unwrap();
    assert_eq!(kills.load(Ordering::SeqCst), 0);
    assert_eq!(connection.pending_release_count(), 1);
    assert!(connection.address_space().translate(GpuAddress::new(BATCH_VA)).is_none());
    assert_eq!(memory.live_mapping_count(), pinned);

    // The next submission carries the release on a flushing batch.
    submit_event(&context, Vec::new(), Vec::new());
    assert_eq!(connection.pending_release_count(), 0);
    assert_eq!(device.process_request_queue(), 2);
    assert_eq!(memory.live_mapping_count(), pinned);

    let flushes = platform.gpu().flush_count();
    platform.gpu().run_until_idle();
    assert_eq!(platform.gpu().flush_count(), flushes + 1);
    device.process_interrupt().unwrap();
    assert_eq!(device.last_completed_sequence(), 2);
    assert_eq!(memory.live_mapping_count(), pinned - 1);
}

#[test]
fn release_of_busy_mapping_waits_for_the_batch() {
    let (platform, device) = device();
    let connection = device.open(1).unwrap();
    let context = connection.create_context();
    let kills = kill_counter(&connection);
    let buffer = batch_buffer(&platform, &connection, &[load_state(0x0700, 7)]);
    let memory = platform.memory();
    let done = FakeSemaphore::new();

    submit(&context, &buffer, 8, &done).unwrap();
    assert_eq!(device.process_request_queue(), 1);
    let pinned = memory.live_mapping_count();

    connection
        .release_mapping(&buffer, GpuAddress::new(BATCH_VA))
        .unwrap();
    assert_eq!(kills.load(Ordering::SeqCst), 1);
    assert_eq!(connection.pending_release_count(), 0);
    assert_eq!(memory.live_mapping_count(), pinned);

    platform.gpu().run_until_idle();
    device.process_interrupt().unwrap();
    assert!(done.is_signaled());
    assert_eq!(memory.live_mapping_count(), pinned - 1);
}

#[test]
fn gpu_fault_kills_the_oldest_context() {
    let (platform, device) = device();
    let connection = device.open(1).unwrap();
    let context = connection.create_context();
    let kills = kill_counter(&connection);
    let buffer = batch_buffer(&platform, &connection, &[link(1, 0x0080_0000)]);
    let done = FakeSemaphore::new();

    submit(&context, &buffer, 8, &done).unwrap();
    device.process_request_queue();
    assert!(matches!(
        platform.gpu().run_until_idle(),
        FrontEnd::Faulted(Fault::Translation(_))
    ));

    device.process_interrupt().unwrap();
    assert!(context.is_killed());
    assert_eq!(kills.load(Ordering::SeqCst), 1);
    assert!(!done.is_signaled());
    assert!(matches!(
        submit(&context, &buffer, 8, &done),
        Err(MsdError::ContextKilled)
    ));
}

#[test]
fn fault_kills_only_the_offending_context() {
    let (platform, device) = device();
    let good_connection = device.open(1).unwrap();
    let good_context = good_connection.create_context();
    let good_kills = kill_counter(&good_connection);
    let good_buffer = batch_buffer(&platform, &good_connection, &[load_state(0x0700, 5)]);
    let bad_connection = device.open(2).unwrap();
    let bad_context = bad_connection.create_context();
    let bad_kills = kill_counter(&bad_connection);
    let bad_buffer = batch_buffer(&platform, &bad_connection, &[link(1, 0x0080_0000)]);
    let good_done = FakeSemaphore::new();
    let bad_done = FakeSemaphore::new();

    submit(&good_context, &good_buffer, 8, &good_done).unwrap();
    submit(&bad_context, &bad_buffer, 8, &bad_done).unwrap();
    assert_eq!(device.process_request_queue(), 2);
    assert!(matches!(
        platform.gpu().run_until_idle(),
        FrontEnd::Faulted(Fault::Translation(_))
    ));
    // The finished batch's event and the fault arrive together.
    let pending = platform.gpu().pending_irq();
    assert!(pending.has_error());
    assert_ne!(pending.events(), 0);

    device.process_interrupt().unwrap();
    assert!(good_done.is_signaled());
    assert!(!good_context.is_killed());
    assert_eq!(good_kills.load(Ordering::SeqCst), 0);
    assert!(bad_context.is_killed());
    assert_eq!(bad_kills.load(Ordering::SeqCst), 1);
    assert!(!bad_done.is_signaled());
    assert_eq!(device.inflight_count(), 0);
    assert_eq!(device.last_completed_sequence(), 2);
    assert_eq!(platform.gpu().register(0x0700), 5);
    assert_eq!(platform.gpu().run_until_idle(), FrontEnd::Waiting);
}

#[test]
fn device_keeps_running_after_a_fault() {
    let (platform, device) = device();
    let bad_connection = device.open(1).unwrap();
    let bad_context = bad_connection.create_context();
    let bad_buffer = batch_buffer(&platform, &bad_connection, &[link(1, 0x0080_0000)]);
    let queued_connection = device.open(2).unwrap();
    let queued_context = queued_connection.create_context();
    let queued_buffer = batch_buffer(&platform, &queued_connection, &[load_state(0x0700, 2)]);
    let bad_done = FakeSemaphore::new();
    let queued_done = FakeSemaphore::new();

    // Work written behind the faulting batch still runs once it is retired.
    submit(&bad_context, &bad_buffer, 8, &bad_done).unwrap();
    submit(&queued_context, &queued_buffer, 8, &queued_done).unwrap();
    assert_eq!(device.process_request_queue(), 2);
    assert!(matches!(
        platform.gpu().run_until_idle(),
        FrontEnd::Faulted(_)
    ));
    device.process_interrupt().unwrap();
    assert!(bad_context.is_killed());
    assert!(!queued_done.is_signaled());
    assert_eq!(device.inflight_count(), 1);

    assert_eq!(platform.gpu().run_until_idle(), FrontEnd::Waiting);
    device.process_interrupt().unwrap();
    assert!(queued_done.is_signaled());
    assert!(!queued_context.is_killed());
    assert_eq!(platform.gpu().register(0x0700), 2);

    // A client arriving after the fault is served as usual.
    let late_connection = device.open(3).unwrap();
    let late_context = late_connection.create_context();
    let late_buffer = batch_buffer(&platform, &late_connection, &[load_state(0x0704, 3)]);
    let late_done = FakeSemaphore::new();
    submit(&late_context, &late_buffer, 8, &late_done).unwrap();
    assert_eq!(device.process_request_queue(), 1);
    assert_eq!(platform.gpu().run_until_idle(), FrontEnd::Waiting);
    device.process_interrupt().unwrap();
    assert!(late_done.is_signaled());
    assert_eq!(platform.gpu().register(0x0704), 3);
    assert_eq!(device.last_completed_sequence(), 3);
    assert_eq!(device.inflight_count(), 0);
    assert!(device.is_idle());
}

#[test]
fn wait_semaphores_hold_the_queue() {
    let (platform, device) = device();
    let connection = device.open(1).unwrap();
    let context = connection.create_context();
    let gate = FakeSemaphore::new();
    let gate_wait: Semaphore = gate.clone();

    submit_event(&context, vec![gate_wait], Vec::new());
    submit_event(&context, Vec::new(), Vec::new());
    assert_eq!(device.process_request_queue(), 0);
    assert_eq!(device.queued_count(), 2);

    gate.signal();
    assert_eq!(device.process_request_queue(), 2);
    assert_eq!(device.queued_count(), 0);
    assert!(!gate.is_signaled());

    platform.gpu().run_until_idle();
    device.process_interrupt().unwrap();
    assert_eq!(device.last_completed_sequence(), 2);
}

#[test]
fn event_exhaustion_defers_submission() {
    let (platform, device) = device_with(DeviceConfig {
        event_count: 1,
        ..DeviceConfig::new()
    });
    let connection = device.open(1).unwrap();
    let context = connection.create_context();

    submit_event(&context, Vec::new(), Vec::new());
    submit_event(&context, Vec::new(), Vec::new());
    assert_eq!(device.process_request_queue(), 1);
    assert_eq!(device.queued_count(), 1);

    platform.gpu().run_until_idle();
    device.process_interrupt().unwrap();
    assert_eq!(device.process_request_queue(), 1);
    platform.gpu().run_until_idle();
    device.process_interrupt().unwrap();
    assert_eq!(device.last_completed_sequence(), 2);
    assert_eq!(device.queued_count(), 0);
}

#[test]
fn ring_wraps_under_sustained_submission() {
    let (platform, device) = device_with(DeviceConfig {
        ringbuffer_size: PAGE_SIZE,
        ..DeviceConfig::new()
    });
    let connection = device.open(1).unwrap();
    let context = connection.create_context();
    let buffer = batch_buffer(&platform, &connection, &[load_state(0x0700, 0)]);

    let rounds = 300;
    let mut wraps = 0;
    let (_, _, mut previous_tail) = device.ringbuffer_state();
    for round in 1..=rounds {
        let done = FakeSemaphore::new();
        submit(&context, &buffer, 8, &done).unwrap();
        assert_eq!(device.process_request_queue(), 1, "round {round}");
        assert_eq!(platform.gpu().run_until_idle(), FrontEnd::Waiting);
        device.process_interrupt().unwrap();
        assert!(done.is_signaled(), "round {round}");

        let (last_wait, head, tail) = device.ringbuffer_state();
        assert_eq!(head, last_wait);
        if tail < previous_tail {
            wraps += 1;
        }
        previous_tail = tail;
    }
    assert_eq!(device.last_completed_sequence(), rounds);
    assert!(wraps >= 1);
}

#[test]
fn shutdown_ends_the_ring() {
    let (platform, device) = device();
    let connection = device.open(1).unwrap();
    let context = connection.create_context();

    device.shutdown();
    assert_eq!(platform.gpu().run_until_idle(), FrontEnd::Ended);
    let err = context
        .execute_command_buffer_with_resources(
            CommandBufferDescriptor::default(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
        .unwrap_err();
    assert!(matches!(err, MsdError::Device(DeviceError::ShuttingDown)));
}

#[test]
fn shutdown_lets_written_work_finish() {
    let (platform, device) = device();
    let connection = device.open(1).unwrap();
    let context = connection.create_context();
    let buffer = batch_buffer(&platform, &connection, &[load_state(0x0700, 5)]);
    let done = FakeSemaphore::new();

    submit(&context, &buffer, 8, &done).unwrap();
    assert_eq!(device.process_request_queue(), 1);
    device.shutdown();

    assert_eq!(platform.gpu().run_until_idle(), FrontEnd::Ended);
    assert_eq!(platform.gpu().register(0x0700), 5);
    device.process_interrupt().unwrap();
    assert!(done.is_signaled());
}

#[test]
fn context_without_connection_cannot_submit() {
    let (_platform, device) = device();
    let connection = device.open(1).unwrap();
    let context = connection.create_context();
    drop(connection);
    assert!(context.connection().is_none());
    assert!(matches!(
        context.execute_command_buffer_with_resources(
            CommandBufferDescriptor::default(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        ),
        Err(MsdError::ConnectionGone)
    ));
}
