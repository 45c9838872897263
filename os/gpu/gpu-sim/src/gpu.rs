//! Register file and front-end interpreter.

use crate::interrupt::SimInterrupt;
use gpu_addresses::{BusAddress, GpuAddress};
use gpu_platform::PlatformError;
use gpu_platform::fake::FakeMemory;
use gpu_registers::fetch_engine::{FeCommandAddress, FeCommandControl, FeDmaAddress};
use gpu_registers::idle::IdleState;
use gpu_registers::instructions::{
    EventState, INSTRUCTION_BYTES, Instruction, MmuFlushState, STATE_EVENT, STATE_MMU_FLUSH,
};
use gpu_registers::irq::{IrqAck, IrqEnable};
use gpu_registers::mmu::{
    MmuControl, MmuPageTableArrayAddressHigh, MmuPageTableArrayAddressLow, MmuPageTableArrayControl,
};
use gpu_registers::{Register, RegisterIo};
use gpu_vmem::{PageTableEntry, split_indices};
use log::{trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Instructions [`SimGpu::run_until_idle`] executes before giving up.
const STEP_BUDGET: usize = 1 << 20;

/// Why the front end stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("no translation for {0}")]
    Translation(GpuAddress),
    #[error("DMA failed: {0}")]
    Bus(PlatformError),
    #[error("cannot decode {words:08x?} at {address}")]
    Decode { address: GpuAddress, words: [u32; 2] },
    #[error("fetch at {address} past the prefetch window")]
    PrefetchExceeded { address: GpuAddress },
}

impl Fault {
    const fn irq(self) -> IrqAck {
        match self {
            Self::Translation(_) => IrqAck::new().with_mmu_exception(true),
            Self::Bus(_) | Self::Decode { .. } | Self::PrefetchExceeded { .. } => {
                IrqAck::new().with_bus_error(true)
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrontEnd {
    /// Not yet enabled through `FE_COMMAND_CONTROL`.
    Stopped,
    Running,
    /// Parked in a `WAIT` / `LINK` idle loop; `pc` is the `WAIT`.
    Waiting,
    /// Executed an `END`.
    Ended,
    Faulted(Fault),
}

struct SimState {
    registers: HashMap<u32, u32>,
    irq_pending: u32,
    front_end: FrontEnd,
    pc: u32,
    /// 8-byte units left in the current prefetch window.
    window: u16,
    /// Address of the last instruction if it was a `WAIT`.
    last_wait: Option<u32>,
    flush_count: u64,
    executed: u64,
}

impl SimState {
    fn register(&self, offset: u32) -> u32 {
        self.registers.get(&offset).copied().unwrap_or(0)
    }
}

/// A GC7000-shaped front end executing from [`FakeMemory`].
///
/// Implements [`RegisterIo`], so the driver programs it exactly like the
/// hardware. Instructions are fetched through the MMU tables the driver
/// built (or bus addresses directly while `MMU_CONTROL` is clear) and must
/// stay inside the prefetch window of the `LINK` that reached them.
///
/// The model only advances when [`run_until_idle`](Self::run_until_idle) is
/// called, either from a test or from a [`SimRunner`] thread.
pub struct SimGpu {
    memory: Arc<FakeMemory>,
    interrupt: Arc<SimInterrupt>,
    state: Mutex<SimState>,
}

enum Step {
    Continue,
    Parked,
    Halted,
}

impl SimGpu {
    #[must_use]
    pub fn new(memory: Arc<FakeMemory>, interrupt: Arc<SimInterrupt>) -> Arc<Self> {
        Arc::new(Self {
            memory,
            interrupt,
            state: Mutex::new(SimState {
                registers: HashMap::new(),
                irq_pending: 0,
                front_end: FrontEnd::Stopped,
                pc: 0,
                window: 0,
                last_wait: None,
                flush_count: 0,
                executed: 0,
            }),
        })
    }

    #[must_use]
    pub fn front_end(&self) -> FrontEnd {
        self.state.lock().front_end
    }

    /// Raw register value, without read side effects.
    #[must_use]
    pub fn register(&self, offset: u32) -> u32 {
        self.state.lock().register(offset)
    }

    /// `MMU_FLUSH` states executed so far.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.state.lock().flush_count
    }

    /// Instructions executed so far.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.state.lock().executed
    }

    /// Pending, not yet acknowledged interrupt bits.
    #[must_use]
    pub fn pending_irq(&self) -> IrqAck {
        IrqAck::from_bits(self.state.lock().irq_pending)
    }

    /// Execute until the front end parks in its idle loop, ends or faults.
    ///
    /// A parked front end re-fetches its `WAIT` first, so a `WAIT` patched
    /// into a `LINK` since the last run is picked up.
    pub fn run_until_idle(&self) -> FrontEnd {
        {
            let mut state = self.state.lock();
            match state.front_end {
                FrontEnd::Running => {}
                FrontEnd::Waiting => state.front_end = FrontEnd::Running,
                other => return other,
            }
        }
        for _ in 0..STEP_BUDGET {
            let mut state = self.state.lock();
            match self.step(&mut state) {
                Step::Continue => {}
                Step::Parked | Step::Halted => return state.front_end,
            }
        }
        warn!("front end still running after {STEP_BUDGET} instructions");
        self.front_end()
    }

    /// Run [`run_until_idle`](Self::run_until_idle) on a thread every `interval`.
    #[must_use]
    pub fn spawn_runner(self: &Arc<Self>, interval: Duration) -> SimRunner {
        let stop = Arc::new(AtomicBool::new(false));
        let gpu = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                gpu.run_until_idle();
                thread::park_timeout(interval);
            }
        });
        SimRunner {
            stop,
            handle: Some(handle),
        }
    }

    fn step(&self, state: &mut SimState) -> Step {
        let pc = state.pc;
        match self.execute(state) {
            Ok(step) => {
                state.executed += 1;
                step
            }
            Err(fault) => {
                warn!("front end fault at {pc:#x}: {fault}");
                state.front_end = FrontEnd::Faulted(fault);
                self.raise(state, fault.irq().into_bits());
                Step::Halted
            }
        }
    }

    fn execute(&self, state: &mut SimState) -> Result<Step, Fault> {
        let pc = state.pc;
        // Opcode dword first: a LINK is patched target-first.
        let words = [self.fetch(state, pc)?, self.fetch(state, pc + 4)?];
        let instruction = Instruction::decode(words).map_err(|_| Fault::Decode {
            address: GpuAddress::new(u64::from(pc)),
            words,
        })?;
        let units = match instruction {
            Instruction::LoadState { count, .. } => (count + 2) / 2,
            _ => 1,
        };
        if state.window < units {
            return Err(Fault::PrefetchExceeded {
                address: GpuAddress::new(u64::from(pc)),
            });
        }
        state.window -= units;
        trace!("{pc:#010x}: {instruction:?}");

        let wait_before = state.last_wait.take();
        match instruction {
            Instruction::LoadState {
                state: address,
                count,
                value,
            } => {
                self.load_state(state, address, value);
                for i in 1..u32::from(count) {
                    let value = self.fetch(state, pc + 4 + 4 * i)?;
                    self.load_state(state, address + 4 * i, value);
                }
                state.pc = pc + u32::from(units) * INSTRUCTION_BYTES;
                Ok(Step::Continue)
            }
            Instruction::Wait { .. } => {
                state.last_wait = Some(pc);
                state.pc = pc + INSTRUCTION_BYTES;
                Ok(Step::Continue)
            }
            Instruction::Link { prefetch, address } => {
                state.pc = address;
                state.window = prefetch;
                if wait_before.is_some_and(|wait| wait == address && wait + INSTRUCTION_BYTES == pc)
                {
                    state.front_end = FrontEnd::Waiting;
                    return Ok(Step::Parked);
                }
                Ok(Step::Continue)
            }
            Instruction::End => {
                state.front_end = FrontEnd::Ended;
                Ok(Step::Halted)
            }
        }
    }

    fn load_state(&self, state: &mut SimState, address: u32, value: u32) {
        match address {
            STATE_EVENT => {
                let event = EventState::from_bits(value).event_id();
                trace!("event {event}");
                self.raise(state, 1 << event);
            }
            STATE_MMU_FLUSH => {
                if MmuFlushState::from_bits(value).flush() {
                    state.flush_count += 1;
                }
            }
            _ => {
                state.registers.insert(address, value);
            }
        }
    }

    fn raise(&self, state: &mut SimState, bits: u32) {
        state.irq_pending |= bits;
        if state.register(IrqEnable::OFFSET) & bits != 0 {
            self.interrupt.raise();
        }
    }

    fn fetch(&self, state: &SimState, address: u32) -> Result<u32, Fault> {
        let bus = self.translate(state, GpuAddress::new(u64::from(address)))?;
        self.memory.read_bus_u32(bus).map_err(Fault::Bus)
    }

    /// Walk page-table array, master table and page table for `gpu_addr`.
    fn translate(&self, state: &SimState, gpu_addr: GpuAddress) -> Result<BusAddress, Fault> {
        if !MmuControl::from(state.register(MmuControl::OFFSET)).enable() {
            return Ok(BusAddress::new(gpu_addr.as_u64()));
        }
        let low = MmuPageTableArrayAddressLow::from(state.register(MmuPageTableArrayAddressLow::OFFSET));
        let high =
            MmuPageTableArrayAddressHigh::from(state.register(MmuPageTableArrayAddressHigh::OFFSET));
        let slot = MmuPageTableArrayControl::from(state.register(MmuPageTableArrayControl::OFFSET));
        let pta = (u64::from(high.address()) << 32) | u64::from(low.address());
        let slot_entry = BusAddress::new(pta + u64::from(slot.slot()) * 8);

        let read = |bus: BusAddress| self.memory.read_bus_u32(bus).map_err(Fault::Bus);
        let root = u64::from(read(slot_entry)?) | (u64::from(read(slot_entry + 4)?) << 32);
        if root == 0 {
            return Err(Fault::Translation(gpu_addr));
        }
        let (master, table) = split_indices(gpu_addr);
        let table_bus = PageTableEntry::from_bits(read(BusAddress::new(root) + master.byte_offset())?)
            .bus_address()
            .ok_or(Fault::Translation(gpu_addr))?;
        let page = PageTableEntry::from_bits(read(table_bus + table.byte_offset())?)
            .bus_address()
            .ok_or(Fault::Translation(gpu_addr))?;
        Ok(page + gpu_addr.page_offset())
    }

    fn idle_state(&self, state: &mut SimState) -> IdleState {
        if state.front_end == FrontEnd::Waiting {
            let parked = self
                .fetch(state, state.pc)
                .ok()
                .and_then(|word| Instruction::decode([word, 0]).ok())
                .is_some_and(|instruction| matches!(instruction, Instruction::Wait { .. }));
            if !parked {
                state.front_end = FrontEnd::Running;
            }
        }
        match state.front_end {
            FrontEnd::Running | FrontEnd::Faulted(_) => {
                IdleState::from_bits(IdleState::ALL_IDLE).with_front_end(false)
            }
            FrontEnd::Stopped | FrontEnd::Waiting | FrontEnd::Ended => {
                IdleState::from_bits(IdleState::ALL_IDLE)
            }
        }
    }
}

impl RegisterIo for SimGpu {
    fn read32(&self, offset: u32) -> u32 {
        let mut state = self.state.lock();
        match offset {
            IrqAck::OFFSET => core::mem::take(&mut state.irq_pending),
            IdleState::OFFSET => self.idle_state(&mut state).into_bits(),
            FeDmaAddress::OFFSET => state.pc,
            _ => state.register(offset),
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut state = self.state.lock();
        match offset {
            IrqAck::OFFSET | FeDmaAddress::OFFSET | IdleState::OFFSET => {}
            FeCommandControl::OFFSET => {
                state.registers.insert(offset, value);
                let control = FeCommandControl::from(value);
                if control.enable() {
                    state.pc = state.register(FeCommandAddress::OFFSET);
                    state.window = control.prefetch();
                    state.last_wait = None;
                    state.front_end = FrontEnd::Running;
                    trace!("front end started at {:#x}", state.pc);
                }
            }
            _ => {
                state.registers.insert(offset, value);
            }
        }
    }
}

/// Background thread driving a [`SimGpu`]; stopped and joined on drop.
pub struct SimRunner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimRunner {
    /// Wake the runner for an immediate pass.
    pub fn kick(&self) {
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("simulator runner panicked");
            }
        }
    }
}

impl Drop for SimRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use gpu_addresses::PAGE_SIZE;
    use gpu_platform::{BufferAllocator, BusMapper, BusMapping, PlatformBuffer};
    use gpu_registers::instructions::{end, event, link, load_state, wait};

    struct Ring {
        buffer: Arc<dyn PlatformBuffer>,
        _mapping: Box<dyn BusMapping>,
        base: u32,
    }

    impl Ring {
        fn write(&self, offset: u32, instruction: [u32; 2]) {
            let offset = u64::from(offset);
            self.buffer.write_u32(offset, instruction[0]).unwrap();
            self.buffer.write_u32(offset + 4, instruction[1]).unwrap();
        }
    }

    /// A one-page ring accessed through bus addresses (MMU off).
    fn setup() -> (Arc<SimGpu>, Arc<SimInterrupt>, Ring) {
        let memory = FakeMemory::new();
        let interrupt = SimInterrupt::new();
        let gpu = SimGpu::new(Arc::clone(&memory), Arc::clone(&interrupt));
        let buffer = memory.allocate(PAGE_SIZE, "ring").unwrap();
        let mapping = memory.map_page_range_bus(&buffer, 0, 1).unwrap();
        let base = u32::try_from(mapping.bus_addresses()[0].as_u64()).unwrap();
        let ring = Ring {
            buffer,
            _mapping: mapping,
            base,
        };
        ring.write(0, wait(200));
        ring.write(8, link(2, base));
        IrqEnable::all().store(gpu.as_ref());
        (gpu, interrupt, ring)
    }

    fn start(gpu: &SimGpu, address: u32, prefetch: u16) {
        FeCommandAddress::new().with_address(address).store(gpu);
        FeCommandControl::new()
            .with_prefetch(prefetch)
            .with_enable(true)
            .store(gpu);
    }

    #[test]
    fn parks_in_idle_loop() {
        let (gpu, _, ring) = setup();
        assert_eq!(gpu.front_end(), FrontEnd::Stopped);
        start(&gpu, ring.base, 2);
        assert!(!IdleState::load(gpu.as_ref()).is_idle());

        assert_eq!(gpu.run_until_idle(), FrontEnd::Waiting);
        assert!(IdleState::load(gpu.as_ref()).is_idle());
        assert_eq!(FeDmaAddress::load(gpu.as_ref()).address(), ring.base);
        assert_eq!(gpu.executed(), 2);
    }

    #[test]
    fn patched_wait_runs_new_work() {
        let (gpu, interrupt, ring) = setup();
        start(&gpu, ring.base, 2);
        gpu.run_until_idle();

        ring.write(0x10, load_state(0x0700, 0xABCD));
        ring.write(0x18, event(5));
        ring.write(0x20, wait(200));
        ring.write(0x28, link(2, ring.base + 0x20));
        ring.buffer.write_u32(4, ring.base + 0x10).unwrap();
        ring.buffer
            .write_u32(0, gpu_registers::instructions::link_header(4))
            .unwrap();

        assert!(!IdleState::load(gpu.as_ref()).is_idle());
        assert_eq!(gpu.run_until_idle(), FrontEnd::Waiting);
        assert_eq!(gpu.register(0x0700), 0xABCD);
        assert_eq!(FeDmaAddress::load(gpu.as_ref()).address(), ring.base + 0x20);

        assert!(interrupt.is_pending());
        let ack = IrqAck::load(gpu.as_ref());
        assert!(ack.is_event_set(5));
        assert!(!ack.has_error());
        assert_eq!(IrqAck::load(gpu.as_ref()).into_bits(), 0);
    }

    #[test]
    fn prefetch_window_is_enforced() {
        let (gpu, _, ring) = setup();
        ring.write(0x10, load_state(0x0700, 1));
        ring.write(0x18, end());
        start(&gpu, ring.base + 0x10, 1);

        let state = gpu.run_until_idle();
        assert!(matches!(
            state,
            FrontEnd::Faulted(Fault::PrefetchExceeded { .. })
        ));
        assert!(IrqAck::load(gpu.as_ref()).bus_error());
        assert_eq!(gpu.register(0x0700), 1);
    }

    #[test]
    fn end_halts() {
        let (gpu, _, ring) = setup();
        ring.write(0x10, end());
        start(&gpu, ring.base + 0x10, 1);
        assert_eq!(gpu.run_until_idle(), FrontEnd::Ended);
        assert_eq!(gpu.run_until_idle(), FrontEnd::Ended);
    }

    #[test]
    fn unmapped_translation_faults() {
        let (gpu, _, ring) = setup();
        MmuControl::new().with_enable(true).store(gpu.as_ref());
        start(&gpu, ring.base, 2);
        assert!(matches!(
            gpu.run_until_idle(),
            FrontEnd::Faulted(Fault::Bus(_) | Fault::Translation(_))
        ));
        assert!(IrqAck::load(gpu.as_ref()).has_error());
    }

    #[test]
    fn translates_through_page_tables() {
        let memory = FakeMemory::new();
        let interrupt = SimInterrupt::new();
        let gpu = SimGpu::new(Arc::clone(&memory), interrupt);

        let mut table = gpu_vmem::PageTable::new(memory.clone(), memory.clone()).unwrap();
        let arrays = gpu_vmem::PageTableArrays::new(&*memory, &*memory, 4).unwrap();
        arrays.assign(3, table.root_bus_address()).unwrap();

        let buffer = memory.allocate(PAGE_SIZE, "ring").unwrap();
        let mapping = memory.map_page_range_bus(&buffer, 0, 1).unwrap();
        let va = GpuAddress::new(0x0040_0000);
        table.insert(va, mapping.bus_addresses()).unwrap();
        buffer.write_u32(0, wait(1)[0]).unwrap();
        let back = link(2, 0x0040_0000);
        buffer.write_u32(8, back[0]).unwrap();
        buffer.write_u32(12, back[1]).unwrap();

        let pta = arrays.bus_address().as_u64();
        MmuPageTableArrayAddressLow::new()
            .with_address(u32::try_from(pta & 0xFFFF_FFFF).unwrap())
            .store(gpu.as_ref());
        MmuPageTableArrayAddressHigh::new()
            .with_address(u32::try_from(pta >> 32).unwrap())
            .store(gpu.as_ref());
        MmuPageTableArrayControl::new().with_slot(3).store(gpu.as_ref());
        MmuControl::new().with_enable(true).store(gpu.as_ref());

        start(&gpu, 0x0040_0000, 2);
        assert_eq!(gpu.run_until_idle(), FrontEnd::Waiting);
        assert_eq!(FeDmaAddress::load(gpu.as_ref()).address(), 0x0040_0000);
    }
}
