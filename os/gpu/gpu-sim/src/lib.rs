//! # GC7000 Device Model
//!
//! A software stand-in for the GPU, good enough to run the submission core
//! end to end without hardware:
//!
//! ```text
//!   msd-vsl ── RegisterIo ──► SimGpu ── read_bus_u32 ──► FakeMemory
//!      ▲                        │                          (ring, batches,
//!      └──── SimInterrupt ◄─────┘ EVENT / fault             page tables)
//! ```
//!
//! - [`SimGpu`]: register file plus a front-end interpreter for `WAIT`,
//!   `LINK`, `END` and `LOAD_STATE`. Fetches go through the driver's MMU
//!   tables and honour `LINK` prefetch windows, so a wrong prefetch or an
//!   unmapped page shows up as a fault interrupt.
//! - [`SimInterrupt`]: the interrupt line behind [`PlatformInterrupt`](gpu_platform::PlatformInterrupt).
//! - [`SimPlatform`]: bundles both with a [`FakeMemory`](gpu_platform::fake::FakeMemory)
//!   into a [`PlatformDevice`](gpu_platform::PlatformDevice).
//! - [`SimLogger`]: stderr logger for tests.
//!
//! The model executes only when asked: call [`SimGpu::run_until_idle`]
//! directly, or let a [`SimRunner`] thread do it.

mod gpu;
mod interrupt;
mod logger;
mod platform;

pub use crate::gpu::{Fault, FrontEnd, SimGpu, SimRunner};
pub use crate::interrupt::SimInterrupt;
pub use crate::logger::SimLogger;
pub use crate::platform::SimPlatform;
