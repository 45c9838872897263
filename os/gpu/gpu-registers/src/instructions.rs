//! # Front-End Instruction Encoding
//!
//! The front end executes a stream of 8-byte instructions. The opcode lives in
//! bits 27–31 of the first dword; the second dword carries an operand or is
//! padding.
//!
//! | Opcode | Mnemonic | Dword 0 payload | Dword 1 |
//! |--------|--------------|------------------------------------|--------------------|
//! | 1 | `LOAD_STATE` | state address (dwords), value count | first value |
//! | 2 | `END` | – | – |
//! | 7 | `WAIT` | cycle count | – |
//! | 8 | `LINK` | prefetch (8-byte units) | target GPU address |
//!
//! A `WAIT` followed by a `LINK` back to it is the idle loop the ring buffer
//! parks the front end in. Submitting work rewrites that `WAIT` into a `LINK`
//! in place, so [`link_header`] is exposed separately from [`link`]: the
//! address dword is patched first, the opcode dword last.

use bitfield_struct::bitfield;

/// Size of one instruction in bytes.
pub const INSTRUCTION_BYTES: u32 = 8;

/// Size of one instruction in dwords.
pub const INSTRUCTION_DWORDS: u32 = 2;

/// Dwords occupied by a `WAIT` + `LINK` pair.
pub const WAIT_LINK_DWORDS: u32 = 2 * INSTRUCTION_DWORDS;

/// State address raising the event interrupt named by [`EventState`].
pub const STATE_EVENT: u32 = 0x3804;

/// State address flushing the MMU translation caches ([`MmuFlushState`]).
pub const STATE_MMU_FLUSH: u32 = 0x380C;

/// State address selecting the active page-table-array slot.
///
/// Shares its address with the `MMU_PTA_CONTROL` register.
pub const STATE_MMU_PTA_CONFIG: u32 = 0x1B4;

/// Front-end opcodes understood by this driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    LoadState = 1,
    End = 2,
    Wait = 7,
    Link = 8,
}

impl Opcode {
    #[inline]
    #[must_use]
    pub const fn from_bits(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::LoadState),
            2 => Some(Self::End),
            7 => Some(Self::Wait),
            8 => Some(Self::Link),
            _ => None,
        }
    }
}

/// Generic view of an instruction's first dword.
#[bitfield(u32)]
pub struct CommandHeader {
    #[bits(27)]
    pub payload: u32,

    #[bits(5)]
    pub opcode: u8,
}

/// `LOAD_STATE` header: writes `count` values starting at state `address`.
#[bitfield(u32)]
pub struct LoadStateHeader {
    /// State address in dwords (byte address >> 2).
    #[bits(16)]
    pub address: u16,

    #[bits(10)]
    pub count: u16,

    pub fixed_point: bool,

    #[bits(5)]
    pub opcode: u8,
}

/// `WAIT` header.
#[bitfield(u32)]
pub struct WaitHeader {
    #[bits(16)]
    pub cycles: u16,

    #[bits(11, default = 0)]
    _reserved_16_26: u16,

    #[bits(5)]
    pub opcode: u8,
}

/// `LINK` header; the target address is the following dword.
#[bitfield(u32)]
pub struct LinkHeader {
    /// Number of 8-byte units to prefetch at the target.
    #[bits(16)]
    pub prefetch: u16,

    #[bits(11, default = 0)]
    _reserved_16_26: u16,

    #[bits(5)]
    pub opcode: u8,
}

/// Value written to [`STATE_EVENT`].
#[bitfield(u32)]
pub struct EventState {
    #[bits(5)]
    pub event_id: u8,

    _reserved_5: bool,

    /// Raise the event once the pixel engine has drained.
    pub from_pixel_engine: bool,

    #[bits(25, default = 0)]
    _reserved_7_31: u32,
}

/// Value written to [`STATE_MMU_FLUSH`].
#[bitfield(u32)]
pub struct MmuFlushState {
    pub flush: bool,

    #[bits(31, default = 0)]
    _reserved_1_31: u32,
}

/// `WAIT` for `cycles` clocks.
#[inline]
#[must_use]
pub const fn wait(cycles: u16) -> [u32; 2] {
    let header = WaitHeader::new()
        .with_cycles(cycles)
        .with_opcode(Opcode::Wait as u8);
    [header.into_bits(), 0]
}

/// First dword of a `LINK` with the given prefetch.
#[inline]
#[must_use]
pub const fn link_header(prefetch: u16) -> u32 {
    LinkHeader::new()
        .with_prefetch(prefetch)
        .with_opcode(Opcode::Link as u8)
        .into_bits()
}

/// `LINK` to `address`, prefetching `prefetch` 8-byte units.
#[inline]
#[must_use]
pub const fn link(prefetch: u16, address: u32) -> [u32; 2] {
    [link_header(prefetch), address]
}

/// First dword of an `END`.
#[inline]
#[must_use]
pub const fn end_header() -> u32 {
    CommandHeader::new()
        .with_opcode(Opcode::End as u8)
        .into_bits()
}

/// `END`: stop the front end.
#[inline]
#[must_use]
pub const fn end() -> [u32; 2] {
    [end_header(), 0]
}

/// Single-value `LOAD_STATE` writing `value` to the state at byte address `state`.
#[inline]
#[must_use]
pub const fn load_state(state: u32, value: u32) -> [u32; 2] {
    #[allow(clippy::cast_possible_truncation)]
    let header = LoadStateHeader::new()
        .with_address((state >> 2) as u16)
        .with_count(1)
        .with_opcode(Opcode::LoadState as u8);
    [header.into_bits(), value]
}

/// `LOAD_STATE` raising interrupt event `event_id` once the pipeline drains.
#[inline]
#[must_use]
pub const fn event(event_id: u8) -> [u32; 2] {
    let value = EventState::new()
        .with_event_id(event_id)
        .with_from_pixel_engine(true);
    load_state(STATE_EVENT, value.into_bits())
}

/// `LOAD_STATE` selecting page-table-array slot `slot`.
#[inline]
#[must_use]
pub const fn select_page_table_slot(slot: u16) -> [u32; 2] {
    load_state(STATE_MMU_PTA_CONFIG, slot as u32)
}

/// `LOAD_STATE` flushing the MMU translation caches.
#[inline]
#[must_use]
pub const fn flush_mmu() -> [u32; 2] {
    load_state(STATE_MMU_FLUSH, MmuFlushState::new().with_flush(true).into_bits())
}

/// A decoded instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Instruction {
    /// `LOAD_STATE` of `count` values at byte address `state`; `value` is the first one.
    LoadState { state: u32, count: u16, value: u32 },
    End,
    Wait { cycles: u16 },
    Link { prefetch: u16, address: u32 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("LOAD_STATE with zero values")]
    EmptyLoadState,
}

impl Instruction {
    /// Decode the 8-byte instruction `[dword0, dword1]`.
    ///
    /// # Errors
    /// Unknown opcodes and empty `LOAD_STATE`s are rejected.
    pub const fn decode(words: [u32; 2]) -> Result<Self, DecodeError> {
        let header = CommandHeader::from_bits(words[0]);
        let Some(opcode) = Opcode::from_bits(header.opcode()) else {
            return Err(DecodeError::UnknownOpcode(header.opcode()));
        };
        match opcode {
            Opcode::LoadState => {
                let ls = LoadStateHeader::from_bits(words[0]);
                if ls.count() == 0 {
                    return Err(DecodeError::EmptyLoadState);
                }
                Ok(Self::LoadState {
                    state: (ls.address() as u32) << 2,
                    count: ls.count(),
                    value: words[1],
                })
            }
            Opcode::End => Ok(Self::End),
            Opcode::Wait => Ok(Self::Wait {
                cycles: WaitHeader::from_bits(words[0]).cycles(),
            }),
            Opcode::Link => Ok(Self::Link {
                prefetch: LinkHeader::from_bits(words[0]).prefetch(),
                address: words[1],
            }),
        }
    }
}
