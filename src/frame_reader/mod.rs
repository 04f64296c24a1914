//! Frame readers.
//!
//! A frame reader knows one way to compute "given this frame's registers,
//! what were the caller's registers". [`Cursor`](crate::cursor::Cursor)
//! tries each available reader, in priority order, for every step: compact
//! unwind info first (cheap, table-driven), DWARF CFI next (authoritative
//! but slower to decode), and frame-pointer walking last (always
//! available, least precise).
//!
//! Each reader reports its own errors rather than silently falling back,
//! since the cursor needs to distinguish "this reader found nothing, try
//! the next one" from "this reader found something malformed".

mod compact_unwind;
mod dwarf_cfi;
mod frame_pointer;

pub use compact_unwind::CompactUnwindReader;
pub use dwarf_cfi::DwarfCfiReader;
pub use frame_pointer::FramePointerReader;

use crate::mobject::MemoryObject;
use crate::regs::RegisterState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameReaderError {
    #[error("this reader has no unwind information for the given address")]
    NotFound,
    #[error("unwind information for this address is malformed: {0}")]
    Malformed(String),
    #[error("a memory read required to step this frame failed")]
    MemoryAccess,
    #[error("the computed caller state is not a valid step (non-monotonic stack pointer)")]
    NotProgressing,
}

/// Tags which concrete reader produced a step, so the log writer can
/// record provenance without the cursor needing to know each reader's
/// internal representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameReaderKind {
    CompactUnwind,
    DwarfCfi,
    FramePointer,
}

/// One strategy for stepping from a callee frame to its caller.
pub trait FrameReader {
    fn kind(&self) -> FrameReaderKind;

    /// Attempts to compute the caller's register state given the current
    /// frame's. `memory` reads from the same address space `regs` was
    /// captured in (the crashing task, or our own for self-unwinds).
    ///
    /// Implementations must not mutate `regs` on a [`FrameReaderError`]
    /// return; the cursor relies on being able to try the next reader with
    /// the untouched input.
    fn step(
        &self,
        regs: &RegisterState,
        memory: &MemoryObject,
    ) -> Result<RegisterState, FrameReaderError>;
}
