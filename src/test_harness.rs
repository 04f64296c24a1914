//! Test harness surface: helpers for building a synthetic call stack
//! in-process, so frame readers and the cursor can be exercised without a
//! real crash or a real Mach-O image on disk.
//!
//! Only compiled for tests; nothing here is async-signal-safe and nothing
//! here is reachable from the signal path.

#![cfg(any(test, feature = "test-harness"))]

use crate::regs::{Arch, RegNum, RegisterState};

/// A synthetic stack, built frame-by-frame, usable as the backing store
/// for a [`crate::mobject::MemoryObject::for_self`] view.
pub struct SyntheticStack {
    bytes: Vec<u8>,
    base: u64,
}

impl SyntheticStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity],
            base: 0,
        }
    }

    /// Must be called once the `SyntheticStack` has its final address
    /// (i.e. after it's been placed in a `Box` or left on the stack and
    /// won't move again), since frame records inside it encode absolute
    /// addresses.
    pub fn fix_base(&mut self) {
        self.base = self.bytes.as_ptr() as u64;
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Writes a classic two-word frame record (`saved_fp`, `return_addr`)
    /// at `offset`, returning the address of the record (what a caller's
    /// `fp` should point at to find it).
    pub fn push_frame_record(&mut self, offset: usize, saved_fp: u64, return_addr: u64) -> u64 {
        self.bytes[offset..offset + 8].copy_from_slice(&saved_fp.to_le_bytes());
        self.bytes[offset + 8..offset + 16].copy_from_slice(&return_addr.to_le_bytes());
        self.base + offset as u64
    }
}

/// Builds an initial [`RegisterState`] as if captured at the top of a
/// synthetic call chain: `pc` at `leaf_pc`, `sp` somewhere inside the
/// stack, `fp` pointing at the first frame record.
pub fn synthetic_initial_state(arch: Arch, leaf_pc: u64, sp: u64, fp: u64) -> RegisterState {
    let mut regs = RegisterState::new(arch);
    regs.set(RegNum::Pc, leaf_pc);
    regs.set(RegNum::Sp, sp);
    regs.set(RegNum::Fp, fp);
    regs
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn synthetic_stack_round_trips_a_frame_record() {
        let mut stack = SyntheticStack::new(256);
        stack.fix_base();
        let record_addr = stack.push_frame_record(64, 0, 0x4000);
        assert_eq!(record_addr, stack.base() + 64);

        let bytes = stack.as_slice();
        let return_addr = u64::from_le_bytes(bytes[72..80].try_into().unwrap());
        assert_eq!(return_addr, 0x4000);
    }
}
