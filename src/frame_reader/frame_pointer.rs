//! Frame-pointer walking, the reader of last resort.
//!
//! Every architecture this crate supports can, in principle, be compiled
//! without frame pointers, which is exactly why this reader exists as a
//! fallback rather than the primary strategy: it only works when the
//! callee actually maintained one, and has no way to tell "no frame
//! pointer was kept" apart from "the value it finds there happens to look
//! plausible". [`super::CompactUnwindReader`] and [`super::DwarfCfiReader`]
//! are preferred whenever their tables cover the address.

use super::{FrameReader, FrameReaderError, FrameReaderKind};
use crate::mobject::MemoryObject;
use crate::regs::{Arch, RegNum, RegisterState};

pub struct FramePointerReader {
    arch: Arch,
}

impl FramePointerReader {
    pub fn new(arch: Arch) -> Self {
        Self { arch }
    }

    fn pointer_size(&self) -> u64 {
        match self.arch {
            Arch::X86_64 => 8,
            Arch::X86 | Arch::Arm32 => 4,
        }
    }

    fn read_word(&self, memory: &MemoryObject, task_addr: u64) -> Option<u64> {
        let width = self.pointer_size();
        let offset = task_addr.checked_sub(memory.task_address())?;
        let bytes = memory.translate_slice(offset, width)?;
        Some(match width {
            8 => u64::from_le_bytes(bytes.try_into().ok()?),
            4 => u32::from_le_bytes(bytes.try_into().ok()?) as u64,
            _ => unreachable!(),
        })
    }
}

impl FrameReader for FramePointerReader {
    fn kind(&self) -> FrameReaderKind {
        FrameReaderKind::FramePointer
    }

    fn step(
        &self,
        regs: &RegisterState,
        memory: &MemoryObject,
    ) -> Result<RegisterState, FrameReaderError> {
        let fp = regs.get(RegNum::Fp).ok_or(FrameReaderError::NotFound)?;
        if fp == 0 {
            return Err(FrameReaderError::NotFound);
        }

        let ptr_size = self.pointer_size();

        // The classic frame record: [fp] = caller's fp, [fp+ptr_size] =
        // return address. ARM32's APCS record is laid out the same way
        // once `fp` is taken to point just past the saved-registers block,
        // which is how this crate's image parser normalizes it.
        let saved_fp = self
            .read_word(memory, fp)
            .ok_or(FrameReaderError::MemoryAccess)?;
        let return_addr = self
            .read_word(memory, fp + ptr_size)
            .ok_or(FrameReaderError::MemoryAccess)?;

        if return_addr == 0 {
            return Err(FrameReaderError::NotFound);
        }

        let caller_sp = fp + ptr_size * 2;
        let current_sp = regs.get(RegNum::Sp).unwrap_or(0);
        if caller_sp <= current_sp {
            return Err(FrameReaderError::NotProgressing);
        }

        // Start from the callee's own state rather than a blank one: a
        // frame-pointer record only tells us `fp`/the return address, but
        // any callee-saved GPR this frame didn't itself spill still holds
        // whatever value the caller had -- it was never clobbered. The
        // cursor trims anything volatile via `clear_volatile` once this
        // step is accepted.
        let mut caller = regs.clone();
        caller.set(RegNum::Pc, return_addr);
        caller.set(RegNum::Sp, caller_sp);
        caller.set(RegNum::Fp, saved_fp);
        if matches!(self.arch, Arch::Arm32) {
            caller.set(RegNum::Lr, return_addr);
        }
        Ok(caller)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[repr(C)]
    struct FrameRecord {
        saved_fp: u64,
        return_addr: u64,
    }

    #[test]
    fn walks_one_synthetic_frame() {
        let record = FrameRecord {
            saved_fp: 0,
            return_addr: 0x4000,
        };
        let addr = &record as *const _ as u64;
        let memory = MemoryObject::for_self(addr, std::mem::size_of::<FrameRecord>() as u64)
            .unwrap();

        let mut regs = RegisterState::new(Arch::X86_64);
        regs.set(RegNum::Fp, addr);
        regs.set(RegNum::Sp, addr - 16);

        let reader = FramePointerReader::new(Arch::X86_64);
        let caller = reader.step(&regs, &memory).unwrap();
        assert_eq!(caller.get(RegNum::Pc), Some(0x4000));
        assert_eq!(caller.get(RegNum::Fp), Some(0));
    }

    #[test]
    fn zero_return_address_is_treated_as_terminal() {
        let record = FrameRecord {
            saved_fp: 0,
            return_addr: 0,
        };
        let addr = &record as *const _ as u64;
        let memory = MemoryObject::for_self(addr, std::mem::size_of::<FrameRecord>() as u64)
            .unwrap();

        let mut regs = RegisterState::new(Arch::X86_64);
        regs.set(RegNum::Fp, addr);
        regs.set(RegNum::Sp, addr - 16);

        let reader = FramePointerReader::new(Arch::X86_64);
        assert!(matches!(
            reader.step(&regs, &memory),
            Err(FrameReaderError::NotFound)
        ));
    }
}
