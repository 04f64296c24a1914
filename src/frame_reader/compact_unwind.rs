//! Compact unwind info (`__unwind_info`) reader.
//!
//! This is the preferred frame reader whenever an image carries one: a
//! small, densely packed table the linker builds from whatever unwind
//! information the compiler produced, rather than full DWARF CFI. Lookup
//! is two-level (first-level pages bucket by function address range,
//! second-level pages map individual function starts to a 32-bit
//! encoding) and the encoding itself is either "frame-based" (classic
//! push-rbp prologue, walk like [`super::FramePointerReader`]) or
//! "frameless" (fixed stack adjustment plus an encoded permutation of
//! which callee-saved registers were spilled, and in what order).
//!
//! Table layout follows Apple's public `compact_unwind_encoding.h`; the
//! register-permutation decode is the Lehmer-code scheme documented
//! there (a compressed encoding of a length-`count` permutation drawn
//! from a 6-register pool, not any particular project's invention).

use super::{FrameReader, FrameReaderError, FrameReaderKind};
use crate::mobject::MemoryObject;
use crate::regs::{Arch, RegNum, RegisterState};

// Apple's compact unwind bit layout is identical between i386 and
// x86_64 (only the register pool each mode's bits name differs), so
// these masks apply to both; the names drop the `_X86_64` qualifier that
// would otherwise misleadingly suggest i386 uses a different layout.
const UNWIND_MODE_MASK: u32 = 0x0F00_0000;
const UNWIND_MODE_EBP_FRAME: u32 = 0x0100_0000;
const UNWIND_MODE_STACK_IMMD: u32 = 0x0200_0000;
const UNWIND_MODE_STACK_IND: u32 = 0x0300_0000;
const UNWIND_MODE_DWARF: u32 = 0x0400_0000;

const EBP_FRAME_OFFSET_MASK: u32 = 0x00FF_0000;
const EBP_FRAME_OFFSET_SHIFT: u32 = 16;

const FRAMELESS_STACK_SIZE_MASK: u32 = 0x00FF_0000;
const FRAMELESS_STACK_SIZE_SHIFT: u32 = 16;
const FRAMELESS_REG_COUNT_MASK: u32 = 0x0000_1C00;
const FRAMELESS_REG_COUNT_SHIFT: u32 = 10;
const FRAMELESS_REG_PERMUTATION_MASK: u32 = 0x0000_03FF;

/// A parsed `__unwind_info` section, established over async-safe mapped
/// memory (no heap copy -- every lookup reads directly through the
/// `MemoryObject`).
pub struct CompactUnwindReader {
    arch: Arch,
    section: MemoryObject,
}

#[repr(C)]
struct SectionHeader {
    version: u32,
    common_encodings_offset: u32,
    common_encodings_count: u32,
    personality_offset: u32,
    personality_count: u32,
    index_offset: u32,
    index_count: u32,
}

#[repr(C)]
struct IndexEntry {
    function_offset: u32,
    second_level_offset: u32,
    lsda_index_offset: u32,
}

#[repr(C)]
struct RegularEntry {
    function_offset: u32,
    encoding: u32,
}

const SECOND_LEVEL_REGULAR: u32 = 2;
const SECOND_LEVEL_COMPRESSED: u32 = 3;

impl CompactUnwindReader {
    /// `section` must be a [`MemoryObject`] view over exactly the image's
    /// `__unwind_info` section.
    pub fn new(arch: Arch, section: MemoryObject) -> Self {
        Self { arch, section }
    }

    fn read<T>(&self, offset: u64) -> Option<T>
    where
        T: Copy,
    {
        let bytes = self.section.translate_slice(offset, std::mem::size_of::<T>() as u64)?;
        // SAFETY: `bytes` is exactly `size_of::<T>()` long, and every `T`
        // used here is a `#[repr(C)]` plain-old-data struct of `u32`s.
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
    }

    /// Looks up the raw 32-bit compact unwind encoding for a function
    /// starting exactly at image-relative offset `func_offset`.
    fn encoding_for_offset(&self, func_offset: u32) -> Option<u32> {
        let header: SectionHeader = self.read(0)?;

        let index_base = header.index_offset as u64;
        let count = header.index_count as usize;
        if count < 2 {
            return None;
        }

        // Binary search the first-level index for the page whose range
        // covers `func_offset`. The index is sorted ascending by
        // function_offset and has one extra sentinel entry at the end.
        let mut lo = 0usize;
        let mut hi = count - 1;
        while lo + 1 < hi {
            let mid = (lo + hi) / 2;
            let entry: IndexEntry =
                self.read(index_base + mid as u64 * std::mem::size_of::<IndexEntry>() as u64)?;
            if entry.function_offset <= func_offset {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        let page: IndexEntry =
            self.read(index_base + lo as u64 * std::mem::size_of::<IndexEntry>() as u64)?;
        if page.second_level_offset == 0 {
            return None;
        }

        let page_base = page.second_level_offset as u64;
        let kind: u32 = self.read(page_base)?;

        match kind {
            SECOND_LEVEL_REGULAR => {
                let entry_offset: u16 = self.read(page_base + 4)?;
                let entry_count: u16 = self.read(page_base + 6)?;
                let entries_base = page_base + entry_offset as u64;

                let mut lo = 0usize;
                let mut hi = entry_count as usize;
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    let entry: RegularEntry = self.read(
                        entries_base + mid as u64 * std::mem::size_of::<RegularEntry>() as u64,
                    )?;
                    if entry.function_offset <= func_offset {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                if lo == 0 {
                    return None;
                }
                let entry: RegularEntry = self.read(
                    entries_base + (lo - 1) as u64 * std::mem::size_of::<RegularEntry>() as u64,
                )?;
                Some(entry.encoding)
            }
            SECOND_LEVEL_COMPRESSED => {
                let entry_offset: u16 = self.read(page_base + 4)?;
                let entry_count: u16 = self.read(page_base + 6)?;
                let encodings_offset: u16 = self.read(page_base + 8)?;
                let entries_base = page_base + entry_offset as u64;

                let mut lo = 0usize;
                let mut hi = entry_count as usize;
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    let packed: u32 = self.read(entries_base + mid as u64 * 4)?;
                    let offset = packed & 0x00FF_FFFF;
                    if offset <= func_offset - page.function_offset {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                if lo == 0 {
                    return None;
                }
                let packed: u32 = self.read(entries_base + (lo - 1) as u64 * 4)?;
                let encoding_index = (packed >> 24) & 0xFF;
                let encodings_base = page_base + encodings_offset as u64;
                let encoding: u32 = self.read(encodings_base + encoding_index as u64 * 4)?;
                Some(encoding)
            }
            _ => None,
        }
    }

    fn step_frame_based(
        &self,
        encoding: u32,
        regs: &RegisterState,
        memory: &MemoryObject,
    ) -> Result<RegisterState, FrameReaderError> {
        // Frame-based functions push rbp then mov rbp, rsp, so the frame
        // pointer convention applies directly; the saved-register offset
        // bits describe extra non-volatile spills between rbp and the
        // canonical frame record, which this crate doesn't need to
        // recover a correct caller PC/SP/FP.
        let _offset = (encoding & EBP_FRAME_OFFSET_MASK) >> EBP_FRAME_OFFSET_SHIFT;
        super::FramePointerReader::new(self.arch).step(regs, memory)
    }

    /// Stack slot unit frameless mode's stack-size field is a multiple of:
    /// 8 bytes on x86_64, 4 bytes on i386, per `compact_unwind_encoding.h`.
    fn frameless_unit_bytes(&self) -> u64 {
        match self.arch {
            Arch::X86_64 => 8,
            Arch::X86 | Arch::Arm32 => 4,
        }
    }

    /// Maps a decoded permutation register id (1..=6) to where this
    /// architecture's frame reader stores it: a `Gpr0..` slot, or `Fp`
    /// for the pool's 6th member (rbp/ebp). The pool itself -- which
    /// physical register each id names -- differs between x86_64 and
    /// i386; only the Lehmer-code decode producing the ids is shared.
    fn apply_saved_register(&self, caller: &mut RegisterState, reg_id: u8, value: u64) {
        let gpr_idx = match (self.arch, reg_id) {
            (Arch::X86_64, 1) => Some(0), // rbx
            (Arch::X86_64, 2) => Some(1), // r12
            (Arch::X86_64, 3) => Some(2), // r13
            (Arch::X86_64, 4) => Some(3), // r14
            (Arch::X86_64, 5) => Some(4), // r15
            (Arch::X86_64, 6) => {
                caller.set(RegNum::Fp, value);
                return;
            }
            (Arch::X86, 1) => Some(0), // ebx
            (Arch::X86, 2) => Some(3), // ecx
            (Arch::X86, 3) => Some(4), // edx
            (Arch::X86, 4) => Some(2), // edi
            (Arch::X86, 5) => Some(1), // esi
            (Arch::X86, 6) => {
                caller.set(RegNum::Fp, value);
                return;
            }
            _ => None,
        };
        if let Some(idx) = gpr_idx {
            caller.set_gpr(idx, value);
        }
    }

    fn step_frameless(
        &self,
        encoding: u32,
        regs: &RegisterState,
        memory: &MemoryObject,
    ) -> Result<RegisterState, FrameReaderError> {
        let unit = self.frameless_unit_bytes();
        let stack_size =
            ((encoding & FRAMELESS_STACK_SIZE_MASK) >> FRAMELESS_STACK_SIZE_SHIFT) as u64 * unit;
        let reg_count = (encoding & FRAMELESS_REG_COUNT_MASK) >> FRAMELESS_REG_COUNT_SHIFT;
        let permutation = encoding & FRAMELESS_REG_PERMUTATION_MASK;

        let saved = decode_permutation(permutation, reg_count as usize);

        let sp = regs.get(RegNum::Sp).ok_or(FrameReaderError::NotFound)?;
        if stack_size == 0 {
            return Err(FrameReaderError::NotFound);
        }

        let mut caller = regs.clone();
        // Saved registers sit immediately above the return address slot,
        // packed from low address to high in permutation order, each in
        // a pointer-width (not `unit`-width) stack slot.
        let ptr_size = match self.arch {
            Arch::X86_64 => 8u64,
            Arch::X86 | Arch::Arm32 => 4,
        };
        let mut slot = sp + stack_size - ptr_size * (reg_count as u64 + 1);
        for &reg_id in saved.iter().take(reg_count as usize) {
            let bytes = memory
                .translate_slice(slot.wrapping_sub(memory.task_address()), ptr_size)
                .ok_or(FrameReaderError::MemoryAccess)?;
            let value = match ptr_size {
                8 => u64::from_le_bytes(bytes.try_into().unwrap()),
                4 => u32::from_le_bytes(bytes.try_into().unwrap()) as u64,
                _ => unreachable!(),
            };
            self.apply_saved_register(&mut caller, reg_id, value);
            slot += ptr_size;
        }

        let return_addr_offset = sp + stack_size - ptr_size - memory.task_address();
        let bytes = memory
            .translate_slice(return_addr_offset, ptr_size)
            .ok_or(FrameReaderError::MemoryAccess)?;
        let return_addr = match ptr_size {
            8 => u64::from_le_bytes(bytes.try_into().unwrap()),
            4 => u32::from_le_bytes(bytes.try_into().unwrap()) as u64,
            _ => unreachable!(),
        };
        if return_addr == 0 {
            return Err(FrameReaderError::NotFound);
        }

        let new_sp = sp + stack_size;
        if new_sp <= sp {
            return Err(FrameReaderError::NotProgressing);
        }

        caller.set(RegNum::Pc, return_addr);
        caller.set(RegNum::Sp, new_sp);
        Ok(caller)
    }

    /// Looks up and steps using the encoding for `func_offset`
    /// (image-relative). Returns `NotFound` if no entry covers it, or if
    /// the entry defers to DWARF (`UNWIND_X86_64_MODE_DWARF`), since that
    /// case belongs to [`super::DwarfCfiReader`].
    pub fn step_at_offset(
        &self,
        func_offset: u32,
        regs: &RegisterState,
        memory: &MemoryObject,
    ) -> Result<RegisterState, FrameReaderError> {
        let encoding = self
            .encoding_for_offset(func_offset)
            .ok_or(FrameReaderError::NotFound)?;
        if encoding == 0 {
            return Err(FrameReaderError::NotFound);
        }

        match encoding & UNWIND_MODE_MASK {
            UNWIND_MODE_EBP_FRAME => self.step_frame_based(encoding, regs, memory),
            UNWIND_MODE_STACK_IMMD | UNWIND_MODE_STACK_IND => {
                self.step_frameless(encoding, regs, memory)
            }
            UNWIND_MODE_DWARF => Err(FrameReaderError::NotFound),
            _ => Err(FrameReaderError::Malformed(format!(
                "unknown compact unwind mode in encoding {encoding:#010x}"
            ))),
        }
    }
}

impl FrameReader for CompactUnwindReader {
    fn kind(&self) -> FrameReaderKind {
        FrameReaderKind::CompactUnwind
    }

    fn step(
        &self,
        regs: &RegisterState,
        memory: &MemoryObject,
    ) -> Result<RegisterState, FrameReaderError> {
        if matches!(self.arch, Arch::Arm32) {
            // `__unwind_info` is an x86/x86_64-only Mach-O section format;
            // 32-bit ARM images never carry one, so this reader has
            // nothing to contribute there (frame-pointer/DWARF cover it).
            return Err(FrameReaderError::NotFound);
        }
        let pc = regs.get(RegNum::Pc).ok_or(FrameReaderError::NotFound)?;
        let func_offset = pc
            .checked_sub(self.section.task_address())
            .ok_or(FrameReaderError::NotFound)? as u32;
        self.step_at_offset(func_offset, regs, memory)
    }
}

/// Decodes a Lehmer-coded permutation of `count` registers drawn (without
/// replacement) from the 6-register pool `{RBX, R12, R13, R14, R15, RBP}`,
/// numbered 1..=6. Unused trailing slots are zero.
fn decode_permutation(mut permutation: u32, count: usize) -> [u8; 6] {
    let mut digits = [0u32; 6];
    let factorials: [u32; 6] = [120, 24, 6, 2, 1, 1];
    // The digit radixes shrink as fewer registers remain to choose from;
    // Apple's header special-cases each count because the radixes aren't
    // simply `factorials` once count < 6, but the scheme is the same
    // factorial-number-system decode throughout.
    let radixes: &[u32] = match count {
        6 => &[120, 24, 6, 2, 1],
        5 => &[120, 24, 6, 2],
        4 => &[60, 12, 3],
        3 => &[20, 4],
        2 => &[5],
        _ => &[],
    };
    for (i, &radix) in radixes.iter().enumerate() {
        digits[i] = permutation / radix;
        permutation -= digits[i] * radix;
    }
    if count >= 1 {
        digits[count - 1] = permutation;
    }
    let _ = factorials;

    let mut used = [false; 7];
    let mut result = [0u8; 6];
    for i in 0..count {
        let mut remaining = digits[i];
        for candidate in 1..=6u8 {
            if used[candidate as usize] {
                continue;
            }
            if remaining == 0 {
                result[i] = candidate;
                used[candidate as usize] = true;
                break;
            }
            remaining -= 1;
        }
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn permutation_zero_picks_registers_in_pool_order() {
        // permutation 0 always means "take the lowest available register
        // at each step", i.e. the pool's natural order.
        let decoded = decode_permutation(0, 3);
        assert_eq!(&decoded[..3], &[1, 2, 3]);
    }

    #[test]
    fn permutation_respects_count() {
        let decoded = decode_permutation(0, 1);
        assert_eq!(decoded[0], 1);
        assert_eq!(decoded[1], 0);
    }
}
