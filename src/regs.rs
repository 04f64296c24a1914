//! Architecture-neutral register state.
//!
//! Every frame reader produces and consumes a [`RegisterState`] rather than
//! an architecture-specific struct, so the cursor and frame readers can be
//! written once and dispatched per architecture only where the actual bit
//! layout matters. Registers not yet known for a frame are
//! simply absent from the validity bitmap, rather than zeroed -- reading an
//! absent register is a programming error, not a silent zero.
//!
//! Follows the same per-arch "one function, `cfg`-gated body" shape used
//! for capturing CPU state off a thread port, adapted here to capturing
//! the live register state of the calling thread directly.

use bitflags::bitflags;

/// Architectures this crate knows how to unwind. Scope is deliberately
/// narrow: 32- and 64-bit x86, and 32-bit ARM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
    Arm32,
}

/// Logical register slot, architecture-neutral. Every architecture maps a
/// subset of these; reading a slot this arch doesn't have is always
/// `None`, never a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegNum {
    Pc = 0,
    Sp = 1,
    Fp = 2,
    Lr = 3,
    /// General-purpose scratch registers, indexed 0..16. Which index maps
    /// to which physical register is architecture-specific (see
    /// [`RegisterState::current`]'s arch-gated fill).
    Gpr0 = 4,
}

const MAX_REGS: usize = 32;

/// Number of `Gpr0..` slots this crate tracks per architecture: the
/// callee-saved general-purpose registers a frame reader can actually
/// recover (x86_64: rbx/r12-r15; x86: ebx/esi/edi plus ecx/edx, which
/// Apple's compact-unwind format allows a frame to spill even though the
/// ABI doesn't require it; arm32: r4-r8/r10).
const GPR_TRACK_SLOTS: usize = 6;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Validity: u32 {
        const NONE = 0;
    }
}

/// A snapshot of a thread's (or a computed frame's) register values.
///
/// Values are always full 64-bit words, zero-extended for 32-bit
/// architectures, so frame readers don't need to special-case pointer
/// width when doing arithmetic on them.
#[derive(Clone)]
pub struct RegisterState {
    arch: Arch,
    values: [u64; MAX_REGS],
    valid: u64,
}

impl RegisterState {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            values: [0; MAX_REGS],
            valid: 0,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    fn slot_index(&self, reg: RegNum) -> usize {
        reg as usize
    }

    pub fn has(&self, reg: RegNum) -> bool {
        self.valid & (1 << self.slot_index(reg)) != 0
    }

    /// Returns the register's value, or `None` if this frame never
    /// determined it.
    pub fn get(&self, reg: RegNum) -> Option<u64> {
        self.has(reg).then(|| self.values[self.slot_index(reg)])
    }

    pub fn set(&mut self, reg: RegNum, value: u64) {
        let idx = self.slot_index(reg);
        self.values[idx] = value;
        self.valid |= 1 << idx;
    }

    pub fn clear(&mut self, reg: RegNum) {
        let idx = self.slot_index(reg);
        self.valid &= !(1 << idx);
    }

    fn gpr_slot(index: u8) -> Option<usize> {
        let slot = RegNum::Gpr0 as usize + index as usize;
        (slot < MAX_REGS).then_some(slot)
    }

    /// Indexed general-purpose register access, for frame readers (like
    /// compact-unwind's register permutation decoder) that address
    /// registers by small integer rather than by name.
    pub fn gpr(&self, index: u8) -> Option<u64> {
        let slot = Self::gpr_slot(index)?;
        (self.valid & (1 << slot) != 0).then_some(self.values[slot])
    }

    pub fn set_gpr(&mut self, index: u8, value: u64) {
        let slot = Self::gpr_slot(index).expect("gpr index out of range");
        self.values[slot] = value;
        self.valid |= 1 << slot;
    }

    /// Drops every register not guaranteed to survive a call per this
    /// architecture's calling convention, leaving only the callee-saved
    /// set (named registers plus the tracked `Gpr0..` slots) plus
    /// `Sp`/`Pc`. Frame readers call this on the state they hand back from
    /// `step`, since a caller's non-callee-saved registers cannot be
    /// recovered once a callee has run, and a reader that cloned its input
    /// (to carry forward registers it didn't itself touch) may otherwise
    /// leak stale volatile values into the next frame.
    pub fn clear_volatile(&mut self) {
        let keep: &[RegNum] = match self.arch {
            Arch::X86_64 => &[RegNum::Sp, RegNum::Fp, RegNum::Pc],
            Arch::X86 => &[RegNum::Sp, RegNum::Fp, RegNum::Pc],
            Arch::Arm32 => &[RegNum::Sp, RegNum::Fp, RegNum::Lr, RegNum::Pc],
        };
        let mut kept = RegisterState::new(self.arch);
        for &reg in keep {
            if let Some(v) = self.get(reg) {
                kept.set(reg, v);
            }
        }
        for i in 0..GPR_TRACK_SLOTS as u8 {
            if let Some(v) = self.gpr(i) {
                kept.set_gpr(i, v);
            }
        }
        *self = kept;
    }

    /// DWARF register numbers of this architecture's tracked `Gpr0..`
    /// slots, in slot order. Lets the DWARF CFI reader walk the full
    /// register-rule table for every callee-saved column, not just the
    /// CFA/return-address/frame-pointer registers it resolves by name.
    pub fn tracked_gpr_dwarf_nums(&self) -> &'static [u16] {
        match self.arch {
            Arch::X86_64 => &[3, 12, 13, 14, 15], // rbx, r12, r13, r14, r15
            Arch::X86 => &[3, 6, 7, 1, 2],         // ebx, esi, edi, ecx, edx
            Arch::Arm32 => &[4, 5, 6, 7, 8, 10],   // r4-r8, r10
        }
    }

    /// Maps a logical register to the DWARF register number this
    /// architecture's CFI uses, per the System V / ARM EHABI register
    /// numbering conventions.
    pub fn map_to_dwarf(&self, reg: RegNum) -> Option<u16> {
        match (self.arch, reg) {
            (Arch::X86_64, RegNum::Pc) => Some(16),
            (Arch::X86_64, RegNum::Sp) => Some(7),
            (Arch::X86_64, RegNum::Fp) => Some(6),
            (Arch::X86_64, RegNum::Gpr0) => Some(0), // rax
            (Arch::X86, RegNum::Pc) => Some(8),
            (Arch::X86, RegNum::Sp) => Some(4),
            (Arch::X86, RegNum::Fp) => Some(5),
            (Arch::Arm32, RegNum::Pc) => Some(15),
            (Arch::Arm32, RegNum::Sp) => Some(13),
            (Arch::Arm32, RegNum::Lr) => Some(14),
            (Arch::Arm32, RegNum::Fp) => Some(11), // r7 on thumb varies; r11 in AAPCS
            _ => None,
        }
    }

    pub fn map_from_dwarf(&self, dwarf_num: u16) -> Option<RegNum> {
        match self.arch {
            Arch::X86_64 => match dwarf_num {
                16 => Some(RegNum::Pc),
                7 => Some(RegNum::Sp),
                6 => Some(RegNum::Fp),
                _ => None,
            },
            Arch::X86 => match dwarf_num {
                8 => Some(RegNum::Pc),
                4 => Some(RegNum::Sp),
                5 => Some(RegNum::Fp),
                _ => None,
            },
            Arch::Arm32 => match dwarf_num {
                15 => Some(RegNum::Pc),
                13 => Some(RegNum::Sp),
                14 => Some(RegNum::Lr),
                11 => Some(RegNum::Fp),
                _ => None,
            },
        }
    }

    /// Captures the calling thread's own register state.
    ///
    /// This is used for the "first frame" of an in-process unwind (no
    /// signal context available, e.g. a user-requested report rather than
    /// a crash). The contract callers must honor: since there is no
    /// portable way to read the caller's registers except from exactly
    /// this stack frame, the values captured describe *this* function's
    /// prologue state, which is only valid as "frame zero" if the caller
    /// inlines or immediately forwards the result -- any intervening call
    /// clobbers volatile registers the platform ABI doesn't guarantee
    /// `current()` preserved.
    #[inline(never)]
    pub fn current(arch: Arch) -> Self {
        let mut state = Self::new(arch);
        let sp = current_sp();
        let fp = current_fp();
        let pc = Self::current as usize as u64;
        state.set(RegNum::Sp, sp);
        state.set(RegNum::Fp, fp);
        state.set(RegNum::Pc, pc);
        state
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn current_sp() -> u64 {
    let sp: u64;
    // SAFETY: reads a register into a local, no side effects.
    unsafe { std::arch::asm!("mov {}, rsp", out(reg) sp) };
    sp
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn current_fp() -> u64 {
    let fp: u64;
    // SAFETY: reads a register into a local, no side effects.
    unsafe { std::arch::asm!("mov {}, rbp", out(reg) fp) };
    fp
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn current_sp() -> u64 {
    0
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn current_fp() -> u64 {
    0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unset_register_reads_as_none() {
        let state = RegisterState::new(Arch::X86_64);
        assert!(!state.has(RegNum::Fp));
        assert_eq!(state.get(RegNum::Fp), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut state = RegisterState::new(Arch::Arm32);
        state.set(RegNum::Lr, 0xdead_beef);
        assert_eq!(state.get(RegNum::Lr), Some(0xdead_beef));
        state.clear(RegNum::Lr);
        assert_eq!(state.get(RegNum::Lr), None);
    }

    #[test]
    fn clear_volatile_keeps_named_and_tracked_gpr_registers() {
        let mut state = RegisterState::new(Arch::X86_64);
        state.set(RegNum::Pc, 1);
        state.set(RegNum::Sp, 2);
        state.set(RegNum::Fp, 3);
        state.set(RegNum::Lr, 4); // not in x86_64's keep list
        state.set_gpr(0, 99); // rbx, tracked -- must survive
        state.clear_volatile();
        assert_eq!(state.get(RegNum::Pc), Some(1));
        assert_eq!(state.get(RegNum::Sp), Some(2));
        assert_eq!(state.get(RegNum::Fp), Some(3));
        assert_eq!(state.get(RegNum::Lr), None);
        assert_eq!(state.gpr(0), Some(99));
    }

    #[test]
    fn dwarf_mapping_round_trips_for_known_regs() {
        let state = RegisterState::new(Arch::X86_64);
        let dwarf = state.map_to_dwarf(RegNum::Sp).unwrap();
        assert_eq!(state.map_from_dwarf(dwarf), Some(RegNum::Sp));
    }

    #[test]
    fn gpr_index_out_of_range_is_none() {
        let state = RegisterState::new(Arch::X86_64);
        assert_eq!(state.gpr(16), None);
    }
}
