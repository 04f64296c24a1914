//! DWARF CFI (`__eh_frame`) reader, via `gimli`.
//!
//! The reader of record whenever an image's compact unwind info defers to
//! DWARF (`UNWIND_X86_64_MODE_DWARF`) or doesn't cover an address at all.
//! `gimli` does the FDE/CIE parsing and CFA-rule evaluation; this module's
//! job is translating between this crate's [`RegisterState`] and gimli's
//! DWARF register numbers, and evaluating the resulting
//! [`gimli::RegisterRule`]s against live memory.
//!
//! `UnwindContext` is reused across lookups, `unwind_info_for_address` is
//! keyed on the current PC, and the resulting `CfaRule`/`RegisterRule`
//! pair is evaluated against live memory to recover SP and the
//! return-address register.

use super::{FrameReader, FrameReaderError, FrameReaderKind};
use crate::mobject::MemoryObject;
use crate::regs::{Arch, RegNum, RegisterState};
use gimli::{BaseAddresses, CfaRule, EhFrame, LittleEndian, RegisterRule, UnwindContext};

pub struct DwarfCfiReader {
    arch: Arch,
    /// View over the image's `__eh_frame` section.
    eh_frame_section: MemoryObject,
    /// This image's `__TEXT` base, for `BaseAddresses::set_text`.
    text_base: u64,
}

impl DwarfCfiReader {
    pub fn new(arch: Arch, eh_frame_section: MemoryObject, text_base: u64) -> Self {
        Self {
            arch,
            eh_frame_section,
            text_base,
        }
    }

    fn return_address_dwarf_num(&self) -> u16 {
        match self.arch {
            Arch::X86_64 => 16,
            Arch::X86 => 8,
            Arch::Arm32 => 14, // lr
        }
    }

    fn read_u64(&self, memory: &MemoryObject, addr: u64) -> Option<u64> {
        let offset = addr.checked_sub(memory.task_address())?;
        let bytes = memory.translate_slice(offset, 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    fn resolve_rule(
        &self,
        rule: &RegisterRule<usize>,
        cfa: u64,
        regs: &RegisterState,
        memory: &MemoryObject,
    ) -> Result<Option<u64>, FrameReaderError> {
        match rule {
            RegisterRule::Undefined => Ok(None),
            RegisterRule::SameValue => Ok(None),
            RegisterRule::Offset(offset) => {
                let addr = cfa.wrapping_add_signed(*offset);
                Ok(Some(
                    self.read_u64(memory, addr)
                        .ok_or(FrameReaderError::MemoryAccess)?,
                ))
            }
            RegisterRule::ValOffset(offset) => Ok(Some(cfa.wrapping_add_signed(*offset))),
            RegisterRule::Register(other) => {
                let mapped = regs
                    .map_from_dwarf(other.0 as u16)
                    .ok_or(FrameReaderError::Malformed(format!(
                        "unmapped dwarf register {}",
                        other.0
                    )))?;
                Ok(regs.get(mapped))
            }
            RegisterRule::Expression(_) | RegisterRule::ValExpression(_) => {
                Err(FrameReaderError::Malformed(
                    "dwarf expression-based register rules are not evaluated".into(),
                ))
            }
            RegisterRule::Architectural => Err(FrameReaderError::Malformed(
                "architectural register rule has no portable evaluation".into(),
            )),
            _ => Err(FrameReaderError::Malformed(
                "unrecognized dwarf register rule".into(),
            )),
        }
    }
}

impl FrameReader for DwarfCfiReader {
    fn kind(&self) -> FrameReaderKind {
        FrameReaderKind::DwarfCfi
    }

    fn step(
        &self,
        regs: &RegisterState,
        memory: &MemoryObject,
    ) -> Result<RegisterState, FrameReaderError> {
        let pc = regs.get(RegNum::Pc).ok_or(FrameReaderError::NotFound)?;

        let data = self.eh_frame_section.as_slice();
        let eh_frame = EhFrame::new(data, LittleEndian);
        let bases = BaseAddresses::default()
            .set_eh_frame(self.eh_frame_section.task_address())
            .set_text(self.text_base);
        let mut ctx = UnwindContext::new();

        let unwind_info = eh_frame
            .unwind_info_for_address(&bases, &mut ctx, pc, EhFrame::cie_from_offset)
            .map_err(|_| FrameReaderError::NotFound)?;

        let current_sp = regs.get(RegNum::Sp).ok_or(FrameReaderError::NotFound)?;

        let cfa = match unwind_info.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                let reg = regs.map_from_dwarf(register.0 as u16).ok_or_else(|| {
                    FrameReaderError::Malformed(format!("unmapped cfa register {}", register.0))
                })?;
                let base = regs.get(reg).ok_or(FrameReaderError::NotFound)?;
                base.wrapping_add_signed(*offset)
            }
            CfaRule::Expression(_) => {
                return Err(FrameReaderError::Malformed(
                    "dwarf expression CFA is not evaluated".into(),
                ))
            }
        };

        if cfa <= current_sp {
            return Err(FrameReaderError::NotProgressing);
        }

        let ra_num = self.return_address_dwarf_num();
        let ra_rule = unwind_info.register(gimli::Register(ra_num as u16));
        let return_addr = self
            .resolve_rule(&ra_rule, cfa, regs, memory)?
            .ok_or(FrameReaderError::NotFound)?;
        if return_addr == 0 {
            return Err(FrameReaderError::NotFound);
        }

        let mut caller = RegisterState::new(self.arch);
        caller.set(RegNum::Sp, cfa);
        caller.set(RegNum::Pc, return_addr);

        if let Some(fp_dwarf) = regs.map_to_dwarf(RegNum::Fp) {
            let fp_rule = unwind_info.register(gimli::Register(fp_dwarf));
            if let Some(value) = self.resolve_rule(&fp_rule, cfa, regs, memory)? {
                caller.set(RegNum::Fp, value);
            }
        }

        // Fp/Sp/the return-address register aren't the only callee-saved
        // state a CIE's CFI program restores; walk the rest of the row's
        // register rules for this architecture's tracked GPR columns too,
        // so e.g. rbx/r12-r15 survive a DWARF-unwound step the same way
        // they'd survive a frame-pointer or compact-unwind one. Unlike the
        // CFA/return-address rules, a GPR rule this reader can't evaluate
        // is skipped rather than failing the whole step -- these are
        // supplementary, not required to keep unwinding.
        for (gpr_idx, &dwarf_num) in caller.tracked_gpr_dwarf_nums().iter().enumerate() {
            let rule = unwind_info.register(gimli::Register(dwarf_num));
            if let Ok(Some(value)) = self.resolve_rule(&rule, cfa, regs, memory) {
                caller.set_gpr(gpr_idx as u8, value);
            }
        }

        Ok(caller)
    }
}
