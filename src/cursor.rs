//! Frame cursor: the state machine that drives the frame
//! readers across an entire stack.
//!
//! Modeled on a simple `Initial -> Unwinding -> Done` progression, but
//! split into four named states (`Init`, `FirstFrame`, `Stepping`,
//! `Terminated`) to additionally distinguish "haven't emitted frame zero
//! yet" from "mid-unwind", which the cursor's own callers (the log
//! writer) use to know whether a report is non-empty.

use crate::frame_reader::{FrameReader, FrameReaderError, FrameReaderKind};
use crate::mobject::MemoryObject;
use crate::regs::{RegNum, RegisterState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("no frame reader could step past this frame")]
    Exhausted,
    #[error("maximum unwind depth ({0}) reached")]
    MaxDepthReached(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    FirstFrame,
    Stepping,
    Terminated,
}

/// One recovered frame: its register state (at minimum, `Pc`) and which
/// reader produced it, if any (frame zero has no reader -- it's the
/// thread's live state).
#[derive(Debug, Clone)]
pub struct Frame {
    pub regs: RegisterState,
    pub produced_by: Option<FrameReaderKind>,
}

/// Walks a stack one frame at a time, trying each configured
/// [`FrameReader`] in priority order at every step.
///
/// The stack pointer must increase monotonically across steps (the only
/// architecture-independent invariant a valid unwind can rely on); a
/// reader whose result doesn't honor that is treated the same as a
/// reader finding nothing; see [`FrameReaderError::NotProgressing`].
pub struct Cursor<'a> {
    readers: Vec<Box<dyn FrameReader + 'a>>,
    state: State,
    current: RegisterState,
    depth: usize,
    max_depth: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(initial: RegisterState, readers: Vec<Box<dyn FrameReader + 'a>>, max_depth: usize) -> Self {
        Self {
            readers,
            state: State::Init,
            current: initial,
            depth: 0,
            max_depth,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == State::Terminated
    }

    /// Advances the cursor by one frame, reading from `memory` as needed.
    /// Returns `Ok(None)` once the unwind has terminated normally (no
    /// more callers, or every reader was exhausted -- both are a clean
    /// stop, not an error the caller needs to act on).
    pub fn next(&mut self, memory: &MemoryObject) -> Result<Option<Frame>, CursorError> {
        match self.state {
            State::Init => {
                self.state = State::FirstFrame;
                self.depth = 1;
                Ok(Some(Frame {
                    regs: self.current.clone(),
                    produced_by: None,
                }))
            }
            State::FirstFrame | State::Stepping => {
                if self.depth >= self.max_depth {
                    self.state = State::Terminated;
                    return Err(CursorError::MaxDepthReached(self.max_depth));
                }

                let previous_sp = self.current.get(RegNum::Sp);
                let mut last_err = None;

                for reader in &self.readers {
                    match reader.step(&self.current, memory) {
                        Ok(mut caller) => {
                            if let (Some(prev_sp), Some(new_sp)) =
                                (previous_sp, caller.get(RegNum::Sp))
                            {
                                if new_sp <= prev_sp {
                                    last_err = Some(FrameReaderError::NotProgressing);
                                    continue;
                                }
                            }
                            // A reader may have carried forward registers
                            // it didn't itself resolve (frame-pointer and
                            // frameless compact-unwind both clone their
                            // input); drop anything not guaranteed to
                            // survive a call before handing the frame back.
                            caller.clear_volatile();
                            self.current = caller.clone();
                            self.state = State::Stepping;
                            self.depth += 1;
                            return Ok(Some(Frame {
                                regs: caller,
                                produced_by: Some(reader.kind()),
                            }));
                        }
                        Err(e) => last_err = Some(e),
                    }
                }

                self.state = State::Terminated;
                match last_err {
                    None | Some(FrameReaderError::NotFound) | Some(FrameReaderError::NotProgressing) => {
                        Ok(None)
                    }
                    Some(_) => Err(CursorError::Exhausted),
                }
            }
            State::Terminated => Ok(None),
        }
    }

    /// Collects every frame up to `max_depth`, stopping early on natural
    /// termination. Soft errors from individual steps are swallowed here
    /// (a partial stack is still a useful report); callers that need the
    /// distinction should drive [`Self::next`] directly.
    pub fn collect_all(&mut self, memory: &MemoryObject) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            match self.next(memory) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(_) => break,
            }
        }
        frames
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::regs::Arch;

    struct OneShotReader {
        return_addr: u64,
    }

    impl FrameReader for OneShotReader {
        fn kind(&self) -> FrameReaderKind {
            FrameReaderKind::FramePointer
        }
        fn step(
            &self,
            regs: &RegisterState,
            _memory: &MemoryObject,
        ) -> Result<RegisterState, FrameReaderError> {
            let sp = regs.get(RegNum::Sp).unwrap_or(0);
            if sp > 0x1000 {
                return Err(FrameReaderError::NotFound);
            }
            let mut caller = RegisterState::new(Arch::X86_64);
            caller.set(RegNum::Pc, self.return_addr);
            caller.set(RegNum::Sp, sp + 0x10);
            Ok(caller)
        }
    }

    fn dummy_memory() -> MemoryObject {
        let buf = [0u8; 8];
        MemoryObject::for_self(buf.as_ptr() as u64, 8).unwrap()
    }

    #[test]
    fn first_call_yields_frame_zero_without_a_reader() {
        let mut regs = RegisterState::new(Arch::X86_64);
        regs.set(RegNum::Pc, 0x1000);
        regs.set(RegNum::Sp, 0x100);
        let mut cursor = Cursor::new(regs, vec![Box::new(OneShotReader { return_addr: 0x2000 })], 8);

        let memory = dummy_memory();
        let frame = cursor.next(&memory).unwrap().unwrap();
        assert!(frame.produced_by.is_none());
        assert_eq!(frame.regs.get(RegNum::Pc), Some(0x1000));
    }

    #[test]
    fn terminates_when_reader_cannot_progress() {
        let mut regs = RegisterState::new(Arch::X86_64);
        regs.set(RegNum::Pc, 0x1000);
        regs.set(RegNum::Sp, 0x2000); // already above the reader's cutoff
        let mut cursor = Cursor::new(regs, vec![Box::new(OneShotReader { return_addr: 0x2000 })], 8);

        let memory = dummy_memory();
        let _ = cursor.next(&memory).unwrap(); // frame zero
        let result = cursor.next(&memory).unwrap();
        assert!(result.is_none());
        assert!(cursor.is_terminated());
    }

    #[test]
    fn respects_max_depth() {
        let mut regs = RegisterState::new(Arch::X86_64);
        regs.set(RegNum::Pc, 0x1000);
        regs.set(RegNum::Sp, 0x100);
        let mut cursor = Cursor::new(regs, vec![Box::new(OneShotReader { return_addr: 0x2000 })], 2);

        let memory = dummy_memory();
        let frames = cursor.collect_all(&memory);
        assert_eq!(frames.len(), 2);
    }
}
