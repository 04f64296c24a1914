//! End-to-end exercises of the frame cursor over a synthetic, in-process
//! call stack (no real crash or Mach-O image involved).

use crashcorder_core::cursor::Cursor;
use crashcorder_core::frame_reader::{FrameReader, FramePointerReader};
use crashcorder_core::mobject::MemoryObject;
use crashcorder_core::regs::{Arch, RegNum, RegisterState};

#[repr(C)]
struct FrameRecord {
    saved_fp: u64,
    return_addr: u64,
}

/// Three chained frame records, each pointing at the next, terminating in
/// a zero return address (the classic "top of stack" marker).
struct Chain {
    frames: [FrameRecord; 3],
}

impl Chain {
    fn new() -> Box<Self> {
        Box::new(Self {
            frames: [
                FrameRecord {
                    saved_fp: 0,
                    return_addr: 0,
                },
                FrameRecord {
                    saved_fp: 0,
                    return_addr: 0,
                },
                FrameRecord {
                    saved_fp: 0,
                    return_addr: 0,
                },
            ],
        })
    }

    fn wire_up(&mut self) {
        let base = self.frames.as_ptr() as u64;
        let stride = std::mem::size_of::<FrameRecord>() as u64;
        // frame[0].saved_fp -> frame[1], frame[1].saved_fp -> frame[2],
        // frame[2] terminates (return_addr stays 0).
        self.frames[0].saved_fp = base + stride;
        self.frames[0].return_addr = 0x1111;
        self.frames[1].saved_fp = base + stride * 2;
        self.frames[1].return_addr = 0x2222;
        // frame[2] left as a terminal marker.
    }

    fn addr_of(&self, index: usize) -> u64 {
        self.frames.as_ptr() as u64 + index as u64 * std::mem::size_of::<FrameRecord>() as u64
    }
}

fn whole_chain_memory(chain: &Chain) -> MemoryObject {
    let base = chain.frames.as_ptr() as u64;
    let len = std::mem::size_of::<FrameRecord>() as u64 * chain.frames.len() as u64;
    MemoryObject::for_self(base, len + 16).unwrap()
}

#[test]
fn frame_pointer_only_unwind_walks_the_whole_chain() {
    let mut chain = Chain::new();
    chain.wire_up();

    let mut regs = RegisterState::new(Arch::X86_64);
    regs.set(RegNum::Pc, 0x0000);
    regs.set(RegNum::Fp, chain.addr_of(0));
    regs.set(RegNum::Sp, chain.addr_of(0) - 8);

    let memory = whole_chain_memory(&chain);
    let reader: Box<dyn FrameReader> = Box::new(FramePointerReader::new(Arch::X86_64));
    let mut cursor = Cursor::new(regs, vec![reader], 16);

    let frames = cursor.collect_all(&memory);
    // frame 0 (initial) + two stepped frames (0x1111, 0x2222); frame[2]'s
    // zero return address terminates the walk before a fourth frame.
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[1].regs.get(RegNum::Pc), Some(0x1111));
    assert_eq!(frames[2].regs.get(RegNum::Pc), Some(0x2222));
    assert!(cursor.is_terminated());
}

#[test]
fn corrupt_frame_pointer_terminates_without_panicking() {
    let mut chain = Chain::new();
    chain.wire_up();
    // Corrupt frame[1]'s saved_fp to point far outside the mapped memory
    // object, simulating a smashed stack (the BAD_FRAME scenario).
    chain.frames[1].saved_fp = 0xdead_beef_0000_0000;

    let mut regs = RegisterState::new(Arch::X86_64);
    regs.set(RegNum::Pc, 0x0000);
    regs.set(RegNum::Fp, chain.addr_of(0));
    regs.set(RegNum::Sp, chain.addr_of(0) - 8);

    let memory = whole_chain_memory(&chain);
    let reader: Box<dyn FrameReader> = Box::new(FramePointerReader::new(Arch::X86_64));
    let mut cursor = Cursor::new(regs, vec![reader], 16);

    let frames = cursor.collect_all(&memory);
    // frame 0, then frame[0] -> frame[1] succeeds (0x1111), then stepping
    // from frame[1]'s corrupted fp fails to read memory and the cursor
    // stops cleanly rather than propagating a panic.
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].regs.get(RegNum::Pc), Some(0x1111));
}

#[test]
fn max_depth_is_enforced_even_on_an_infinite_chain() {
    // A self-referential frame record: always yields itself as "caller".
    #[repr(C)]
    struct SelfLoop {
        saved_fp: u64,
        return_addr: u64,
    }
    let mut record = Box::new(SelfLoop {
        saved_fp: 0,
        return_addr: 0x9999,
    });
    let addr = &*record as *const _ as u64;
    record.saved_fp = addr;

    let mut regs = RegisterState::new(Arch::X86_64);
    regs.set(RegNum::Pc, 0x0000);
    regs.set(RegNum::Fp, addr);
    regs.set(RegNum::Sp, addr - 8);

    let memory = MemoryObject::for_self(addr, std::mem::size_of::<SelfLoop>() as u64).unwrap();
    let reader: Box<dyn FrameReader> = Box::new(FramePointerReader::new(Arch::X86_64));
    let mut cursor = Cursor::new(regs, vec![reader], 5);

    let frames = cursor.collect_all(&memory);
    assert_eq!(frames.len(), 5);
}
