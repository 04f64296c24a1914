//! Signal driver: installs the fault handlers, and is the single entry
//! point -- whether reached via a real signal or a user-requested report
//! -- that actually walks the stack and writes a report.
//!
//! Deliberately departs from the classic "stash context, re-raise, let a
//! second pass do the work" pattern: everything happens inline, on the
//! original faulting thread/stack, in [`Reporter::crash_now`] and
//! [`handle_signal`]. There is no self-signal step to get wrong.
//!
//! Uses raw `libc::sigaction` plumbing to shell out to a handful of
//! kernel calls safely: install a handler, capture what was there before,
//! and chain to it once this handler is done.

use crate::config::ReporterConfig;
use crate::cursor::{Cursor, CursorError};
use crate::frame_reader::{CompactUnwindReader, DwarfCfiReader, FramePointerReader, FrameReader};
use crate::image::{Image, ImageList};
use crate::log_writer::{LogWriter, RecordTag, WriterError};
use crate::macho::MachOReader;
use crate::mobject::MemoryObject;
use crate::objc::{ClassSource, Symbol, Symbolicator};
use crate::regs::{Arch, RegNum, RegisterState};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// Header load commands never run past this many bytes in practice; reading
/// a fixed window avoids having to know the header's true size up front.
const HEADER_PROBE_SIZE: u64 = 4096;
/// How far past the current frame pointer/stack pointer to map when no
/// better bound is known. Large enough for realistic call depths without
/// risking an unmapped-page read into neighboring guard pages.
const STACK_PROBE_SIZE: u64 = 64 * 1024;
/// Window mapped around an image's base address when no cached size is
/// available yet, large enough to reach the ObjC metadata segments of a
/// typical small-to-medium framework image.
const OBJC_PROBE_SIZE: u64 = 4 * 1024 * 1024;

const WATCHED_SIGNALS: &[libc::c_int] = &[
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGABRT,
    libc::SIGTRAP,
];

/// Fixed-size scratch buffer the signal handler writes records into.
/// Large enough for a realistic stack (a few hundred frames) without
/// ever growing.
const REPORT_BUFFER_SIZE: usize = 256 * 1024;

struct ReporterState {
    images: ImageList,
    output_fd: RawFd,
    post_crash_callback: Option<(crate::config::PostCrashCallback, usize)>,
    previous_actions: [libc::sigaction; WATCHED_SIGNALS.len()],
}

// SAFETY: `ReporterState` is published once via `OnceLock` and never
// mutated again; every field is either `Sync` already or, for the raw
// callback pointer, treated as an opaque, never-dereferenced-by-us value.
unsafe impl Sync for ReporterState {}

static REPORTER_STATE: OnceLock<ReporterState> = OnceLock::new();
static REPORT_BUFFER: std::sync::Mutex<Vec<u8>> = std::sync::Mutex::new(Vec::new());

/// Owns the installed signal handlers and the image list they read from.
///
/// Only one `Reporter` may be [`enable`](Self::enable)d per process: the
/// handler it installs is a free function that reads global state, since
/// a signal handler cannot be a closure capturing `self`.
pub struct Reporter {
    config: ReporterConfig,
    enabled: AtomicBool,
}

impl Reporter {
    pub fn new(config: ReporterConfig) -> Result<Self, crate::config::ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            enabled: AtomicBool::new(false),
        })
    }

    /// Installs the signal handlers, chaining whatever was previously
    /// installed for each watched signal. Idempotent: a second `enable`
    /// call on an already-enabled reporter is a no-op.
    pub fn enable(&self, images: ImageList) -> Result<(), std::io::Error> {
        if self.enabled.swap(true, Ordering::AcqRel) {
            log::debug!("reporter already enabled, ignoring redundant enable() call");
            return Ok(());
        }

        let output_fd = open_output(&self.config.output_path)?;

        let mut previous_actions =
            [unsafe { std::mem::zeroed::<libc::sigaction>() }; WATCHED_SIGNALS.len()];

        let mut new_action: libc::sigaction = unsafe { std::mem::zeroed() };
        new_action.sa_sigaction = handle_signal as usize;
        new_action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
        // SAFETY: initializes a local sigset_t before use.
        unsafe { libc::sigemptyset(&mut new_action.sa_mask) };

        for (i, &sig) in WATCHED_SIGNALS.iter().enumerate() {
            // SAFETY: syscall; `previous_actions[i]` and `new_action` are
            // both valid, fully initialized `sigaction` values.
            let rc = unsafe {
                libc::sigaction(sig, &new_action, &mut previous_actions[i])
            };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        let _ = REPORTER_STATE.set(ReporterState {
            images,
            output_fd,
            post_crash_callback: self.config.post_crash_callback,
            previous_actions,
        });
        if let Ok(mut buf) = REPORT_BUFFER.lock() {
            buf.resize(REPORT_BUFFER_SIZE, 0);
        }

        log::info!(
            "crash reporter enabled for {} watched signals, writing to {}",
            WATCHED_SIGNALS.len(),
            self.config.output_path.display()
        );
        Ok(())
    }

    /// Restores whatever handlers were previously installed. Only
    /// meaningful for tests and embedding scenarios that explicitly want
    /// to uninstall; most applications run with the reporter enabled for
    /// their whole lifetime.
    pub fn disable(&self) {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(state) = REPORTER_STATE.get() {
            for (i, &sig) in WATCHED_SIGNALS.iter().enumerate() {
                // SAFETY: syscall, restoring a previously captured, valid
                // `sigaction`.
                unsafe {
                    libc::sigaction(sig, &state.previous_actions[i], std::ptr::null_mut());
                }
            }
        }
        log::info!("crash reporter disabled, previous handlers restored");
    }

    /// Writes a report for the calling thread's current stack, without
    /// going through a signal. Used for user-requested ("I want a report
    /// but nothing actually crashed") reports; see
    /// [`crate::config::ExceptionHandling::All`].
    pub fn crash_now(&self, reason: &str) {
        let Some(state) = REPORTER_STATE.get() else {
            return;
        };
        let regs = RegisterState::current(native_arch());
        write_report(state, &regs, ReportTrigger::Manual(reason));
    }
}

#[cfg(target_arch = "x86_64")]
fn native_arch() -> Arch {
    Arch::X86_64
}
#[cfg(target_arch = "x86")]
fn native_arch() -> Arch {
    Arch::X86
}
#[cfg(target_arch = "arm")]
fn native_arch() -> Arch {
    Arch::Arm32
}

fn open_output(path: &std::path::Path) -> Result<RawFd, std::io::Error> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: `c_path` is a valid, nul-terminated string for the duration
    // of this call.
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, 0o600) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

/// The actual signal handler. Async-signal-safe by construction: every
/// allocation happened before this function could ever run (the report
/// buffer is sized once in `enable`), and every syscall used
/// (`mach_vm_read`, `write`, `sigaction`) is on the POSIX async-signal-safe
/// list.
extern "C" fn handle_signal(
    sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    if let Some(state) = REPORTER_STATE.get() {
        if let Some(regs) = regs_from_ucontext(ctx) {
            write_report(state, &regs, ReportTrigger::Signal(sig));
        }
    }
    chain_to_previous(sig);
}

/// Extracts frame zero directly from the kernel-provided signal context,
/// rather than from wherever this handler's own prologue happens to sit.
/// `RegisterState::current` reads live `rsp`/`rbp` at its call site, which
/// inside a signal handler is this function's own frame, not the
/// instruction that actually faulted -- using it here would report the
/// handler unwinding itself instead of the crash.
fn regs_from_ucontext(ctx: *mut libc::c_void) -> Option<RegisterState> {
    if ctx.is_null() {
        return None;
    }
    // SAFETY: the kernel passes a live `ucontext_t*` as the third argument
    // to any handler installed with `SA_SIGINFO`, for the duration of the
    // handler call.
    let uc = unsafe { &*ctx.cast::<libc::ucontext_t>() };
    if uc.uc_mcontext.is_null() {
        return None;
    }
    // SAFETY: `uc_mcontext` is kernel-populated and valid for the
    // duration of the signal handler.
    let mc = unsafe { &*uc.uc_mcontext };

    #[cfg(target_arch = "x86_64")]
    {
        let ss = &mc.__ss;
        let mut regs = RegisterState::new(Arch::X86_64);
        regs.set(RegNum::Pc, ss.__rip);
        regs.set(RegNum::Sp, ss.__rsp);
        regs.set(RegNum::Fp, ss.__rbp);
        regs.set_gpr(0, ss.__rbx);
        regs.set_gpr(1, ss.__r12);
        regs.set_gpr(2, ss.__r13);
        regs.set_gpr(3, ss.__r14);
        regs.set_gpr(4, ss.__r15);
        Some(regs)
    }
    #[cfg(target_arch = "x86")]
    {
        let ss = &mc.__ss;
        let mut regs = RegisterState::new(Arch::X86);
        regs.set(RegNum::Pc, ss.__eip as u64);
        regs.set(RegNum::Sp, ss.__esp as u64);
        regs.set(RegNum::Fp, ss.__ebp as u64);
        regs.set_gpr(0, ss.__ebx as u64);
        regs.set_gpr(1, ss.__esi as u64);
        regs.set_gpr(2, ss.__edi as u64);
        regs.set_gpr(3, ss.__ecx as u64);
        regs.set_gpr(4, ss.__edx as u64);
        Some(regs)
    }
    #[cfg(target_arch = "arm")]
    {
        let ss = &mc.__ss;
        let mut regs = RegisterState::new(Arch::Arm32);
        regs.set(RegNum::Pc, ss.__pc as u64);
        regs.set(RegNum::Sp, ss.__sp as u64);
        regs.set(RegNum::Lr, ss.__lr as u64);
        regs.set(RegNum::Fp, ss.__r[11] as u64);
        for (gpr_idx, &dwarf_num) in regs.tracked_gpr_dwarf_nums().iter().enumerate() {
            // r4-r8/r10 map to AAPCS register numbers 1:1 with their
            // DWARF numbers on arm32.
            if let Some(&v) = ss.__r.get(dwarf_num as usize) {
                regs.set_gpr(gpr_idx as u8, v as u64);
            }
        }
        Some(regs)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "arm")))]
    {
        None
    }
}

/// What triggered this report: a real signal (carries the signal number,
/// written as an `Exception` record) or an explicit [`Reporter::crash_now`]
/// call (carries a caller-supplied reason string).
enum ReportTrigger<'a> {
    Signal(libc::c_int),
    Manual(&'a str),
}

fn write_report(state: &ReporterState, regs: &RegisterState, trigger: ReportTrigger) {
    let Ok(mut storage) = REPORT_BUFFER.try_lock() else {
        return;
    };
    let mut writer = LogWriter::new(&mut storage);

    match trigger {
        ReportTrigger::Manual(reason) => {
            let _ = writer.write_string_record(RecordTag::Header, reason);
        }
        ReportTrigger::Signal(sig) => {
            let _ = writer.write_u64_record(RecordTag::Exception, sig as u64);
        }
    }

    for image in state.images.iter() {
        let _ = write_image_record(&mut writer, image);
    }

    let Some(pc) = regs.get(RegNum::Pc) else {
        let _ = writer.write_record(RecordTag::Footer, &[]);
        let _ = writer.flush_to_fd(state.output_fd);
        return;
    };
    let Some(image) = state.images.find_by_address(pc) else {
        let _ = writer.write_u64_record(RecordTag::Frame, pc);
        let _ = writer.write_record(RecordTag::Footer, &[]);
        let _ = writer.flush_to_fd(state.output_fd);
        return;
    };

    let readers = build_readers(image.base(), regs.arch());
    let Some(stack_memory) = stack_view(regs) else {
        let _ = writer.write_record(RecordTag::Footer, &[]);
        let _ = writer.flush_to_fd(state.output_fd);
        return;
    };

    let objc_memory =
        MemoryObject::for_self(image.base(), image.size().unwrap_or(OBJC_PROBE_SIZE)).ok();
    let mut symbolicator = objc_memory.as_ref().map(Symbolicator::new);
    let class_source = objc_memory
        .as_ref()
        .and_then(|mem| classify_objc_source(mem, image));

    let mut cursor = Cursor::new(regs.clone(), readers, 256);
    loop {
        match cursor.next(&stack_memory) {
            Ok(Some(frame)) => {
                let Some(frame_pc) = frame.regs.get(RegNum::Pc) else {
                    continue;
                };
                let _ = writer.write_u64_record(RecordTag::Frame, frame_pc);

                if let (Some(symbolicator), Some(source)) =
                    (symbolicator.as_mut(), class_source.as_ref())
                {
                    if let Ok(symbol) = symbolicator.best_symbol(source, frame_pc) {
                        let _ = write_symbol_record(&mut writer, frame_pc, &symbol);
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = writer.write_string_record(RecordTag::SoftError, cursor_error_str(&err));
                break;
            }
        }
    }

    let _ = writer.write_record(RecordTag::Footer, &[]);
    let _ = writer.flush_to_fd(state.output_fd);

    if let Some((callback, context)) = state.post_crash_callback {
        // SAFETY: the caller of `ReporterConfig` promised this function
        // pointer is safe to call with `context` reinterpreted as a
        // pointer, from a signal handler, exactly once per crash.
        unsafe { callback(context as *mut std::ffi::c_void) };
    }
}

/// A static description of a cursor failure, for the `SoftError` record.
/// Deliberately not `format!`-based: nothing on this path may allocate.
fn cursor_error_str(err: &CursorError) -> &'static str {
    match err {
        CursorError::Exhausted => "unwind: every frame reader was exhausted",
        CursorError::MaxDepthReached(_) => "unwind: maximum depth reached",
    }
}

/// Writes one `RecordTag::Image` record: base address followed by the
/// image's path, truncated rather than rejected if it overruns the fixed
/// scratch buffer (a crash report listing a shortened path beats one
/// missing the image entirely).
fn write_image_record(writer: &mut LogWriter, image: &Image) -> Result<(), WriterError> {
    let mut buf = [0u8; 512];
    buf[0..8].copy_from_slice(&image.base().to_le_bytes());
    let path = image.path().to_bytes();
    let n = path.len().min(buf.len() - 8);
    buf[8..8 + n].copy_from_slice(&path[..n]);
    writer.write_record(RecordTag::Image, &buf[..8 + n])
}

/// Writes one `RecordTag::Symbol` record: the frame's PC, the matched
/// method's IMP, a class/instance-method flag, then the class and method
/// names as length-prefixed byte runs (each capped at 255 bytes so a
/// single `u8` length prefix suffices).
fn write_symbol_record(
    writer: &mut LogWriter,
    frame_pc: u64,
    symbol: &Symbol,
) -> Result<(), WriterError> {
    let mut buf = [0u8; 512];
    buf[0..8].copy_from_slice(&frame_pc.to_le_bytes());
    buf[8..16].copy_from_slice(&symbol.imp_addr.to_le_bytes());
    buf[16] = symbol.is_class_method as u8;
    let mut pos = 17;

    let class_bytes = symbol.class_name.as_bytes();
    let class_len = class_bytes.len().min(255).min(buf.len() - pos - 2);
    buf[pos] = class_len as u8;
    pos += 1;
    buf[pos..pos + class_len].copy_from_slice(&class_bytes[..class_len]);
    pos += class_len;

    let method_bytes = symbol.method_name.as_bytes();
    let method_len = method_bytes.len().min(255).min(buf.len() - pos - 1);
    buf[pos] = method_len as u8;
    pos += 1;
    buf[pos..pos + method_len].copy_from_slice(&method_bytes[..method_len]);
    pos += method_len;

    writer.write_record(RecordTag::Symbol, &buf[..pos])
}

/// Locates an image's ObjC classlist, modern or legacy, from its Mach-O
/// section table. `objc2`'s `class_t`/`class_ro_t` layout is 64-bit-only
/// (every field is a `u64`), so a 64-bit image is always treated as
/// modern and a 32-bit one as legacy -- this crate has never shipped on
/// an architecture where that assumption doesn't hold.
fn classify_objc_source(memory: &MemoryObject, image: &Image) -> Option<ClassSource> {
    let header_view = MemoryObject::for_self(image.base(), HEADER_PROBE_SIZE).ok()?;
    let macho = MachOReader::parse(&header_view, 0).ok()?;

    match macho.pointer_width() {
        crate::image::PointerWidth::Bits64 => {
            let info = macho
                .map_section("__DATA", "__objc_classlist")
                .or_else(|_| macho.map_section("__DATA_CONST", "__objc_classlist"))
                .ok()?;
            let runtime_addr = image.base() + (info.addr - macho.text_vmaddr());
            memory.translate_slice(runtime_addr.checked_sub(memory.task_address())?, 0)?;
            Some(ClassSource::Modern {
                classlist_addr: runtime_addr,
                count: info.size / 8,
            })
        }
        crate::image::PointerWidth::Bits32 => {
            let info = macho.map_section("__OBJC", "__module_info").ok()?;
            let runtime_addr = image.base() + (info.addr - macho.text_vmaddr());
            memory.translate_slice(runtime_addr.checked_sub(memory.task_address())?, 0)?;
            Some(ClassSource::Legacy {
                module_info_addr: runtime_addr,
                module_info_size: info.size,
            })
        }
    }
}

/// Establishes a view over the crashing thread's own stack, anchored at
/// whichever of `fp`/`sp` is available. Shrinks the requested window until
/// `mach_vm_read` succeeds, since the true extent of the live stack mapping
/// isn't known up front and a too-large request would otherwise fail
/// entirely instead of returning a smaller, still-useful view.
fn stack_view(regs: &RegisterState) -> Option<MemoryObject> {
    let anchor = regs.get(RegNum::Fp).or_else(|| regs.get(RegNum::Sp))?;
    let start = anchor.saturating_sub(16);
    let mut size = STACK_PROBE_SIZE;
    while size >= 256 {
        if let Ok(mo) = MemoryObject::for_self(start, size) {
            return Some(mo);
        }
        size /= 2;
    }
    None
}

/// Assembles the reader chain for `image_base`, in priority order: compact
/// unwind info first (cheapest, covers the common case), DWARF CFI next
/// (covers whatever compact unwind defers to `UNWIND_X86_64_MODE_DWARF` or
/// doesn't encode at all), frame-pointer walking last as the reader that
/// always has a chance of saying something even with no unwind tables.
/// Any step that can't establish a section view is simply skipped -- a
/// missing `__unwind_info` or `__eh_frame` is normal for some images, not
/// an error worth failing the whole report over.
fn build_readers(image_base: u64, arch: Arch) -> Vec<Box<dyn FrameReader>> {
    let mut readers: Vec<Box<dyn FrameReader>> = Vec::new();

    if let Ok(header_view) = MemoryObject::for_self(image_base, HEADER_PROBE_SIZE) {
        if let Ok(macho) = MachOReader::parse(&header_view, 0) {
            let text_vmaddr = macho.text_vmaddr();

            if let Ok(info) = macho.map_section("__TEXT", "__unwind_info") {
                let runtime_addr = image_base + (info.addr - text_vmaddr);
                if let Ok(section) = MemoryObject::for_self(runtime_addr, info.size) {
                    readers.push(Box::new(CompactUnwindReader::new(arch, section)));
                }
            }

            if let Ok(eh) = macho.map_section("__TEXT", "__eh_frame") {
                let runtime_addr = image_base + (eh.addr - text_vmaddr);
                if let Ok(section) = MemoryObject::for_self(runtime_addr, eh.size) {
                    readers.push(Box::new(DwarfCfiReader::new(arch, section, text_vmaddr)));
                }
            }
        }
    }

    readers.push(Box::new(FramePointerReader::new(arch)));
    readers
}

fn chain_to_previous(sig: libc::c_int) {
    let Some(state) = REPORTER_STATE.get() else {
        return;
    };
    let Some(index) = WATCHED_SIGNALS.iter().position(|&s| s == sig) else {
        return;
    };
    let previous = &state.previous_actions[index];
    if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN {
        // No prior handler to chain to; re-raising with the default
        // disposition restored terminates the process the way it would
        // have without this reporter installed.
        // SAFETY: syscall, restoring the default/ignore disposition.
        unsafe {
            libc::signal(sig, previous.sa_sigaction);
            libc::raise(sig);
        }
        return;
    }
    // SAFETY: `previous.sa_sigaction` was captured from a real, live
    // `sigaction` call in `Reporter::enable` and has matching `SA_SIGINFO`
    // semantics to what we installed.
    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            unsafe { std::mem::transmute(previous.sa_sigaction) };
        handler(sig, std::ptr::null_mut(), std::ptr::null_mut());
    } else {
        let handler: extern "C" fn(libc::c_int) =
            unsafe { std::mem::transmute(previous.sa_sigaction) };
        handler(sig);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reporter_rejects_invalid_config() {
        let config = ReporterConfig {
            application_identifier: String::new(),
            application_version: "1.0".into(),
            exception_handling: crate::config::ExceptionHandling::None,
            output_path: std::path::PathBuf::from("/tmp/x"),
            post_crash_callback: None,
        };
        assert!(Reporter::new(config).is_err());
    }
}
