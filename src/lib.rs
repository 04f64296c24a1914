#![allow(clippy::useless_conversion)]

#[cfg(not(target_os = "macos"))]
compile_error!("crashcorder-core only supports macOS: its unwinder and ObjC metadata parser are both built on Mach-O and Mach kernel APIs");

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "arm"
)))]
compile_error!("crashcorder-core supports only 32/64-bit x86 and 32-bit ARM");

pub mod config;
pub mod cursor;
pub mod error;
pub mod frame_reader;
pub mod image;
pub mod log_writer;
pub mod macho;
pub mod mobject;
pub mod objc;
pub mod regs;
pub mod signal_driver;
pub mod soft_error;

#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use config::{ExceptionHandling, ReporterConfig};
pub use error::{CoreError, Result};
pub use signal_driver::Reporter;

failspot::failspot_name! {
    pub enum FailSpotName {
        MachVmRead,
        MachOParse,
        ObjcClassResolve,
        FrameReaderStep,
        LogWriterFlush,
    }
}
