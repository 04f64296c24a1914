//! Crate-wide error taxonomy.
//!
//! Every subsystem has its own `thiserror` enum, and [`CoreError`] unifies
//! them for callers that don't care which subsystem failed. Frame readers
//! and the symbolicator
//! use their own narrower enums directly (see [`crate::frame_reader::FrameReaderError`]
//! and [`crate::objc::ObjcError`]) since their callers branch on the
//! specific variants (`NotFound` means "try the next reader", not "abort").

use thiserror::Error;

/// A Mach kernel error, as returned by most `mach2` calls.
///
/// See `usr/include/mach/kern_return.h`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("specified address is not currently valid")]
    InvalidAddress,
    #[error("specified memory is valid, but does not permit the required forms of access")]
    ProtectionFailure,
    #[error("the function requested was not applicable to this type of argument, or an argument is invalid")]
    InvalidArgument,
    #[error("the function could not be performed")]
    Failure,
    #[error("system resource could not be allocated to fulfill this request")]
    ResourceShortage,
    #[error("target task isn't an active task")]
    InvalidTask,
    #[error("a blatant range error")]
    InvalidValue,
    #[error("the provided buffer is of insufficient size for the requested data")]
    InsufficientBufferSize,
}

#[cfg(target_os = "macos")]
impl From<mach2::kern_return::kern_return_t> for KernelError {
    fn from(kr: mach2::kern_return::kern_return_t) -> Self {
        use mach2::kern_return::*;
        match kr {
            KERN_INVALID_ADDRESS => Self::InvalidAddress,
            KERN_PROTECTION_FAILURE => Self::ProtectionFailure,
            KERN_INVALID_ARGUMENT => Self::InvalidArgument,
            KERN_RESOURCE_SHORTAGE => Self::ResourceShortage,
            KERN_INVALID_TASK => Self::InvalidTask,
            KERN_INVALID_VALUE => Self::InvalidValue,
            52 => Self::InsufficientBufferSize,
            _ => Self::Failure,
        }
    }
}

/// Errors from [`crate::mobject::MemoryObject`].
#[derive(Debug, Error)]
pub enum MobjectError {
    #[error("the requested range is not mapped in the target task")]
    NotFound,
    #[error("the requested range is mapped but not readable")]
    Access,
    #[error("the kernel call establishing the view failed: {0}")]
    Internal(#[from] KernelError),
}

/// Errors from [`crate::macho::MachOReader`].
#[derive(Debug, Error)]
pub enum MachOError {
    #[error("mach-o magic number did not match any known value")]
    InvalidMagic,
    #[error("load commands overran the mapped header")]
    TruncatedLoadCommands,
    #[error("no section named {segment}/{section} in this image")]
    SectionNotFound { segment: String, section: String },
    #[error(transparent)]
    Mobject(#[from] MobjectError),
}

/// Top-level error kind, unifying every subsystem for callers that just
/// want "did this work" without matching on the specific cause.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Mobject(#[from] MobjectError),
    #[error(transparent)]
    MachO(#[from] MachOError),
    #[error(transparent)]
    FrameReader(#[from] crate::frame_reader::FrameReaderError),
    #[error(transparent)]
    Objc(#[from] crate::objc::ObjcError),
    #[error(transparent)]
    Writer(#[from] crate::log_writer::WriterError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
