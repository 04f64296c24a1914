//! Reporter configuration.
//!
//! Recognized options are validated eagerly in [`ReporterConfig::validate`],
//! called from `Reporter::enable` -- by the time a signal can arrive there
//! is no safe way to surface a configuration mistake, so every check that
//! can run ahead of time does.

use std::ffi::c_void;
use std::path::PathBuf;
use thiserror::Error;

/// Which exceptions should be turned into a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ExceptionHandling {
    /// Only synchronous fault signals are hooked.
    #[default]
    None,
    /// Fault signals plus uncaught language-level exceptions, if the host
    /// runtime exposes that notification path.
    UncaughtOnly,
    /// Fault signals, uncaught exceptions, and user-requested reports.
    All,
}

/// Opaque callback invoked after a report has been written, still on the
/// signal stack. The pointer is never dereferenced by this crate; it is
/// passed back to the caller's `context` verbatim.
pub type PostCrashCallback = extern "C" fn(context: *mut c_void);

/// User-facing configuration for [`crate::signal_driver::Reporter`].
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub application_identifier: String,
    pub application_version: String,
    pub exception_handling: ExceptionHandling,
    pub output_path: PathBuf,
    pub post_crash_callback: Option<(PostCrashCallback, usize)>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("application_identifier must not be empty")]
    EmptyIdentifier,
    #[error("output_path {0:?} has no parent directory")]
    NoParentDirectory(PathBuf),
    #[error("output_path's parent directory {0:?} does not exist")]
    ParentDirectoryMissing(PathBuf),
}

impl ReporterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_identifier.is_empty() {
            return Err(ConfigError::EmptyIdentifier);
        }

        let parent = self
            .output_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| ConfigError::NoParentDirectory(self.output_path.clone()))?;

        if !parent.is_dir() {
            return Err(ConfigError::ParentDirectoryMissing(parent.to_path_buf()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_empty_identifier() {
        let cfg = ReporterConfig {
            application_identifier: String::new(),
            application_version: "1.0".into(),
            exception_handling: ExceptionHandling::None,
            output_path: PathBuf::from("/tmp/report.crash"),
            post_crash_callback: None,
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyIdentifier)));
    }

    #[test]
    fn rejects_missing_parent() {
        let cfg = ReporterConfig {
            application_identifier: "com.example.app".into(),
            application_version: "1.0".into(),
            exception_handling: ExceptionHandling::None,
            output_path: PathBuf::from("/definitely/not/here/report.crash"),
            post_crash_callback: None,
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ParentDirectoryMissing(_))
        ));
    }

    #[test]
    fn accepts_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ReporterConfig {
            application_identifier: "com.example.app".into(),
            application_version: "1.0".into(),
            exception_handling: ExceptionHandling::All,
            output_path: dir.path().join("report.crash"),
            post_crash_callback: None,
        };
        assert!(cfg.validate().is_ok());
    }
}
