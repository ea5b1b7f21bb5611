//! Shared logging primitives: rotation and redaction.

pub mod redact;
pub mod rotate;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use redact::{redact_secrets, sanitize_column, strip_controls, Redactor};
pub use rotate::{RotatingLog, RotationPolicy};

use crate::fsutil::FsError;

/// Errors raised by [`RotatingLog`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LogError {
    /// The log path has no usable file name.
    #[error("invalid log path: {}", .0.display())]
    InvalidPath(PathBuf),

    /// An earlier writer panicked while holding the in-process lock.
    #[error("log writer lock poisoned")]
    Poisoned,

    /// I/O error while appending, rotating or reading.
    #[error("log I/O error: {context}: {source}")]
    Io {
        /// Description of what was being attempted.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

impl LogError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<FsError> for LogError {
    fn from(e: FsError) -> Self {
        Self::io(e.context, e.source)
    }
}
