//! Store Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// File does not exist
    #[display("file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Access denied by the filesystem
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Path contains invalid characters or escapes root
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Region, realm or scope name that cannot be part of a snapshot key
    #[display("invalid key: {_0}")]
    InvalidKey(#[error(not(source))] String),
    /// Backend-specific error
    #[display("backend error: {_0}")]
    BackendError(#[error(not(source))] String),
    /// The index disagrees with the directory contents; a rescan is required.
    #[display("corrupt store index: {_0}")]
    CorruptIndex(#[error(not(source))] String),
    /// Snapshot payload could not be decoded, or does not belong to its key.
    #[display("corrupt snapshot data: {_0}")]
    CorruptData(#[error(not(source))] String),
    /// Gzip encoding or decoding failed.
    #[display("compression error")]
    Compression,
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::BackendError(_))
    }

    /// Returns `true` for failures of the underlying filesystem, as opposed
    /// to bad input.
    pub fn is_io_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::PermissionDenied(_) | Self::BackendError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        assert_eq!(
            ErrorKind::NotFound(PathBuf::from("us/stormrage/1.json")).to_string(),
            "file not found: us/stormrage/1.json"
        );
        assert_eq!(ErrorKind::CorruptData("bad json".into()).to_string(), "corrupt snapshot data: bad json");
    }

    #[test]
    fn error_kind_classification() {
        assert!(ErrorKind::Io(IoError::other("disk")).is_retryable());
        assert!(!ErrorKind::CorruptData(String::new()).is_retryable());
        assert!(ErrorKind::PermissionDenied(PathBuf::from("x")).is_io_failure());
        assert!(!ErrorKind::InvalidPath(PathBuf::from("..")).is_io_failure());
    }
}
