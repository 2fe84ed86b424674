//! Cache Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Cache directory must be an absolute path to a directory.
    #[display("invalid cache directory: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Namespace names a sub-directory and must be a plain identifier.
    #[display("invalid cache namespace: {_0}")]
    InvalidNamespace(#[error(not(source))] String),
    /// Filesystem failure while maintaining the cache directory.
    #[display("cache I/O error: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// Cached value could not be serialized.
    #[display("invalid cache data")]
    InvalidData,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
