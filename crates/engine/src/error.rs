//! Engine Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// An engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Remote could not be reached right now; try again later.
    #[display("remote unavailable")]
    RemoteUnavailable,
    /// Remote refused access. Check the repository and proxy settings.
    #[display("remote refused access")]
    AuthFailure,
    /// Remote answered with something unusable. Retrying will not help.
    #[display("remote is misconfigured or serving invalid data")]
    InvalidRemote,
    /// Installing into the local store failed; the store keeps its previous state.
    #[display("failed to install snapshot into the local store")]
    Install,
    /// Update check state could not be read or written.
    #[display("update state file error: {}", _0.display())]
    StateFile(#[error(not(source))] PathBuf),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable | Self::Install)
    }

    /// Map a remote failure that stops a whole run.
    pub(crate) fn from_remote(kind: &ahdb_remote::error::ErrorKind) -> Self {
        use ahdb_remote::error::ErrorKind as Remote;
        match kind {
            Remote::Transient(_) => Self::RemoteUnavailable,
            Remote::AuthFailure(_) => Self::AuthFailure,
            Remote::NotFound(_) | Remote::CorruptData(_) | Remote::InvalidConfig(_) => Self::InvalidRemote,
        }
    }
}
