//! Export Error Types

use ahdb_store::{Scope, SnapshotKey};
use derive_more::{Display, Error};
use std::path::PathBuf;

/// An export error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for export operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The scope has no snapshot yet. Sync first; nothing was written.
    #[display("no snapshot available for {_0}")]
    SourceMissing(#[error(not(source))] Scope),
    /// Destination could not be written; it keeps its previous content.
    #[display("failed to write export file: {}", _0.display())]
    WriteFailure(#[error(not(source))] PathBuf),
    /// Snapshot could not be turned into price data.
    #[display("malformed snapshot {_0}")]
    TransformError(#[error(not(source))] SnapshotKey),
    /// Job names a scope that is not part of the selection.
    #[display("{_0} is not selected for export")]
    UnknownScope(#[error(not(source))] Scope),
    /// Reading from the snapshot store failed.
    #[display("snapshot store error")]
    Store,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteFailure(_) | Self::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        let scope: Scope = "us/stormrage".parse().unwrap();
        assert_eq!(ErrorKind::SourceMissing(scope.clone()).to_string(), "no snapshot available for us/stormrage");
        assert_eq!(ErrorKind::UnknownScope(scope.clone()).to_string(), "us/stormrage is not selected for export");
        assert_eq!(ErrorKind::TransformError(scope.key(100)).to_string(), "malformed snapshot us/stormrage@100");
    }
}
