//! Remote Error Types

use derive_more::{Display, Error};

/// A remote error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for remote operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeout, connection failure, rate limiting or a server error. Try
    /// again later.
    #[display("transient remote failure: {_0}")]
    Transient(#[error(not(source))] String),
    /// The remote does not have the requested resource.
    #[display("not found on remote: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The remote or proxy refused the request. Retrying will not help until
    /// the configuration changes.
    #[display("remote refused access: {_0}")]
    AuthFailure(#[error(not(source))] String),
    /// The remote answered with something that cannot be decoded.
    #[display("corrupt remote data: {_0}")]
    CorruptData(#[error(not(source))] String),
    /// Repository or proxy settings are unusable.
    #[display("invalid remote configuration: {_0}")]
    InvalidConfig(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` if the failure concerns a single resource and other
    /// requests may still succeed.
    pub fn is_per_resource(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::NotFound(_) | Self::CorruptData(_))
    }
}
