//! Command Line Error Types

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("invalid configuration")]
    Config,
    #[display("invalid argument: {_0}")]
    Argument(#[error(not(source))] String),
    #[display("snapshot database unavailable")]
    Database,
    #[display("cache unavailable")]
    Cache,
    #[display("remote unavailable")]
    Remote,
    #[display("remote mode is disabled (remote.enabled = false)")]
    RemoteDisabled,
    #[display("sync failed")]
    Sync,
    #[display("export failed")]
    Export,
    #[display("update check failed")]
    UpdateCheck,
}
