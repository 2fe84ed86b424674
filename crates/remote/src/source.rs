use crate::error::Result;
use crate::models::{ReleaseInfo, RemoteEntry};
use ahdb_store::{Region, SnapshotKey};
use async_trait::async_trait;
use std::sync::Arc;

/// Read-only view of a remote snapshot repository.
///
/// Implementations classify every failure into the
/// [`ErrorKind`](crate::error::ErrorKind) taxonomy so callers can decide
/// between skipping a key, retrying later, or stopping.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Human readable origin, for logging.
    fn describe(&self) -> String;

    /// Every snapshot the remote offers, optionally limited to one region.
    async fn list_available(&self, region: Option<Region>) -> Result<Vec<RemoteEntry>>;

    /// Decoded payload of one snapshot.
    async fn fetch(&self, key: &SnapshotKey) -> Result<Vec<u8>>;

    /// The newest published release of the application.
    async fn current_release(&self) -> Result<ReleaseInfo>;
}

pub type RemoteHandle = Arc<dyn RemoteSource + Send + Sync>;
