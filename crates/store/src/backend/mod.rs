//! Storage backend trait and implementations.
//!
//! The snapshot store talks to its directory through [`StorageBackend`] so
//! that tests in this and other crates can swap the filesystem for an
//! in-memory map.

mod local;
#[cfg(any(test, feature = "mock"))]
mod mock;

pub use self::local::LocalBackend;
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockBackend;
use crate::error::Result;
use crate::file::FileInfo;
use async_trait::async_trait;
use futures::Stream;
use std::path::Path;
use std::pin::Pin;

pub(crate) type FileInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<FileInfo>> + Send + 'a>>;

/// Unified interface for the directory a snapshot store lives in.
///
/// # Path Handling
/// All paths are relative to the storage root and are validated with
/// [`validate_path`](crate::validate_path) by every implementation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use ahdb_store::{backend::StorageBackend, error::Result};
///
/// async fn index_size(backend: &dyn StorageBackend) -> Result<usize> {
///     let path = Path::new("index.json");
///     match backend.exists(path).await? {
///         true => Ok(backend.read(path).await?.len()),
///         false => Ok(0),
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the backend, used for logging only.
    fn name(&self) -> &str;

    /// Stream metadata of every file under the root, yielding results as
    /// they are discovered.
    fn list_stream(&self) -> FileInfoStream<'_>;

    /// Check if a file exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace file contents, creating parent directories as needed.
    ///
    /// Implementations must be atomic: a concurrent reader observes either
    /// the old or the new contents, never a prefix of the new.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Delete a file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn delete(&self, path: &Path) -> Result<()>;
}
