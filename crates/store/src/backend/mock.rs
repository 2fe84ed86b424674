//! In-memory storage backend for testing.

use super::FileInfoStream;
use crate::StorageBackend;
use crate::error::{ErrorKind, Result};
use crate::file::FileInfo;
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// In-memory storage backend for testing.
///
/// Files live in a `HashMap` behind a [`RwLock`]. Writes to paths registered
/// with [`fail_writes_to`](Self::fail_writes_to) fail with an I/O error, which
/// lets callers exercise partial-failure handling.
///
/// ```
/// use ahdb_store::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let backend = MockBackend::with_files([("us/stormrage/1.json", b"{}")]);
/// assert!(backend.exists(Path::new("us/stormrage/1.json")).await.unwrap());
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<HashMap<PathBuf, Vec<u8>>>,
    failing: std::sync::RwLock<HashSet<PathBuf>>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files.
    ///
    /// Panics if any path fails validation; a broken test setup should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(validated, data.into());
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
            failing: std::sync::RwLock::new(HashSet::new()),
        }
    }

    /// Make every subsequent write to `path` fail.
    pub fn fail_writes_to(&self, path: impl AsRef<Path>) {
        if let (Ok(path), Ok(mut failing)) = (validate_path(path), self.failing.write()) {
            failing.insert(path);
        }
    }

    /// Remove a file behind the store's back, as an external process would.
    pub async fn remove_silently(&self, path: impl AsRef<Path>) -> bool {
        match validate_path(path) {
            Ok(path) => self.storage.write().await.remove(&path).is_some(),
            Err(_) => false,
        }
    }

    pub async fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.storage.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream(&self) -> FileInfoStream<'_> {
        Box::pin(stream! {
            // Copy entries out so the lock is not held across yields.
            let entries: Vec<FileInfo> = {
                let guard = self.storage.read().await;
                guard.iter().map(|(path, data)| FileInfo::new(path.clone(), data.len() as u64)).collect()
            };
            for entry in entries {
                yield Ok(entry);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let data = self.storage.read().await.get(&path).cloned();
        data.ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        let failing = self.failing.read().map(|set| set.contains(&path)).unwrap_or(false);
        if failing {
            exn::bail!(ErrorKind::Io(std::io::Error::other(format!("injected failure: {}", path.display()))));
        }
        self.storage.write().await.insert(path, data.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        self.storage.write().await.remove(&path).map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }
}
