use crate::error::{ErrorKind, Result};
use ahdb_store::{Fingerprint, write_atomic};
use exn::ResultExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::instrument;

/// Number of entries and bytes currently cached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub bytes: u64,
}

/// Read-through cache of values derived from snapshots, keyed by the
/// snapshot fingerprint.
///
/// Entries live at `{root}/{namespace}/{fp[0..2]}/{fp}.json`. Nothing here is
/// authoritative: unreadable or expired entries are recomputed, failed cache
/// writes are logged and ignored, and [`clear`](Self::clear) may run at any
/// time.
#[derive(Clone, Debug)]
pub struct CacheManager {
    root: PathBuf,
    expires_in: Option<Duration>,
}

impl CacheManager {
    /// Cache rooted at the absolute directory `root`, created if missing.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() || root.is_file() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        std::fs::create_dir_all(&root).or_raise(|| ErrorKind::Io(root.clone()))?;
        Ok(Self { root, expires_in: None })
    }

    /// Treat entries older than `expires_in` as missing.
    pub fn with_expiry(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, namespace: &str, fingerprint: &Fingerprint) -> Result<PathBuf> {
        if namespace.is_empty() || !namespace.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            exn::bail!(ErrorKind::InvalidNamespace(namespace.to_string()));
        }
        let fp = fingerprint.as_str();
        let shard = fp.get(..2).unwrap_or("xx");
        Ok(self.root.join(namespace).join(shard).join(format!("{fp}.json")))
    }

    /// Cached value, if present, fresh and decodable.
    pub async fn get<T: DeserializeOwned>(&self, namespace: &str, fingerprint: &Fingerprint) -> Option<T> {
        let path = self.entry_path(namespace, fingerprint).ok()?;
        let metadata = fs::metadata(&path).await.ok()?;
        if let Some(expires_in) = self.expires_in
            && is_expired(metadata.modified().ok(), expires_in)
        {
            tracing::debug!(path = %path.display(), "Cache entry expired");
            return None;
        }
        let bytes = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding undecodable cache entry");
                let _ = fs::remove_file(&path).await;
                None
            },
        }
    }

    /// Store `value`. Failures are returned; most callers want
    /// [`get_or_compute`](Self::get_or_compute), which only logs them.
    pub async fn put<T: Serialize>(&self, namespace: &str, fingerprint: &Fingerprint, value: &T) -> Result<()> {
        let path = self.entry_path(namespace, fingerprint)?;
        let bytes = serde_json::to_vec(value).or_raise(|| ErrorKind::InvalidData)?;
        write_atomic(&path, bytes).await.or_raise(|| ErrorKind::Io(path.clone()))
    }

    /// Return the cached value for `fingerprint`, or run `compute`, cache
    /// its result and return it.
    ///
    /// Only `compute` can fail this call; the cache itself never does.
    pub async fn get_or_compute<T, E, F, Fut>(&self, namespace: &str, fingerprint: &Fingerprint, compute: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(namespace, fingerprint).await {
            tracing::trace!(namespace, fingerprint = %fingerprint, "Cache hit");
            return Ok(value);
        }
        let value = compute().await?;
        if let Err(err) = self.put(namespace, fingerprint, &value).await {
            tracing::warn!(namespace, fingerprint = %fingerprint, error = ?err, "Failed to write cache entry");
        }
        Ok(value)
    }

    /// Delete everything ("Clear Cache") and recreate the empty directory.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e).or_raise(|| ErrorKind::Io(self.root.clone())),
        }
        fs::create_dir_all(&self.root).await.or_raise(|| ErrorKind::Io(self.root.clone()))?;
        tracing::info!("Cleared cache");
        Ok(())
    }

    /// Remove entries last written more than `max_age` ago. Returns how many
    /// were removed.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn prune_expired(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0;
        for (path, metadata) in self.entries().await? {
            if is_expired(metadata.modified().ok(), max_age) {
                fs::remove_file(&path).await.or_raise(|| ErrorKind::Io(path.clone()))?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Pruned expired cache entries");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let entries = self.entries().await?;
        Ok(CacheStats {
            entries: entries.len() as u64,
            bytes: entries.iter().map(|(_, metadata)| metadata.len()).sum(),
        })
    }

    async fn entries(&self) -> Result<Vec<(PathBuf, std::fs::Metadata)>> {
        let mut files = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).or_raise(|| ErrorKind::Io(dir.clone())),
            };
            while let Some(entry) = entries.next_entry().await.or_raise(|| ErrorKind::Io(dir.clone()))? {
                let path = entry.path();
                let metadata = entry.metadata().await.or_raise(|| ErrorKind::Io(path.clone()))?;
                if metadata.is_dir() {
                    stack.push(path);
                } else if metadata.is_file() {
                    files.push((path, metadata));
                }
            }
        }
        Ok(files)
    }
}

fn is_expired(modified: Option<SystemTime>, max_age: Duration) -> bool {
    modified
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > max_age)
}
