//! The snapshot store: a directory of immutable snapshot files plus an index.

use crate::BackendHandle;
use crate::codec::Compression;
use crate::error::{ErrorKind, Result};
use crate::index::{INDEX_FILE, IndexEntry, StoreIndex};
use crate::models::{Fingerprint, Listing, RealmSlug, Region, Scope, SnapshotKey};
use crate::path::is_temporary;
use async_stream::stream;
use exn::ResultExt;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

const LIST_PAGE_SIZE: usize = 64;

/// Restricts [`SnapshotStore::list`] to a subset of keys.
#[derive(Clone, Debug, Default)]
pub struct KeyFilter {
    pub region: Option<Region>,
    pub realm: Option<RealmSlug>,
    /// Only keys strictly after this one. Pass the last key received to
    /// resume an interrupted listing.
    pub after: Option<SnapshotKey>,
}
impl KeyFilter {
    pub fn scope(scope: &Scope) -> Self {
        Self {
            region: Some(scope.region),
            realm: Some(scope.realm.clone()),
            after: None,
        }
    }

    pub fn after(mut self, key: SnapshotKey) -> Self {
        self.after = Some(key);
        self
    }

    fn matches(&self, key: &SnapshotKey) -> bool {
        self.region.is_none_or(|region| region == key.region)
            && self.realm.as_ref().is_none_or(|realm| realm == &key.realm)
            && self.after.as_ref().is_none_or(|after| key > after)
    }
}

/// Outcome of one [`SnapshotStore::put`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new file was written.
    Written(Fingerprint),
    /// A byte-identical snapshot was already stored under the key.
    Unchanged(Fingerprint),
}
impl PutOutcome {
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            Self::Written(fp) | Self::Unchanged(fp) => fp,
        }
    }
}

/// Local auction database.
///
/// Snapshots live at `{region}/{realm}/{timestamp}.json[.gz]` relative to the
/// backend root, with `index.json` beside them. The index is a hint: it is
/// rebuilt from the directory contents on [`open`](Self::open) and whenever
/// it turns out to be wrong.
///
/// Mutations are serialized through a single writer lock. Readers work from
/// [`index`](Self::index) copies and never block writers for longer than a
/// clone.
pub struct SnapshotStore {
    backend: BackendHandle,
    compression: Compression,
    index: RwLock<StoreIndex>,
    writer: Mutex<()>,
    generation: AtomicU64,
}

impl SnapshotStore {
    /// Open the store, removing temporary files left by interrupted writes
    /// and rebuilding the index from the directory contents.
    #[instrument(skip(backend), fields(backend = backend.name()))]
    pub async fn open(backend: BackendHandle, compression: Compression) -> Result<Self> {
        let hint = match backend.exists(Path::new(INDEX_FILE)).await? {
            true => {
                let bytes = backend.read(Path::new(INDEX_FILE)).await?;
                StoreIndex::from_bytes(&bytes).unwrap_or_else(|| {
                    tracing::warn!(backend = backend.name(), "Store index is unreadable; rebuilding from scratch");
                    StoreIndex::default()
                })
            },
            false => StoreIndex::default(),
        };
        let store = Self {
            backend,
            compression,
            index: RwLock::new(StoreIndex::default()),
            writer: Mutex::new(()),
            generation: AtomicU64::new(0),
        };
        // Nobody else can hold the writer lock yet.
        store.rescan_locked(&hint).await?;
        Ok(store)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Counter bumped by every change to the index. Cheap to poll.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// A copy of the index as of now.
    pub async fn index(&self) -> StoreIndex {
        self.index.read().await.clone()
    }

    pub async fn latest(&self, scope: &Scope) -> Option<(SnapshotKey, IndexEntry)> {
        self.index.read().await.latest(scope).map(|(key, entry)| (key.clone(), entry.clone()))
    }

    /// Install a decoded snapshot payload under `key`.
    ///
    /// The payload must decode as a listing for `key`. Writing is
    /// temp-file-then-rename, so an interrupted `put` leaves either nothing or
    /// the complete file. Installing the same bytes twice writes nothing the
    /// second time.
    #[instrument(skip(self, payload), fields(%key, size = payload.len()))]
    pub async fn put(&self, key: &SnapshotKey, payload: &[u8]) -> Result<PutOutcome> {
        Listing::decode(payload, key)?;
        let fingerprint = Fingerprint::of(payload);
        let path = key.relative_path(self.compression);

        let _guard = self.writer.lock().await;
        let previous = self.index.read().await.get(key).cloned();
        if let Some(previous) = &previous
            && previous.fingerprint == fingerprint
        {
            tracing::debug!(%key, "Snapshot already stored");
            return Ok(PutOutcome::Unchanged(fingerprint));
        }

        let encoded = self.compression.compress(payload)?;
        let size = encoded.len() as u64;
        self.backend.write(&path, &encoded).await?;
        if let Some(previous) = &previous
            && previous.path != path
        {
            // Same key stored under the other encoding; the new file supersedes it.
            self.delete_quietly(&previous.path).await;
        }
        let entry = IndexEntry {
            path,
            fingerprint: fingerprint.clone(),
            size,
        };
        self.index.write().await.insert(key.clone(), entry);
        self.bump();
        self.persist_index().await?;
        tracing::info!(%key, fingerprint = %fingerprint, "Installed snapshot");
        Ok(PutOutcome::Written(fingerprint))
    }

    /// Decoded payload for `key`, or `None` if the store has no such
    /// snapshot.
    ///
    /// If the index names a file that has disappeared, the index is rebuilt
    /// from the directory and `None` is returned.
    #[instrument(skip(self), fields(%key))]
    pub async fn get(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.index.read().await.get(key).cloned() else {
            return Ok(None);
        };
        let bytes = match self.backend.read(&entry.path).await {
            Ok(bytes) => bytes,
            Err(err) if matches!(&*err, ErrorKind::NotFound(_)) => {
                tracing::warn!(%key, path = %entry.path.display(), "Indexed snapshot is missing; rescanning store");
                self.rescan().await?;
                return Ok(None);
            },
            Err(err) => return Err(err),
        };
        let payload = Compression::from_path(&entry.path)
            .decompress(&bytes)
            .or_raise(|| ErrorKind::CorruptData(format!("{key}: undecodable file {}", entry.path.display())))?;
        Ok(Some(payload))
    }

    /// Decoded and parsed listing for `key`.
    pub async fn listing(&self, key: &SnapshotKey) -> Result<Option<Listing>> {
        match self.get(key).await? {
            Some(payload) => Ok(Some(Listing::decode(&payload, key)?)),
            None => Ok(None),
        }
    }

    /// Lazily stream keys matching `filter`, oldest first.
    ///
    /// The stream reads the index a page at a time, so snapshots installed
    /// while it is being consumed may or may not appear. Keys never repeat.
    pub fn list(&self, filter: KeyFilter) -> impl Stream<Item = SnapshotKey> + Send + '_ {
        stream! {
            let mut filter = filter;
            loop {
                let page: Vec<SnapshotKey> = {
                    let index = self.index.read().await;
                    index.iter().map(|(key, _)| key).filter(|key| filter.matches(key)).take(LIST_PAGE_SIZE).cloned().collect()
                };
                let exhausted = page.len() < LIST_PAGE_SIZE;
                for key in page {
                    filter.after = Some(key.clone());
                    yield key;
                }
                if exhausted {
                    break;
                }
            }
        }
    }

    /// Remove one snapshot. Returns `false` if it was not stored.
    #[instrument(skip(self), fields(%key))]
    pub async fn remove(&self, key: &SnapshotKey) -> Result<bool> {
        let _guard = self.writer.lock().await;
        let Some(entry) = self.index.write().await.remove(key) else {
            return Ok(false);
        };
        self.bump();
        self.delete_quietly(&entry.path).await;
        self.persist_index().await?;
        Ok(true)
    }

    /// Delete every snapshot ("Clear DB"). Returns the number removed.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let entries: Vec<IndexEntry> = {
            let mut index = self.index.write().await;
            let entries = index.iter().map(|(_, entry)| entry.clone()).collect();
            index.clear();
            entries
        };
        self.bump();
        for entry in &entries {
            self.delete_quietly(&entry.path).await;
        }
        self.persist_index().await?;
        tracing::info!(removed = entries.len(), "Cleared snapshot store");
        Ok(entries.len())
    }

    /// Remove snapshots older than `cutoff` (unix seconds), always keeping the
    /// most recent snapshot of every scope.
    #[instrument(skip(self))]
    pub async fn prune(&self, cutoff: i64) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let expired: Vec<(SnapshotKey, IndexEntry)> = {
            let mut index = self.index.write().await;
            let latest: Vec<SnapshotKey> =
                index.scopes().iter().filter_map(|scope| index.latest(scope).map(|(key, _)| key.clone())).collect();
            let expired: Vec<_> = index
                .iter()
                .filter(|(key, _)| key.timestamp < cutoff && !latest.contains(key))
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect();
            for (key, _) in &expired {
                index.remove(key);
            }
            expired
        };
        if expired.is_empty() {
            return Ok(0);
        }
        self.bump();
        for (_, entry) in &expired {
            self.delete_quietly(&entry.path).await;
        }
        self.persist_index().await?;
        tracing::info!(removed = expired.len(), cutoff, "Pruned expired snapshots");
        Ok(expired.len())
    }

    /// Rebuild the index from the directory contents.
    pub async fn rescan(&self) -> Result<()> {
        let _guard = self.writer.lock().await;
        let hint = self.index.read().await.clone();
        self.rescan_locked(&hint).await
    }

    async fn rescan_locked(&self, hint: &StoreIndex) -> Result<()> {
        let mut rebuilt = StoreIndex::default();
        let mut reused = 0usize;
        let mut files = self.backend.list_stream();
        while let Some(file) = files.try_next().await? {
            if is_temporary(&file.path) {
                tracing::info!(path = %file.path.display(), "Removing leftover temporary file");
                self.delete_quietly(&file.path).await;
                continue;
            }
            if file.path == Path::new(INDEX_FILE) {
                continue;
            }
            let Some((key, _compression)) = SnapshotKey::from_relative_path(&file.path) else {
                tracing::debug!(path = %file.path.display(), "Ignoring non-snapshot file");
                continue;
            };
            let fingerprint = match hint.reusable_fingerprint(&key, &file.path, file.size) {
                Some(fingerprint) => {
                    reused += 1;
                    fingerprint
                },
                None => match self.fingerprint_file(&key, &file.path).await {
                    Ok(fingerprint) => fingerprint,
                    Err(err) if matches!(&*err, ErrorKind::CorruptData(_) | ErrorKind::Compression) => {
                        tracing::warn!(path = %file.path.display(), error = %*err, "Skipping corrupt snapshot file");
                        continue;
                    },
                    Err(err) => return Err(err),
                },
            };
            let entry = IndexEntry {
                path: file.path,
                fingerprint,
                size: file.size,
            };
            if let Some(existing) = rebuilt.get(&key)
                && entry.path != existing.path
                && Compression::from_path(&existing.path) == self.compression
            {
                // Keep the file in the configured encoding when both exist.
                continue;
            }
            rebuilt.insert(key, entry);
        }
        drop(files);
        tracing::info!(snapshots = rebuilt.len(), reused, "Rebuilt store index");
        *self.index.write().await = rebuilt;
        self.bump();
        self.persist_index().await
    }

    async fn fingerprint_file(&self, key: &SnapshotKey, path: &Path) -> Result<Fingerprint> {
        let bytes = self.backend.read(path).await?;
        let payload = Compression::from_path(path).decompress(&bytes)?;
        Listing::decode(&payload, key)?;
        Ok(Fingerprint::of(&payload))
    }

    async fn persist_index(&self) -> Result<()> {
        let bytes = self
            .index
            .read()
            .await
            .to_bytes()
            .or_raise(|| ErrorKind::CorruptIndex("index serialization failed".to_string()))?;
        self.backend.write(Path::new(INDEX_FILE), &bytes).await
    }

    async fn delete_quietly(&self, path: &Path) {
        if let Err(err) = self.backend.delete(path).await
            && !matches!(&*err, ErrorKind::NotFound(_))
        {
            tracing::warn!(path = %path.display(), error = %*err, "Failed to delete snapshot file");
        }
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalBackend, MockBackend};
    use futures::StreamExt;
    use std::sync::Arc;

    fn key(realm: &str, ts: i64) -> SnapshotKey {
        SnapshotKey::new(Region::Us, realm.parse().unwrap(), ts)
    }

    fn payload(key: &SnapshotKey, buyout: u64) -> Vec<u8> {
        format!(
            r#"{{"region":"{}","realm":"{}","timestamp":{},"auctions":[{{"item":"19019","buyout":{buyout},"quantity":1}}]}}"#,
            key.region, key.realm, key.timestamp
        )
        .into_bytes()
    }

    async fn open(dir: &Path, compression: Compression) -> SnapshotStore {
        let backend: BackendHandle = Arc::new(LocalBackend::new("db", dir).unwrap());
        SnapshotStore::open(backend, compression).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), Compression::Gzip).await;
        let k = key("stormrage", 100);
        let outcome = store.put(&k, &payload(&k, 5)).await.unwrap();
        assert_eq!(outcome, PutOutcome::Written(Fingerprint::of(&payload(&k, 5))));
        assert_eq!(store.get(&k).await.unwrap().unwrap(), payload(&k, 5));
        assert!(dir.path().join("us/stormrage/100.json.gz").exists());
        assert!(store.get(&key("stormrage", 101)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_identical_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), Compression::None).await;
        let k = key("stormrage", 100);
        store.put(&k, &payload(&k, 5)).await.unwrap();
        let generation = store.generation();
        let outcome = store.put(&k, &payload(&k, 5)).await.unwrap();
        assert!(matches!(outcome, PutOutcome::Unchanged(_)));
        assert_eq!(store.generation(), generation);
    }

    #[tokio::test]
    async fn test_put_rejects_mismatched_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), Compression::None).await;
        let err = store.put(&key("stormrage", 100), &payload(&key("stormrage", 99), 5)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::CorruptData(_)));
        assert!(store.index().await.is_empty());
    }

    #[tokio::test]
    async fn test_put_rejects_negative_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let kept = key("stormrage", 100);
        {
            let store = open(dir.path(), Compression::None).await;
            store.put(&kept, &payload(&kept, 5)).await.unwrap();
            let negative = key("stormrage", -1);
            let err = store.put(&negative, &payload(&negative, 5)).await.unwrap_err();
            assert!(matches!(&*err, ErrorKind::CorruptData(_)));
        }
        std::fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();

        // A rescan sees exactly what the store accepted.
        let store = open(dir.path(), Compression::None).await;
        let keys: Vec<_> = store.index().await.iter().map(|(key, _)| key.clone()).collect();
        assert_eq!(keys, vec![kept]);
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index_and_drops_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let k = key("stormrage", 100);
        {
            let store = open(dir.path(), Compression::Gzip).await;
            store.put(&k, &payload(&k, 5)).await.unwrap();
        }
        // An interrupted put: temporary file written, never renamed.
        std::fs::write(dir.path().join("us/stormrage/.tmpAbC123"), b"{\"region\":").unwrap();
        std::fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();

        let store = open(dir.path(), Compression::Gzip).await;
        assert_eq!(store.index().await.len(), 1);
        assert_eq!(store.get(&k).await.unwrap().unwrap(), payload(&k, 5));
        assert!(!dir.path().join("us/stormrage/.tmpAbC123").exists());
    }

    #[tokio::test]
    async fn test_corrupt_index_file_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let k = key("stormrage", 100);
        {
            let store = open(dir.path(), Compression::None).await;
            store.put(&k, &payload(&k, 5)).await.unwrap();
        }
        std::fs::write(dir.path().join(INDEX_FILE), b"{ not json").unwrap();
        let store = open(dir.path(), Compression::None).await;
        assert!(store.index().await.get(&k).is_some());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("us/stormrage")).unwrap();
        std::fs::write(dir.path().join("us/stormrage/100.json.gz"), b"not gzip").unwrap();
        let store = open(dir.path(), Compression::Gzip).await;
        assert!(store.index().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_triggers_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), Compression::None).await;
        let (a, b) = (key("stormrage", 100), key("stormrage", 200));
        store.put(&a, &payload(&a, 5)).await.unwrap();
        store.put(&b, &payload(&b, 6)).await.unwrap();
        std::fs::remove_file(dir.path().join("us/stormrage/100.json")).unwrap();

        assert!(store.get(&a).await.unwrap().is_none());
        let index = store.index().await;
        assert!(index.get(&a).is_none());
        assert!(index.get(&b).is_some());
    }

    #[tokio::test]
    async fn test_list_orders_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), Compression::None).await;
        for (realm, ts) in [("stormrage", 300), ("area-52", 200), ("stormrage", 100)] {
            let k = key(realm, ts);
            store.put(&k, &payload(&k, 1)).await.unwrap();
        }
        let all: Vec<_> = store.list(KeyFilter::default()).collect().await;
        let timestamps: Vec<_> = all.iter().map(|k| k.timestamp).collect();
        assert_eq!(timestamps, [100, 200, 300]);

        let scope = Scope::new(Region::Us, "stormrage".parse().unwrap());
        let first: Vec<_> = store.list(KeyFilter::scope(&scope)).take(1).collect().await;
        let rest: Vec<_> = store.list(KeyFilter::scope(&scope).after(first[0].clone())).collect().await;
        assert_eq!(first[0].timestamp, 100);
        assert_eq!(rest.iter().map(|k| k.timestamp).collect::<Vec<_>>(), [300]);
    }

    #[tokio::test]
    async fn test_list_pages_through_large_stores() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), Compression::None).await;
        for ts in 0..(LIST_PAGE_SIZE as i64 * 2 + 3) {
            let k = key("stormrage", ts);
            store.put(&k, &payload(&k, 1)).await.unwrap();
        }
        let count = store.list(KeyFilter::default()).count().await;
        assert_eq!(count, LIST_PAGE_SIZE * 2 + 3);
    }

    #[tokio::test]
    async fn test_prune_keeps_latest_per_scope() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), Compression::None).await;
        for (realm, ts) in [("stormrage", 10), ("stormrage", 20), ("stormrage", 300), ("area-52", 15)] {
            let k = key(realm, ts);
            store.put(&k, &payload(&k, 1)).await.unwrap();
        }
        assert_eq!(store.prune(100).await.unwrap(), 2);
        let index = store.index().await;
        assert!(index.get(&key("stormrage", 300)).is_some());
        assert!(index.get(&key("area-52", 15)).is_some());
        assert!(!dir.path().join("us/stormrage/10.json").exists());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), Compression::Gzip).await;
        let (a, b) = (key("stormrage", 1), key("area-52", 2));
        store.put(&a, &payload(&a, 1)).await.unwrap();
        store.put(&b, &payload(&b, 1)).await.unwrap();
        assert!(store.remove(&a).await.unwrap());
        assert!(!store.remove(&a).await.unwrap());
        assert_eq!(store.clear().await.unwrap(), 1);
        assert!(store.index().await.is_empty());
        let reopened = open(dir.path(), Compression::Gzip).await;
        assert!(reopened.index().await.is_empty());
    }

    #[tokio::test]
    async fn test_changed_compression_supersedes_old_file() {
        let dir = tempfile::tempdir().unwrap();
        let k = key("stormrage", 100);
        {
            let store = open(dir.path(), Compression::None).await;
            store.put(&k, &payload(&k, 1)).await.unwrap();
        }
        let store = open(dir.path(), Compression::Gzip).await;
        store.put(&k, &payload(&k, 2)).await.unwrap();
        assert!(!dir.path().join("us/stormrage/100.json").exists());
        assert_eq!(store.get(&k).await.unwrap().unwrap(), payload(&k, 2));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_state() {
        let backend = Arc::new(MockBackend::default());
        let store = SnapshotStore::open(backend.clone(), Compression::None).await.unwrap();
        let (a, b) = (key("stormrage", 100), key("stormrage", 200));
        store.put(&a, &payload(&a, 1)).await.unwrap();
        backend.fail_writes_to(b.relative_path(Compression::None));

        let err = store.put(&b, &payload(&b, 1)).await.unwrap_err();
        assert!(err.is_io_failure());
        let index = store.index().await;
        assert_eq!(index.len(), 1);
        assert!(index.get(&b).is_none());
        assert_eq!(store.get(&a).await.unwrap().unwrap(), payload(&a, 1));
    }

    #[tokio::test]
    async fn test_missing_file_in_mock_backend() {
        let backend = Arc::new(MockBackend::default());
        let store = SnapshotStore::open(backend.clone(), Compression::Gzip).await.unwrap();
        let k = key("stormrage", 100);
        store.put(&k, &payload(&k, 1)).await.unwrap();
        assert!(backend.remove_silently(k.relative_path(Compression::Gzip)).await);
        assert!(store.get(&k).await.unwrap().is_none());
        assert!(store.index().await.is_empty());
        assert_eq!(backend.paths().await, [std::path::PathBuf::from(INDEX_FILE)]);
    }
}
