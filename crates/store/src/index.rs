//! The store index: a persisted hint mapping snapshot keys to their files.

use crate::models::{Fingerprint, Scope, SnapshotKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub(crate) const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Store-relative path of the snapshot file.
    pub path: PathBuf,
    /// Fingerprint of the decoded payload.
    pub fingerprint: Fingerprint,
    /// On-disk size, used to reuse fingerprints across rescans.
    pub size: u64,
}

/// Ordered view of every snapshot in a store.
///
/// Values handed out by [`SnapshotStore::index`](crate::SnapshotStore::index)
/// are copies; they never change underneath the reader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreIndex {
    entries: BTreeMap<SnapshotKey, IndexEntry>,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<IndexRecord>,
}

#[derive(Serialize, Deserialize)]
struct IndexRecord {
    key: SnapshotKey,
    #[serde(flatten)]
    entry: IndexEntry,
}

impl StoreIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &SnapshotKey) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn contains_fingerprint(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.values().any(|entry| &entry.fingerprint == fingerprint)
    }

    /// All entries in key order (timestamp ascending).
    pub fn iter(&self) -> impl Iterator<Item = (&SnapshotKey, &IndexEntry)> {
        self.entries.iter()
    }

    /// Entries belonging to `scope`, oldest first.
    pub fn scope<'a>(
        &'a self,
        scope: &Scope,
    ) -> impl DoubleEndedIterator<Item = (&'a SnapshotKey, &'a IndexEntry)> + use<'a> {
        let Scope { region, realm } = scope.clone();
        self.entries.iter().filter(move |(key, _)| key.region == region && key.realm == realm)
    }

    /// Most recent snapshot of `scope`.
    pub fn latest(&self, scope: &Scope) -> Option<(&SnapshotKey, &IndexEntry)> {
        self.scope(scope).next_back()
    }

    /// Every scope with at least one snapshot.
    pub fn scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<_> = self.entries.keys().map(SnapshotKey::scope).collect();
        scopes.sort();
        scopes.dedup();
        scopes
    }

    pub(crate) fn insert(&mut self, key: SnapshotKey, entry: IndexEntry) -> Option<IndexEntry> {
        self.entries.insert(key, entry)
    }

    pub(crate) fn remove(&mut self, key: &SnapshotKey) -> Option<IndexEntry> {
        self.entries.remove(key)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Fingerprint recorded for `path`, if its size is unchanged.
    pub(crate) fn reusable_fingerprint(&self, key: &SnapshotKey, path: &std::path::Path, size: u64) -> Option<Fingerprint> {
        self.entries
            .get(key)
            .filter(|entry| entry.path == path && entry.size == size)
            .map(|entry| entry.fingerprint.clone())
    }

    pub(crate) fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let file = IndexFile {
            version: INDEX_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(key, entry)| IndexRecord {
                    key: key.clone(),
                    entry: entry.clone(),
                })
                .collect(),
        };
        serde_json::to_vec_pretty(&file)
    }

    /// Parse a persisted index. `None` means the file is unreadable or from
    /// an unknown version and must be rebuilt from scratch.
    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let file: IndexFile = serde_json::from_slice(bytes).ok()?;
        if file.version != INDEX_VERSION {
            return None;
        }
        let entries = file.entries.into_iter().map(|record| (record.key, record.entry)).collect();
        Some(Self { entries })
    }
}
