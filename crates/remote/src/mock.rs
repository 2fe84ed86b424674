//! In-memory remote for testing.

use crate::error::{ErrorKind, Result};
use crate::models::{ReleaseInfo, RemoteEntry};
use crate::source::RemoteSource;
use ahdb_store::{Fingerprint, Region, SnapshotKey};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    snapshots: BTreeMap<SnapshotKey, (Fingerprint, Vec<u8>)>,
    failures: HashMap<SnapshotKey, ErrorKind>,
    listing_failure: Option<ErrorKind>,
    release: Option<ReleaseInfo>,
    release_failure: Option<ErrorKind>,
    fetches: HashMap<SnapshotKey, usize>,
    listings: usize,
}

/// In-memory [`RemoteSource`] with injectable failures and call counters.
///
/// ```
/// use ahdb_remote::{MockSource, RemoteSource};
/// use ahdb_store::{Region, SnapshotKey};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let source = MockSource::default();
/// let key = SnapshotKey::new(Region::Us, "stormrage".parse().unwrap(), 1);
/// source.insert(key.clone(), b"{}".to_vec());
/// assert_eq!(source.fetch(&key).await.unwrap(), b"{}");
/// assert_eq!(source.fetch_count(&key), 1);
/// # }
/// ```
#[derive(Default)]
pub struct MockSource {
    state: Mutex<State>,
}

impl MockSource {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test already failed; keep serving the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offer `payload` under `key`, advertising its true fingerprint.
    pub fn insert(&self, key: SnapshotKey, payload: Vec<u8>) {
        let fingerprint = Fingerprint::of(&payload);
        self.state().snapshots.insert(key, (fingerprint, payload));
    }

    /// Offer `payload` under `key` while advertising `fingerprint`.
    pub fn insert_with_fingerprint(&self, key: SnapshotKey, fingerprint: Fingerprint, payload: Vec<u8>) {
        self.state().snapshots.insert(key, (fingerprint, payload));
    }

    /// Make fetches of `key` fail with `kind` until cleared.
    pub fn fail_fetch(&self, key: SnapshotKey, kind: ErrorKind) {
        self.state().failures.insert(key, kind);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failures.clear();
        state.listing_failure = None;
        state.release_failure = None;
    }

    pub fn fail_listing(&self, kind: ErrorKind) {
        self.state().listing_failure = Some(kind);
    }

    pub fn set_release(&self, release: ReleaseInfo) {
        self.state().release = Some(release);
    }

    pub fn fail_release(&self, kind: ErrorKind) {
        self.state().release_failure = Some(kind);
    }

    pub fn fetch_count(&self, key: &SnapshotKey) -> usize {
        self.state().fetches.get(key).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.state().fetches.values().sum()
    }

    pub fn listing_count(&self) -> usize {
        self.state().listings
    }
}

#[async_trait]
impl RemoteSource for MockSource {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    async fn list_available(&self, region: Option<Region>) -> Result<Vec<RemoteEntry>> {
        let mut state = self.state();
        state.listings += 1;
        if let Some(kind) = state.listing_failure.clone() {
            exn::bail!(kind);
        }
        Ok(state
            .snapshots
            .iter()
            .filter(|(key, _)| region.is_none_or(|region| key.region == region))
            .map(|(key, (fingerprint, _))| RemoteEntry {
                key: key.clone(),
                fingerprint: fingerprint.clone(),
            })
            .collect())
    }

    async fn fetch(&self, key: &SnapshotKey) -> Result<Vec<u8>> {
        let mut state = self.state();
        *state.fetches.entry(key.clone()).or_default() += 1;
        if let Some(kind) = state.failures.get(key).cloned() {
            exn::bail!(kind);
        }
        match state.snapshots.get(key) {
            Some((_, payload)) => Ok(payload.clone()),
            None => exn::bail!(ErrorKind::NotFound(key.to_string())),
        }
    }

    async fn current_release(&self) -> Result<ReleaseInfo> {
        let state = self.state();
        if let Some(kind) = state.release_failure.clone() {
            exn::bail!(kind);
        }
        match &state.release {
            Some(release) => Ok(release.clone()),
            None => exn::bail!(ErrorKind::NotFound("release.json".to_string())),
        }
    }
}
