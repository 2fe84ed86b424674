use crate::error::{ErrorKind, Result};
use crate::summary::SnapshotSummary;
use crate::tsm::{self, Windows};
use ahdb_cache::CacheManager;
use ahdb_store::error::ErrorKind as StoreErrorKind;
use ahdb_store::{IndexEntry, Scope, SnapshotKey, SnapshotStore, StoreIndex, write_atomic};
use exn::ResultExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::instrument;

const DAY: i64 = 24 * 60 * 60;
/// Window averaged into `marketValue`.
pub const SCAN_STAT_WINDOW: i64 = 14 * DAY;
/// Window averaged into `historical`.
pub const HISTORICAL_WINDOW: i64 = 60 * DAY;
/// Cache namespace of [`SnapshotSummary`] entries.
pub const SUMMARY_NAMESPACE: &str = "summary";

/// One selected scope and where its price file goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportTarget {
    pub scope: Scope,
    /// Realm name as the addon knows it.
    pub label: String,
    pub destination: PathBuf,
}
impl ExportTarget {
    pub fn new(scope: Scope, label: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            scope,
            label: label.into(),
            destination: destination.into(),
        }
    }

    /// `{directory}/{region}-{realm}.lua`
    pub fn default_destination(directory: &Path, scope: &Scope) -> PathBuf {
        directory.join(format!("{}-{}.lua", scope.region, scope.realm))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportJob {
    pub seq: u64,
    pub scope: Scope,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportOutcome {
    Written(PathBuf),
    /// A newer job for the same scope exists; nothing was written.
    Superseded,
}

/// Turns export jobs into price files.
///
/// Jobs for one scope may be processed concurrently, but only the most
/// recently enqueued one ever reaches the destination file.
pub struct ExportPipeline {
    store: Arc<SnapshotStore>,
    cache: CacheManager,
    targets: HashMap<Scope, ExportTarget>,
    sequence: AtomicU64,
    latest: Mutex<HashMap<Scope, u64>>,
    locks: Mutex<HashMap<Scope, Arc<tokio::sync::Mutex<()>>>>,
}

impl ExportPipeline {
    pub fn new(store: Arc<SnapshotStore>, cache: CacheManager, targets: impl IntoIterator<Item = ExportTarget>) -> Self {
        Self {
            store,
            cache,
            targets: targets.into_iter().map(|target| (target.scope.clone(), target)).collect(),
            sequence: AtomicU64::new(0),
            latest: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn targets(&self) -> impl Iterator<Item = &ExportTarget> {
        self.targets.values()
    }

    pub fn is_selected(&self, scope: &Scope) -> bool {
        self.targets.contains_key(scope)
    }

    /// Create a job for `scope`, superseding any earlier job for it.
    pub fn enqueue(&self, scope: Scope) -> ExportJob {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        latest.insert(scope.clone(), seq);
        tracing::debug!(scope = %scope, seq, "Export job enqueued");
        ExportJob { seq, scope }
    }

    fn is_latest(&self, job: &ExportJob) -> bool {
        let latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        latest.get(&job.scope).is_none_or(|seq| *seq == job.seq)
    }

    fn scope_lock(&self, scope: &Scope) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(scope.clone()).or_default())
    }

    #[instrument(skip(self), fields(scope = %job.scope, seq = job.seq))]
    pub async fn export(&self, job: &ExportJob) -> Result<ExportOutcome> {
        let Some(target) = self.targets.get(&job.scope) else {
            exn::bail!(ErrorKind::UnknownScope(job.scope.clone()));
        };
        if !self.is_latest(job) {
            tracing::debug!("Export job superseded before start");
            return Ok(ExportOutcome::Superseded);
        }

        let index = self.store.index().await;
        let Some((latest_key, latest_entry)) = index.latest(&job.scope) else {
            exn::bail!(ErrorKind::SourceMissing(job.scope.clone()));
        };
        let latest = match self.summary(latest_key, latest_entry).await? {
            Some(summary) => summary,
            None => exn::bail!(ErrorKind::SourceMissing(job.scope.clone())),
        };

        let until = latest.timestamp();
        let since = until - HISTORICAL_WINDOW;
        // The latest snapshot is the newest of its scope.
        let mut historical = self.window(&index, &job.scope, since, until - 1).await?;
        historical.push(latest.clone());

        // Region blocks pool every stored realm of the region, up to the same
        // point in time.
        let mut region_historical = historical.clone();
        let neighbours = index.scopes().into_iter().filter(|scope| scope.region == job.scope.region && *scope != job.scope);
        for scope in neighbours {
            region_historical.extend(self.window(&index, &scope, since, until).await?);
        }

        let recent_since = until - SCAN_STAT_WINDOW;
        let recent = within(&historical, recent_since);
        let region_recent = within(&region_historical, recent_since);
        let region_label = job.scope.region.to_string().to_uppercase();
        let contents = tsm::render(
            &target.label,
            &region_label,
            &latest,
            Windows {
                recent: &recent,
                historical: &historical,
            },
            Windows {
                recent: &region_recent,
                historical: &region_historical,
            },
        );

        let lock = self.scope_lock(&job.scope);
        let _guard = lock.lock().await;
        if !self.is_latest(job) {
            tracing::debug!("Export job superseded before write");
            return Ok(ExportOutcome::Superseded);
        }
        write_atomic(&target.destination, contents.into_bytes())
            .await
            .or_raise(|| ErrorKind::WriteFailure(target.destination.clone()))?;
        tracing::info!(
            path = %target.destination.display(),
            snapshots = historical.len(),
            region_snapshots = region_historical.len(),
            timestamp = latest.timestamp(),
            "Export written"
        );
        Ok(ExportOutcome::Written(target.destination.clone()))
    }

    /// Summaries of `scope` taken within `since..=until`, oldest first.
    /// Malformed snapshots are skipped.
    async fn window(&self, index: &StoreIndex, scope: &Scope, since: i64, until: i64) -> Result<Vec<SnapshotSummary>> {
        let mut summaries = Vec::new();
        for (key, entry) in index.scope(scope).filter(|(key, _)| (since..=until).contains(&key.timestamp)) {
            match self.summary(key, entry).await {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => {},
                Err(err) if matches!(&*err, ErrorKind::TransformError(_)) => {
                    tracing::warn!(key = %key, error = ?err, "Skipping malformed snapshot");
                },
                Err(err) => return Err(err),
            }
        }
        Ok(summaries)
    }

    /// Summary for one snapshot, through the cache. `None` when the file is
    /// gone from the store.
    async fn summary(&self, key: &SnapshotKey, entry: &IndexEntry) -> Result<Option<SnapshotSummary>> {
        let computed = self
            .cache
            .get_or_compute(SUMMARY_NAMESPACE, &entry.fingerprint, || async {
                match self.store.listing(key).await? {
                    Some(listing) => Ok(SnapshotSummary::from_listing(&listing)),
                    None => Err(exn::Exn::from(StoreErrorKind::NotFound(entry.path.clone()))),
                }
            })
            .await;
        match computed {
            Ok(summary) => Ok(Some(summary)),
            Err(err) if matches!(&*err, StoreErrorKind::NotFound(_)) => Ok(None),
            Err(err) if matches!(&*err, StoreErrorKind::CorruptData(_)) => {
                Err(err).or_raise(|| ErrorKind::TransformError(key.clone()))
            },
            Err(err) => Err(err).or_raise(|| ErrorKind::Store),
        }
    }
}

fn within(summaries: &[SnapshotSummary], since: i64) -> Vec<SnapshotSummary> {
    summaries.iter().filter(|summary| summary.timestamp() >= since).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahdb_store::backend::{LocalBackend, MockBackend};
    use ahdb_store::{Auction, BackendHandle, Compression, Listing};
    use std::path::Path;

    fn scope() -> Scope {
        "us/stormrage".parse().unwrap()
    }

    fn payload(timestamp: i64, buyout: u64) -> Vec<u8> {
        payload_for(&scope(), timestamp, buyout)
    }

    fn payload_for(scope: &Scope, timestamp: i64, buyout: u64) -> Vec<u8> {
        let listing = Listing {
            region: scope.region,
            realm: scope.realm.clone(),
            timestamp,
            auctions: vec![Auction {
                item: "19019".to_string(),
                buyout,
                quantity: 1,
            }],
        };
        listing.encode().unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SnapshotStore>,
        pipeline: ExportPipeline,
        destination: PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend: BackendHandle = Arc::new(MockBackend::default());
        let store = Arc::new(SnapshotStore::open(backend, Compression::Gzip).await.unwrap());
        let cache = CacheManager::new(dir.path().join("cache")).unwrap();
        let destination = ExportTarget::default_destination(&dir.path().join("out"), &scope());
        let target = ExportTarget::new(scope(), "Stormrage", destination.clone());
        let pipeline = ExportPipeline::new(Arc::clone(&store), cache, [target]);
        Fixture {
            _dir: dir,
            store,
            pipeline,
            destination,
        }
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn test_export_writes_file() {
        let f = fixture().await;
        f.store.put(&scope().key(1_000), &payload(1_000, 64)).await.unwrap();
        f.store.put(&scope().key(2_000), &payload(2_000, 32)).await.unwrap();
        let job = f.pipeline.enqueue(scope());
        let outcome = f.pipeline.export(&job).await.unwrap();
        assert_eq!(outcome, ExportOutcome::Written(f.destination.clone()));
        assert!(f.destination.ends_with("us-stormrage.lua"));
        let out = read(&f.destination);
        assert!(out.contains("downloadTime=2000"));
        assert!(out.contains("{19019,10,1,10}"));
        assert!(out.contains("{19019,1G}"));
        assert!(out.lines().last().unwrap().contains("lastSync=2000"));
    }

    #[tokio::test]
    async fn test_superseded_job_writes_nothing() {
        let f = fixture().await;
        f.store.put(&scope().key(1_000), &payload(1_000, 64)).await.unwrap();
        let first = f.pipeline.enqueue(scope());
        let second = f.pipeline.enqueue(scope());
        assert!(second.seq > first.seq);
        assert_eq!(f.pipeline.export(&first).await.unwrap(), ExportOutcome::Superseded);
        assert!(!f.destination.exists());
        assert!(matches!(f.pipeline.export(&second).await.unwrap(), ExportOutcome::Written(_)));
    }

    #[tokio::test]
    async fn test_stale_job_never_overwrites_newer_output() {
        let f = fixture().await;
        f.store.put(&scope().key(1_000), &payload(1_000, 64)).await.unwrap();
        let stale = f.pipeline.enqueue(scope());
        f.store.put(&scope().key(2_000), &payload(2_000, 32)).await.unwrap();
        let fresh = f.pipeline.enqueue(scope());
        f.pipeline.export(&fresh).await.unwrap();
        let expected = read(&f.destination);
        assert_eq!(f.pipeline.export(&stale).await.unwrap(), ExportOutcome::Superseded);
        assert_eq!(read(&f.destination), expected);
    }

    #[tokio::test]
    async fn test_source_missing() {
        let f = fixture().await;
        let job = f.pipeline.enqueue(scope());
        let err = f.pipeline.export(&job).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SourceMissing(_)));
        assert!(!f.destination.exists());
    }

    #[tokio::test]
    async fn test_unknown_scope() {
        let f = fixture().await;
        let job = f.pipeline.enqueue("eu/argent-dawn".parse().unwrap());
        let err = f.pipeline.export(&job).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownScope(_)));
    }

    #[tokio::test]
    async fn test_window_excludes_old_snapshots() {
        let f = fixture().await;
        let now = 100 * DAY;
        f.store.put(&scope().key(now - 61 * DAY), &payload(now - 61 * DAY, 1_000)).await.unwrap();
        f.store.put(&scope().key(now - 30 * DAY), &payload(now - 30 * DAY, 64)).await.unwrap();
        f.store.put(&scope().key(now), &payload(now, 32)).await.unwrap();
        let job = f.pipeline.enqueue(scope());
        f.pipeline.export(&job).await.unwrap();
        let out = read(&f.destination);
        // Scan stat only sees the latest snapshot; historical averages 64 and 32.
        let lines: Vec<_> = out.lines().collect();
        assert!(lines[1].contains("{19019,10}"));
        assert!(lines[2].contains("{19019,1G}"));
    }

    #[tokio::test]
    async fn test_region_blocks_pool_realms_of_the_region() {
        let f = fixture().await;
        let neighbour: Scope = "us/area-52".parse().unwrap();
        let elsewhere: Scope = "eu/draenor".parse().unwrap();
        f.store.put(&scope().key(2_000), &payload(2_000, 32)).await.unwrap();
        f.store.put(&neighbour.key(1_500), &payload_for(&neighbour, 1_500, 128)).await.unwrap();
        // Newer than the exported snapshot, or from another region: ignored.
        f.store.put(&neighbour.key(3_000), &payload_for(&neighbour, 3_000, 4_096)).await.unwrap();
        f.store.put(&elsewhere.key(1_800), &payload_for(&elsewhere, 1_800, 1_000)).await.unwrap();

        f.pipeline.export(&f.pipeline.enqueue(scope())).await.unwrap();
        let out = read(&f.destination);
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 6);
        // The realm's own blocks only see its own snapshot.
        assert!(lines[1].contains("{19019,10}"));
        // (32 + 128) / 2 = 80
        assert!(lines[3].starts_with("select(2, ...).LoadData(\"AUCTIONDB_REGION_STAT\",\"US\""));
        assert!(lines[3].contains("{19019,2G}"));
        assert!(lines[4].starts_with("select(2, ...).LoadData(\"AUCTIONDB_REGION_HISTORICAL\",\"US\""));
        assert!(lines[4].contains("{19019,2G}"));
    }

    #[tokio::test]
    async fn test_write_failure_keeps_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let backend: BackendHandle = Arc::new(LocalBackend::new("db", dir.path().join("db")).unwrap());
        let store = Arc::new(SnapshotStore::open(backend, Compression::None).await.unwrap());
        store.put(&scope().key(1_000), &payload(1_000, 64)).await.unwrap();
        let cache = CacheManager::new(dir.path().join("cache")).unwrap();
        // Destination's parent is a regular file, so the write must fail.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"keep").unwrap();
        let target = ExportTarget::new(scope(), "Stormrage", blocker.join("out.lua"));
        let pipeline = ExportPipeline::new(store, cache, [target]);
        let err = pipeline.export(&pipeline.enqueue(scope())).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::WriteFailure(_)));
        assert_eq!(std::fs::read(&blocker).unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_summaries_are_cached_by_fingerprint() {
        let f = fixture().await;
        let outcome = f.store.put(&scope().key(1_000), &payload(1_000, 64)).await.unwrap();
        f.pipeline.export(&f.pipeline.enqueue(scope())).await.unwrap();
        let cached: Option<SnapshotSummary> = f.pipeline.cache.get(SUMMARY_NAMESPACE, outcome.fingerprint()).await;
        assert_eq!(cached.unwrap().key, scope().key(1_000));
    }
}
