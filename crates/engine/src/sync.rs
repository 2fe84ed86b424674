//! Reconciles the local snapshot store against the remote.

use crate::error::{ErrorKind, Result};
use crate::events::{EngineEvent, Events};
use ahdb_remote::RemoteHandle;
use ahdb_remote::error::ErrorKind as RemoteErrorKind;
use ahdb_store::{Fingerprint, Region, SnapshotKey, SnapshotStore};
use derive_more::Display;
use exn::ResultExt;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// First delay after a failed periodic run; doubles per consecutive failure.
const RETRY_BASE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum SyncState {
    #[display("idle")]
    Idle,
    #[display("listing remote snapshots")]
    Listing,
    #[display("comparing with local store")]
    Diffing,
    #[display("fetching {key} ({done}/{total})")]
    Fetching { key: SnapshotKey, done: usize, total: usize },
    #[display("installing {_0}")]
    Installing(SnapshotKey),
    #[display("failed")]
    Failed,
}

/// A snapshot that could not be synced, and why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyFailure {
    pub key: SnapshotKey,
    pub error: RemoteErrorKind,
}

/// Result of one completed run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Snapshots the remote offered that were missing locally.
    pub missing: usize,
    pub installed: Vec<SnapshotKey>,
    pub failures: Vec<KeyFailure>,
    pub pruned: usize,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn succeeded(&self) -> usize {
        self.installed.len()
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failures.is_empty()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} succeeded", self.succeeded(), self.missing)?;
        if self.cancelled {
            f.write_str(" (cancelled)")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another run was in flight and picked this request up.
    Coalesced,
}

pub struct SyncEngine {
    store: Arc<SnapshotStore>,
    remote: RemoteHandle,
    region: Option<Region>,
    retention: Option<Duration>,
    events: Events,
    state: watch::Sender<SyncState>,
    running: Mutex<()>,
    pending: AtomicBool,
}

impl SyncEngine {
    pub fn new(store: Arc<SnapshotStore>, remote: RemoteHandle, events: Events) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            store,
            remote,
            region: None,
            retention: None,
            events,
            state,
            running: Mutex::new(()),
            pending: AtomicBool::new(false),
        }
    }

    /// Only sync snapshots of `region`.
    pub fn with_region(mut self, region: Option<Region>) -> Self {
        self.region = region;
        self
    }

    /// Prune snapshots older than `retention` after every successful run.
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention.filter(|r| !r.is_zero());
        self
    }

    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SyncState) {
        tracing::debug!(state = %state, "Sync state");
        self.state.send_replace(state.clone());
        self.events.emit(EngineEvent::SyncState(state));
    }

    /// Run a sync, or fold this request into the run already in flight.
    ///
    /// A request that arrives during a run causes exactly one follow-up run,
    /// even if the run it arrived during fails. The caller that drove the
    /// runs gets the first failure, if any.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncOutcome> {
        self.pending.store(true, Ordering::SeqCst);
        let mut report = None;
        let mut failure = None;
        loop {
            let Ok(_guard) = self.running.try_lock() else {
                break;
            };
            while self.pending.swap(false, Ordering::SeqCst) {
                // Requests folded into a failed run still get their follow-up.
                match self.run_once(cancel).await {
                    Ok(completed) => report = Some(completed),
                    Err(err) => {
                        failure.get_or_insert(err);
                    },
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
            drop(_guard);
            // A request may have slipped in between the last check and unlocking.
            if cancel.is_cancelled() || !self.pending.load(Ordering::SeqCst) {
                break;
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(match report {
            Some(report) => SyncOutcome::Completed(report),
            None => SyncOutcome::Coalesced,
        })
    }

    #[instrument(skip_all, fields(remote = %self.remote.describe()))]
    async fn run_once(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let result = self.reconcile(cancel).await;
        match &result {
            Ok(report) => {
                tracing::info!(
                    installed = report.installed.len(),
                    failed = report.failures.len(),
                    pruned = report.pruned,
                    cancelled = report.cancelled,
                    "Sync finished: {report}"
                );
                self.set_state(SyncState::Idle);
                self.events.emit(EngineEvent::SyncFinished(report.clone()));
            },
            Err(err) => {
                tracing::error!(error = ?err, "Sync failed");
                self.set_state(SyncState::Failed);
                self.events.emit(EngineEvent::SyncFailed(err.to_string()));
                self.set_state(SyncState::Idle);
            },
        }
        result
    }

    async fn reconcile(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        self.set_state(SyncState::Listing);
        let available = match self.remote.list_available(self.region).await {
            Ok(available) => available,
            Err(err) => {
                let kind = ErrorKind::from_remote(&err);
                return Err(err).or_raise(|| kind);
            },
        };

        self.set_state(SyncState::Diffing);
        let index = self.store.index().await;
        let mut wanted: HashSet<&Fingerprint> = HashSet::new();
        let missing: Vec<_> = available
            .iter()
            .filter(|entry| !index.contains_fingerprint(&entry.fingerprint) && wanted.insert(&entry.fingerprint))
            .collect();
        tracing::info!(available = available.len(), local = index.len(), missing = missing.len(), "Diffed remote");

        let mut report = SyncReport {
            missing: missing.len(),
            ..Default::default()
        };
        for (done, entry) in missing.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!("Sync cancelled");
                report.cancelled = true;
                break;
            }
            let key = &entry.key;
            self.set_state(SyncState::Fetching {
                key: key.clone(),
                done,
                total: missing.len(),
            });
            let payload = match self.remote.fetch(key).await {
                Ok(payload) => payload,
                Err(err) if err.is_per_resource() => {
                    tracing::warn!(key = %key, error = %*err, "Fetch failed, skipping");
                    report.failures.push(KeyFailure {
                        key: key.clone(),
                        error: (*err).clone(),
                    });
                    continue;
                },
                Err(err) => {
                    let kind = ErrorKind::from_remote(&err);
                    return Err(err).or_raise(|| kind);
                },
            };
            let fingerprint = Fingerprint::of(&payload);
            if fingerprint != entry.fingerprint {
                tracing::warn!(key = %key, expected = %entry.fingerprint, actual = %fingerprint, "Fingerprint mismatch");
                report.failures.push(KeyFailure {
                    key: key.clone(),
                    error: RemoteErrorKind::CorruptData(format!("{key}: fingerprint mismatch")),
                });
                continue;
            }

            self.set_state(SyncState::Installing(key.clone()));
            match self.store.put(key, &payload).await {
                Ok(_) => report.installed.push(key.clone()),
                Err(err) if err.is_io_failure() => return Err(err).or_raise(|| ErrorKind::Install),
                Err(err) => {
                    tracing::warn!(key = %key, error = %*err, "Rejected remote snapshot");
                    report.failures.push(KeyFailure {
                        key: key.clone(),
                        error: RemoteErrorKind::CorruptData(err.to_string()),
                    });
                },
            }
        }

        if let Some(retention) = self.retention
            && !report.cancelled
        {
            let cutoff = time::OffsetDateTime::now_utc().unix_timestamp() - retention.as_secs() as i64;
            match self.store.prune(cutoff).await {
                Ok(pruned) => report.pruned = pruned,
                Err(err) => tracing::warn!(error = ?err, "Pruning old snapshots failed"),
            }
        }
        Ok(report)
    }

    /// Sync every `interval` until cancelled. Failed runs are retried after
    /// a delay that doubles per consecutive failure, capped at `max_backoff`.
    pub async fn run_periodic(&self, interval: Duration, max_backoff: Duration, cancel: CancellationToken) {
        let mut failures: u32 = 0;
        loop {
            let delay = match self.run(&cancel).await {
                Ok(_) => {
                    failures = 0;
                    interval
                },
                Err(err) if err.is_retryable() => {
                    failures = failures.saturating_add(1);
                    let delay = backoff(failures, max_backoff);
                    tracing::warn!(failures, retry_in = ?delay, "Sync will be retried");
                    delay
                },
                Err(_) => interval,
            };
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = cancel.cancelled() => {
                    tracing::info!("Periodic sync shutting down");
                    break;
                },
            }
        }
    }
}

fn backoff(failures: u32, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    RETRY_BASE.saturating_mul(factor).min(max)
}
