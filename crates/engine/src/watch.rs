//! Change detection on the snapshot store and debounced export scheduling.

use ahdb_export::{ExportJob, ExportPipeline};
use ahdb_store::{Fingerprint, Scope, SnapshotKey, SnapshotStore};
use async_stream::stream;
use futures::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The newest snapshot of a watched scope differs from the one last handed
/// to the export pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub scope: Scope,
    pub key: SnapshotKey,
    pub fingerprint: Fingerprint,
}

/// Polls the store index for changes to the selected scopes.
///
/// The markers of what has already been handed over live here, not in any
/// loop consuming [`changes`](Self::changes), so a stopped and restarted
/// consumer neither repeats nor misses work. A change counts as handed over
/// once its export job settled; until then it is in flight, and a failed job
/// puts it back up for dispatch.
pub struct Watcher {
    store: Arc<SnapshotStore>,
    scopes: Vec<Scope>,
    poll_interval: Duration,
    markers: Mutex<Markers>,
}

#[derive(Default)]
struct Markers {
    handed: HashMap<Scope, Fingerprint>,
    /// Dispatched jobs that have not settled yet, by sequence number.
    in_flight: HashMap<Scope, (u64, Fingerprint)>,
    retry: HashSet<Scope>,
}

impl Watcher {
    pub fn new(store: Arc<SnapshotStore>, scopes: impl IntoIterator<Item = Scope>, poll_interval: Duration) -> Self {
        Self {
            store,
            scopes: scopes.into_iter().collect(),
            poll_interval,
            markers: Mutex::new(Markers::default()),
        }
    }

    fn markers(&self) -> std::sync::MutexGuard<'_, Markers> {
        self.markers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Report how a job sent by [`dispatch`](Self::dispatch) ended. An
    /// exported (or superseded) job hands its change over; a failed one is
    /// dispatched again on the next poll.
    pub fn settle(&self, job: &ExportJob, exported: bool) {
        let mut markers = self.markers();
        let fingerprint = match markers.in_flight.get(&job.scope) {
            Some((seq, fingerprint)) if *seq == job.seq => fingerprint.clone(),
            _ => return,
        };
        markers.in_flight.remove(&job.scope);
        if exported {
            markers.handed.insert(job.scope.clone(), fingerprint);
        } else {
            tracing::debug!(scope = %job.scope, seq = job.seq, "Export will be retried");
            markers.retry.insert(job.scope.clone());
        }
    }

    /// Scopes whose newest snapshot is neither handed over nor in flight.
    pub async fn pending_changes(&self) -> Vec<ChangeEvent> {
        let index = self.store.index().await;
        let markers = self.markers();
        self.scopes
            .iter()
            .filter_map(|scope| {
                let (key, entry) = index.latest(scope)?;
                let fingerprint = Some(&entry.fingerprint);
                let in_flight = markers.in_flight.get(scope).map(|(_, fp)| fp);
                (markers.handed.get(scope) != fingerprint && in_flight != fingerprint).then(|| ChangeEvent {
                    scope: scope.clone(),
                    key: key.clone(),
                    fingerprint: entry.fingerprint.clone(),
                })
            })
            .collect()
    }

    /// Lazy stream of changes, polled every `poll_interval` until `cancel`
    /// fires. Each distinct change is yielded once per stream, unless its
    /// export failed.
    pub fn changes(&self, cancel: CancellationToken) -> impl Stream<Item = ChangeEvent> + Send + '_ {
        stream! {
            let mut generation = None;
            let mut yielded: HashMap<Scope, Fingerprint> = HashMap::new();
            loop {
                let current = self.store.generation();
                let retry = std::mem::take(&mut self.markers().retry);
                if generation != Some(current) || !retry.is_empty() {
                    generation = Some(current);
                    for change in self.pending_changes().await {
                        if retry.contains(&change.scope) || yielded.get(&change.scope) != Some(&change.fingerprint) {
                            yielded.insert(change.scope.clone(), change.fingerprint.clone());
                            tracing::debug!(scope = %change.scope, key = %change.key, "Store change detected");
                            yield change;
                        }
                    }
                }
                tokio::select! {
                    () = tokio::time::sleep(self.poll_interval) => {},
                    () = cancel.cancelled() => break,
                }
            }
        }
    }

    /// Consume [`changes`](Self::changes), and once a scope has been quiet for
    /// `debounce`, enqueue one export job for it and send it to `jobs`. The
    /// receiving worker reports back through [`settle`](Self::settle).
    ///
    /// Returns when `cancel` fires or the job receiver is gone.
    pub async fn dispatch(
        &self,
        pipeline: &ExportPipeline,
        debounce: Duration,
        jobs: mpsc::Sender<ExportJob>,
        cancel: CancellationToken,
    ) {
        let changes = self.changes(cancel.clone());
        futures::pin_mut!(changes);
        let mut deadlines: HashMap<Scope, (Instant, Fingerprint)> = HashMap::new();
        loop {
            let next = deadlines.values().map(|(deadline, _)| *deadline).min();
            tokio::select! {
                () = cancel.cancelled() => break,
                change = changes.next() => match change {
                    Some(change) => {
                        deadlines.insert(change.scope, (Instant::now() + debounce, change.fingerprint));
                    },
                    None => break,
                },
                () = sleep_until(next), if next.is_some() => {
                    let now = Instant::now();
                    let due: Vec<Scope> = deadlines
                        .iter()
                        .filter(|(_, (deadline, _))| *deadline <= now)
                        .map(|(scope, _)| scope.clone())
                        .collect();
                    for scope in due {
                        let Some((_, fingerprint)) = deadlines.remove(&scope) else {
                            continue;
                        };
                        let job = pipeline.enqueue(scope.clone());
                        tracing::info!(scope = %scope, seq = job.seq, "Scheduling export");
                        // Recorded before sending; the worker may settle the job at once.
                        self.markers().in_flight.insert(scope.clone(), (job.seq, fingerprint));
                        if jobs.send(job).await.is_err() {
                            self.markers().in_flight.remove(&scope);
                            tracing::debug!("Export worker gone, stopping dispatcher");
                            return;
                        }
                    }
                },
            }
        }
        tracing::info!("Watcher shutting down");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
