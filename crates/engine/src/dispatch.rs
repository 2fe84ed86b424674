//! Export worker: runs jobs in arrival order and reports each result.

use crate::events::{EngineEvent, Events, SkipReason};
use crate::watch::Watcher;
use ahdb_export::error::ErrorKind as ExportErrorKind;
use ahdb_export::{ExportJob, ExportOutcome, ExportPipeline};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Process one job and turn its result into an event.
pub async fn run_job(pipeline: &ExportPipeline, job: &ExportJob) -> EngineEvent {
    let scope = job.scope.clone();
    match pipeline.export(job).await {
        Ok(ExportOutcome::Written(path)) => EngineEvent::ExportWritten { scope, path },
        Ok(ExportOutcome::Superseded) => EngineEvent::ExportSkipped {
            scope,
            reason: SkipReason::Superseded,
        },
        Err(err) if matches!(&*err, ExportErrorKind::SourceMissing(_)) => {
            tracing::info!(scope = %scope, "Nothing to export yet");
            EngineEvent::ExportSkipped {
                scope,
                reason: SkipReason::SourceMissing,
            }
        },
        Err(err) => {
            tracing::error!(scope = %scope, error = ?err, "Export failed");
            EngineEvent::ExportFailed {
                scope,
                error: err.to_string(),
            }
        },
    }
}

/// Drain `jobs` until the channel closes or `cancel` fires, settling each job
/// with the `watcher` that dispatched it.
pub async fn export_worker(
    pipeline: &ExportPipeline,
    watcher: Option<&Watcher>,
    mut jobs: mpsc::Receiver<ExportJob>,
    events: Events,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
            () = cancel.cancelled() => break,
        };
        let event = run_job(pipeline, &job).await;
        if let Some(watcher) = watcher {
            watcher.settle(&job, !matches!(event, EngineEvent::ExportFailed { .. }));
        }
        events.emit(event);
    }
    tracing::info!("Export worker shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahdb_cache::CacheManager;
    use ahdb_export::ExportTarget;
    use ahdb_store::backend::MockBackend;
    use ahdb_store::{Auction, BackendHandle, Compression, Listing, Scope, SnapshotStore};
    use std::sync::Arc;

    fn scope() -> Scope {
        "us/stormrage".parse().unwrap()
    }

    async fn pipeline(dir: &std::path::Path) -> (Arc<SnapshotStore>, ExportPipeline) {
        let backend: BackendHandle = Arc::new(MockBackend::default());
        let store = Arc::new(SnapshotStore::open(backend, Compression::Gzip).await.unwrap());
        let cache = CacheManager::new(dir.join("cache")).unwrap();
        let target = ExportTarget::new(scope(), "Stormrage", dir.join("out.lua"));
        (Arc::clone(&store), ExportPipeline::new(store, cache, [target]))
    }

    async fn put(store: &SnapshotStore, timestamp: i64) {
        let listing = Listing {
            region: scope().region,
            realm: scope().realm,
            timestamp,
            auctions: vec![Auction {
                item: "19019".to_string(),
                buyout: 1_000,
                quantity: 1,
            }],
        };
        store.put(&listing.key(), &listing.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_reports_each_job() {
        let dir = tempfile::tempdir().unwrap();
        let (store, pipeline) = pipeline(dir.path()).await;
        let events = Events::new();
        let mut rx = events.subscribe();
        let (tx, jobs) = mpsc::channel(8);

        tx.send(pipeline.enqueue(scope())).await.unwrap();
        put(&store, 100).await;
        let stale = pipeline.enqueue(scope());
        let fresh = pipeline.enqueue(scope());
        tx.send(stale).await.unwrap();
        tx.send(fresh).await.unwrap();
        tx.send(pipeline.enqueue("eu/argent-dawn".parse().unwrap())).await.unwrap();
        drop(tx);

        export_worker(&pipeline, None, jobs, events.clone(), CancellationToken::new()).await;

        // The first job was already superseded by the time it ran.
        let expected = [
            EngineEvent::ExportSkipped {
                scope: scope(),
                reason: SkipReason::Superseded,
            },
            EngineEvent::ExportSkipped {
                scope: scope(),
                reason: SkipReason::Superseded,
            },
            EngineEvent::ExportWritten {
                scope: scope(),
                path: dir.path().join("out.lua"),
            },
        ];
        for event in expected {
            assert_eq!(rx.recv().await.unwrap(), event);
        }
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::ExportFailed { .. }));
    }

    #[tokio::test]
    async fn test_source_missing_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, pipeline) = pipeline(dir.path()).await;
        let event = run_job(&pipeline, &pipeline.enqueue(scope())).await;
        assert_eq!(
            event,
            EngineEvent::ExportSkipped {
                scope: scope(),
                reason: SkipReason::SourceMissing
            }
        );
    }
}
