//! Builds the store, cache, remote and workers from a [`Config`].

use crate::error::{ErrorKind, Result};
use ahdb_cache::CacheManager;
use ahdb_config::Config;
use ahdb_engine::{Elapsed, Events, SyncEngine, UpdateChecker, Watcher};
use ahdb_export::{ExportPipeline, ExportTarget};
use ahdb_remote::{GithubOptions, GithubSource, RemoteHandle, RepoRef};
use ahdb_store::backend::LocalBackend;
use ahdb_store::{Compression, Scope, SnapshotStore};
use exn::ResultExt;
use semver::Version;
use std::sync::Arc;
use time::OffsetDateTime;

const RUNNING_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct App {
    pub config: Config,
    pub store: Arc<SnapshotStore>,
    pub cache: CacheManager,
    pub events: Events,
}

impl App {
    pub async fn open(config: Config) -> Result<Self> {
        let backend = LocalBackend::new("database", &config.database.path).or_raise(|| ErrorKind::Database)?;
        let compression = if config.database.compress {
            Compression::Gzip
        } else {
            Compression::None
        };
        let store = SnapshotStore::open(Arc::new(backend), compression)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let cache = CacheManager::new(&config.cache.path)
            .or_raise(|| ErrorKind::Cache)?
            .with_expiry(config.cache.expires_in());
        Ok(Self {
            config,
            store: Arc::new(store),
            cache,
            events: Events::new(),
        })
    }

    pub fn remote(&self) -> Result<RemoteHandle> {
        let remote = &self.config.remote;
        let repo = remote.repo.parse::<RepoRef>().or_raise(|| ErrorKind::Config)?;
        let options = GithubOptions {
            timeout: remote.timeout(),
            proxy: remote.proxy.clone(),
            ..GithubOptions::default()
        };
        let source = GithubSource::new(&repo, &remote.branch, options).or_raise(|| ErrorKind::Remote)?;
        Ok(Arc::new(source))
    }

    /// Remote mode only; local mode never contacts the snapshot repository.
    pub fn sync_engine(&self) -> Result<SyncEngine> {
        if !self.config.remote.enabled {
            exn::bail!(ErrorKind::RemoteDisabled);
        }
        Ok(SyncEngine::new(self.store.clone(), self.remote()?, self.events.clone())
            .with_region(self.config.remote.region)
            .with_retention(self.config.database.retention()))
    }

    pub async fn update_checker(&self) -> Result<UpdateChecker> {
        let running = Version::parse(RUNNING_VERSION).or_raise(|| ErrorKind::UpdateCheck)?;
        Ok(UpdateChecker::new(self.remote()?, running, self.events.clone())
            .with_skip(self.config.update.skip)
            .with_state_file(&self.config.update.state_file)
            .await)
    }

    /// Export targets for the configured selection plus `extra` scopes.
    ///
    /// Extra scopes that are not selected get the default destination and
    /// their slug as label.
    pub fn targets(&self, extra: &[Scope]) -> Vec<ExportTarget> {
        let mut targets: Vec<ExportTarget> = self
            .config
            .selection()
            .into_iter()
            .map(|selection| ExportTarget::new(selection.scope, selection.label, selection.destination))
            .collect();
        for scope in extra {
            if targets.iter().any(|target| &target.scope == scope) {
                continue;
            }
            let destination = ExportTarget::default_destination(&self.config.export.directory, scope);
            targets.push(ExportTarget::new(scope.clone(), scope.realm.as_str(), destination));
        }
        targets
    }

    pub fn pipeline(&self, extra: &[Scope]) -> ExportPipeline {
        ExportPipeline::new(self.store.clone(), self.cache.clone(), self.targets(extra))
    }

    pub fn watcher(&self, pipeline: &ExportPipeline) -> Watcher {
        let scopes = pipeline.targets().map(|target| target.scope.clone());
        Watcher::new(self.store.clone(), scopes, self.config.export.poll_interval())
    }

    /// One line per stored scope: snapshot count and age of the newest.
    pub async fn status(&self, now: OffsetDateTime) -> Vec<String> {
        let index = self.store.index().await;
        index
            .scopes()
            .into_iter()
            .map(|scope| {
                let count = index.scope(&scope).count();
                let latest = index
                    .latest(&scope)
                    .and_then(|(key, _)| OffsetDateTime::from_unix_timestamp(key.timestamp).ok());
                let age = Elapsed::between(latest, now);
                format!("{scope}: {count} snapshot(s), latest {age} ago")
            })
            .collect()
    }
}
