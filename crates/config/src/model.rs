use ahdb_store::{RealmSlug, Region, Scope};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

const DAY: u64 = 24 * 60 * 60;

static DIRS: LazyLock<Option<ProjectDirs>> = LazyLock::new(|| ProjectDirs::from("", "", "ahdb"));

fn data_dir() -> PathBuf {
    DIRS.as_ref()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("ahdb-data"))
}

/// Default location of the configuration file, without extension.
pub fn default_config_stem() -> Option<PathBuf> {
    DIRS.as_ref().map(|dirs| dirs.config_dir().join("config"))
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub export: ExportConfig,
    pub update: UpdateConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Store snapshots gzip-compressed.
    pub compress: bool,
    /// Snapshots older than this are pruned after a sync. `0` keeps everything.
    pub retention_days: u64,
}
impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("db"),
            compress: true,
            retention_days: 60,
        }
    }
}
impl DatabaseConfig {
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_days > 0).then(|| Duration::from_secs(self.retention_days * DAY))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub expires_in_secs: u64,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: DIRS
                .as_ref()
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .unwrap_or_else(|| data_dir().join("cache")),
            expires_in_secs: 7 * DAY,
        }
    }
}
impl CacheConfig {
    pub fn expires_in(&self) -> Duration {
        Duration::from_secs(self.expires_in_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Pull snapshots from the remote repository.
    pub enabled: bool,
    /// `owner/name` or `https://github.com/owner/name`.
    pub repo: String,
    pub branch: String,
    /// Origin every request is routed through, e.g. `https://gh-proxy.example/`.
    pub proxy: Option<String>,
    pub timeout_secs: u64,
    /// Only sync this region.
    pub region: Option<Region>,
}
impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repo: ahdb_remote::DEFAULT_REPO.to_string(),
            branch: ahdb_remote::DEFAULT_BRANCH.to_string(),
            proxy: None,
            timeout_secs: 10,
            region: None,
        }
    }
}
impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub max_backoff_secs: u64,
}
impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            max_backoff_secs: 30 * 60,
        }
    }
}
impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// One realm chosen for export.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionEntry {
    pub region: Region,
    /// Realm name (`Argent Dawn`) or slug (`argent-dawn`).
    pub realm: String,
    /// Realm name written into the price file; defaults to `realm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Defaults to `{export.directory}/{region}-{slug}.lua`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
}

/// A validated [`SelectionEntry`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub scope: Scope,
    pub label: String,
    pub destination: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Export automatically whenever a selected realm gets a new snapshot.
    pub auto: bool,
    pub directory: PathBuf,
    pub debounce_secs: u64,
    pub poll_interval_secs: u64,
    pub selection: Vec<SelectionEntry>,
}
impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            auto: false,
            directory: data_dir().join("export"),
            debounce_secs: 3,
            poll_interval_secs: 2,
            selection: Vec::new(),
        }
    }
}
impl ExportConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub(crate) fn resolve(&self, entry: &SelectionEntry) -> Option<Selection> {
        let realm = RealmSlug::from_name(&entry.realm).ok()?;
        let scope = Scope::new(entry.region, realm);
        let destination = entry
            .destination
            .clone()
            .unwrap_or_else(|| self.directory.join(format!("{}-{}.lua", scope.region, scope.realm)));
        Some(Selection {
            label: entry.label.clone().unwrap_or_else(|| entry.realm.trim().to_string()),
            destination,
            scope,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub check_interval_secs: u64,
    /// Report newer releases as skipped instead of available.
    pub skip: bool,
    pub state_file: PathBuf,
}
impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 6 * 60 * 60,
            skip: false,
            state_file: data_dir().join("update.json"),
        }
    }
}
impl UpdateConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl Config {
    /// Make every relative path absolute against `base`.
    pub(crate) fn resolve_paths(&mut self, base: &Path) {
        let absolute = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        absolute(&mut self.database.path);
        absolute(&mut self.cache.path);
        absolute(&mut self.export.directory);
        absolute(&mut self.update.state_file);
        for entry in &mut self.export.selection {
            if let Some(destination) = entry.destination.as_mut() {
                absolute(destination);
            }
        }
    }
}
