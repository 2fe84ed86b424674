use crate::error::{ErrorKind, Result};
use crate::model::{Config, Selection, default_config_stem};
use ahdb_remote::{RepoRef, validate_proxy};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Prefix of environment overrides; `__` separates nested keys.
pub const ENV_PREFIX: &str = "AHDB_";
const EXTENSIONS: [&str; 4] = ["toml", "yaml", "yml", "json"];

impl Config {
    /// Load defaults, then the configuration file, then `AHDB_*` environment
    /// variables, each overriding the previous.
    ///
    /// An explicit `path` must exist. Without one, the first
    /// `config.{toml,yaml,yml,json}` found in the platform config directory is
    /// used, if any.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => discover(),
        };
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Loading configuration file");
            figment = merge_file(figment, file)?;
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        let base = std::env::current_dir().or_raise(|| ErrorKind::WorkingDirectory)?;
        Self::from_figment(&figment, &base)
    }

    /// Extract from an already assembled figment, resolving relative paths
    /// against `base`.
    pub fn from_figment(figment: &Figment, base: &Path) -> Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| exn::Exn::from(ErrorKind::Malformed(e.to_string())))?;
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| exn::Exn::from(ErrorKind::Invalid(msg));
        let intervals = [
            ("sync.interval_secs", self.sync.interval_secs),
            ("sync.max_backoff_secs", self.sync.max_backoff_secs),
            ("remote.timeout_secs", self.remote.timeout_secs),
            ("export.poll_interval_secs", self.export.poll_interval_secs),
            ("update.check_interval_secs", self.update.check_interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(invalid(format!("{name} must be greater than zero")));
        }
        self.remote
            .repo
            .parse::<RepoRef>()
            .map_err(|e| invalid(format!("remote.repo: {}", *e)))?;
        if self.remote.branch.trim().is_empty() {
            return Err(invalid("remote.branch must not be empty".to_string()));
        }
        if let Some(proxy) = &self.remote.proxy {
            validate_proxy(proxy).map_err(|e| invalid(format!("remote.proxy: {}", *e)))?;
        }
        let mut seen = HashSet::new();
        for entry in &self.export.selection {
            let Some(selection) = self.export.resolve(entry) else {
                return Err(invalid(format!("export.selection: invalid realm `{}`", entry.realm)));
            };
            if !seen.insert(selection.scope.clone()) {
                return Err(invalid(format!("export.selection: {} selected twice", selection.scope)));
            }
        }
        Ok(())
    }

    /// The export selection, with slugs and destinations filled in.
    pub fn selection(&self) -> Vec<Selection> {
        self.export
            .selection
            .iter()
            .filter_map(|entry| self.export.resolve(entry))
            .collect()
    }
}

fn discover() -> Option<PathBuf> {
    let stem = default_config_stem()?;
    EXTENSIONS
        .iter()
        .map(|ext| stem.with_extension(ext))
        .find(|path| path.is_file())
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    Ok(match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file_exact(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
        Some("json") => figment.merge(Json::file_exact(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    })
}
