//! Configuration for ahdb.
//!
//! Values come from serialized defaults, then an optional TOML, YAML or JSON
//! file, then `AHDB_`-prefixed environment variables (`AHDB_REMOTE__PROXY`
//! sets `remote.proxy`). Relative paths resolve against the working directory.

pub mod error;
mod load;
mod model;

pub use crate::load::ENV_PREFIX;
pub use crate::model::{
    CacheConfig, Config, DatabaseConfig, ExportConfig, RemoteConfig, Selection, SelectionEntry, SyncConfig,
    UpdateConfig, default_config_stem,
};
