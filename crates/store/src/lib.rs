//! Local auction snapshot database.
//!
//! A store is a directory of immutable snapshot files, one per
//! `(region, realm, timestamp)`, plus an index that is rebuilt from the
//! directory whenever it cannot be trusted. The directory is the source of
//! truth; deleting `index.json` loses nothing.

mod atomic;
pub mod backend;
mod codec;
pub mod error;
mod file;
mod index;
mod models;
mod path;
mod snapshot;

pub use crate::atomic::write_atomic;
pub use crate::backend::StorageBackend;
pub use crate::codec::Compression;
pub use crate::file::FileInfo;
pub use crate::index::{IndexEntry, StoreIndex};
pub use crate::models::{Auction, Fingerprint, Listing, RealmSlug, Region, Scope, SnapshotKey};
pub use crate::path::validate as validate_path;
pub use crate::snapshot::{KeyFilter, PutOutcome, SnapshotStore};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
