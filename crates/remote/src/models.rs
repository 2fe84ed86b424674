//! Remote listing and release types, plus their wire formats.

use crate::error::{ErrorKind, Result};
use ahdb_store::{Fingerprint, RealmSlug, Region, SnapshotKey};
use semver::Version;
use serde::{Deserialize, Deserializer, Serialize};

/// A snapshot the remote offers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteEntry {
    pub key: SnapshotKey,
    pub fingerprint: Fingerprint,
}

/// The newest published release.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub version: Version,
    /// Unix seconds
    pub published: i64,
    /// Clients older than this release must update.
    pub required: bool,
}

/// Parse a version the way release tags are written: `1.3.0` or `v1.3.0`.
pub fn parse_version(s: &str) -> Result<Version> {
    let trimmed = s.trim();
    let bare = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
    Version::parse(bare).map_err(|e| exn::Exn::from(ErrorKind::CorruptData(format!("version `{s}`: {e}"))))
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ManifestWire {
    pub snapshots: Vec<ManifestEntryWire>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ManifestEntryWire {
    pub region: Region,
    pub realm: RealmSlug,
    pub timestamp: i64,
    pub fingerprint: String,
}
impl From<ManifestEntryWire> for RemoteEntry {
    fn from(wire: ManifestEntryWire) -> Self {
        Self {
            key: SnapshotKey::new(wire.region, wire.realm, wire.timestamp),
            fingerprint: Fingerprint::from(wire.fingerprint),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReleaseWire {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: Version,
    pub published_at: i64,
    #[serde(default)]
    pub required: bool,
}
impl From<ReleaseWire> for ReleaseInfo {
    fn from(wire: ReleaseWire) -> Self {
        Self {
            version: wire.version,
            published: wire.published_at,
            required: wire.required,
        }
    }
}

fn deserialize_version<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Version, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_version(&raw).map_err(|e| serde::de::Error::custom(&*e))
}
