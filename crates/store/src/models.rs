//! Snapshot identity and payload types.

use crate::codec::Compression;
use crate::error::{ErrorKind, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Game region an auction house belongs to.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    #[display("us")]
    Us,
    #[display("eu")]
    Eu,
    #[display("kr")]
    Kr,
    #[display("tw")]
    Tw,
    #[display("cn")]
    Cn,
}
impl Region {
    pub const ALL: [Region; 5] = [Region::Us, Region::Eu, Region::Kr, Region::Tw, Region::Cn];

    /// Uppercase label used by the addon.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Us => "US",
            Self::Eu => "EU",
            Self::Kr => "KR",
            Self::Tw => "TW",
            Self::Cn => "CN",
        }
    }
}
impl FromStr for Region {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|region| region.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidKey(format!("unknown region `{s}`"))))
    }
}

/// Slug naming a realm or connected realm group: lowercase ASCII letters,
/// digits and `-`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RealmSlug(String);
impl RealmSlug {
    /// Build a slug from a display name: `"Argent Dawn"` becomes
    /// `argent-dawn`, `"Kel'Thuzad"` becomes `kelthuzad`.
    pub fn from_name(name: &str) -> Result<Self> {
        let mut slug = String::with_capacity(name.len());
        for c in name.trim().chars() {
            match c {
                '\'' => {},
                c if c.is_whitespace() || c == '-' || c == '_' => {
                    if !slug.is_empty() && !slug.ends_with('-') {
                        slug.push('-');
                    }
                },
                c if c.is_ascii_alphanumeric() => slug.push(c.to_ascii_lowercase()),
                _ => exn::bail!(ErrorKind::InvalidKey(format!("realm name `{name}`"))),
            }
        }
        while slug.ends_with('-') {
            slug.pop();
        }
        Self::try_from(slug)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl TryFrom<String> for RealmSlug {
    type Error = crate::error::Error;
    fn try_from(value: String) -> Result<Self> {
        let valid = !value.is_empty()
            && !value.starts_with('-')
            && value.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        match valid {
            true => Ok(Self(value)),
            false => exn::bail!(ErrorKind::InvalidKey(format!("realm slug `{value}`"))),
        }
    }
}
impl From<RealmSlug> for String {
    fn from(value: RealmSlug) -> Self {
        value.0
    }
}
impl FromStr for RealmSlug {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::try_from(s.to_string())
    }
}
impl fmt::Display for RealmSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `(region, realm)` pair: the unit of selection, watching and export.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[display("{region}/{realm}")]
pub struct Scope {
    pub region: Region,
    pub realm: RealmSlug,
}
impl Scope {
    pub fn new(region: Region, realm: RealmSlug) -> Self {
        Self { region, realm }
    }

    pub fn key(&self, timestamp: i64) -> SnapshotKey {
        SnapshotKey {
            region: self.region,
            realm: self.realm.clone(),
            timestamp,
        }
    }
}
impl FromStr for Scope {
    type Err = crate::error::Error;
    /// Parses `region/realm`.
    fn from_str(s: &str) -> Result<Self> {
        let Some((region, realm)) = s.split_once('/') else {
            exn::bail!(ErrorKind::InvalidKey(format!("scope `{s}` is not `region/realm`")));
        };
        Ok(Self::new(region.parse()?, realm.parse()?))
    }
}

/// Identity of one snapshot. Ordered by timestamp, then region, then realm.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display("{region}/{realm}@{timestamp}")]
pub struct SnapshotKey {
    pub region: Region,
    pub realm: RealmSlug,
    /// Unix seconds
    pub timestamp: i64,
}
impl SnapshotKey {
    pub fn new(region: Region, realm: RealmSlug, timestamp: i64) -> Self {
        Self { region, realm, timestamp }
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.region, self.realm.clone())
    }

    /// Store-relative path: `{region}/{realm}/{timestamp}.json[.gz]`.
    pub fn relative_path(&self, compression: Compression) -> PathBuf {
        PathBuf::from(self.region.to_string())
            .join(self.realm.as_str())
            .join(format!("{}.json{}", self.timestamp, compression.extension()))
    }

    /// Inverse of [`relative_path`](Self::relative_path). Returns `None` for
    /// anything that is not a snapshot file.
    pub fn from_relative_path(path: &Path) -> Option<(Self, Compression)> {
        let mut components = path.iter().map(|c| c.to_str());
        let region = components.next()??.parse().ok()?;
        let realm = components.next()??.parse().ok()?;
        let file = components.next()??;
        if components.next().is_some() {
            return None;
        }
        let compression = Compression::from_path(file);
        let stem = file.strip_suffix(compression.extension())?.strip_suffix(".json")?;
        let timestamp = stem.parse::<i64>().ok().filter(|ts| *ts >= 0)?;
        Some((Self::new(region, realm, timestamp), compression))
    }
}
impl Ord for SnapshotKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.region.cmp(&other.region))
            .then_with(|| self.realm.cmp(&other.realm))
    }
}
impl PartialOrd for SnapshotKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// BLAKE3 hex digest of a decoded snapshot payload.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);
impl Fingerprint {
    pub fn of(payload: &[u8]) -> Self {
        Self(blake3::hash(payload).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value.to_ascii_lowercase())
    }
}

/// One auction in a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auction {
    /// TSM item string, e.g. `19019` or `i:19019::1`.
    pub item: String,
    /// Per-unit buyout in copper.
    pub buyout: u64,
    pub quantity: u32,
}

/// Decoded snapshot payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub region: Region,
    pub realm: RealmSlug,
    pub timestamp: i64,
    pub auctions: Vec<Auction>,
}
impl Listing {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey::new(self.region, self.realm.clone(), self.timestamp)
    }

    /// Decode a payload and check it belongs to `key`.
    pub fn decode(payload: &[u8], key: &SnapshotKey) -> Result<Self> {
        let listing: Self = serde_json::from_slice(payload)
            .map_err(|e| exn::Exn::from(ErrorKind::CorruptData(format!("{key}: {e}"))))?;
        // Negative timestamps have no file name the rescan would accept.
        if listing.timestamp < 0 {
            exn::bail!(ErrorKind::CorruptData(format!("{key}: negative timestamp")));
        }
        if &listing.key() != key {
            exn::bail!(ErrorKind::CorruptData(format!("{key}: payload belongs to {}", listing.key())));
        }
        if let Some(auction) = listing.auctions.iter().find(|a| a.quantity == 0 || a.item.is_empty()) {
            exn::bail!(ErrorKind::CorruptData(format!("{key}: invalid auction for item `{}`", auction.item)));
        }
        Ok(listing)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| exn::Exn::from(ErrorKind::CorruptData(format!("{}: {e}", self.key()))))
    }
}
