//! GitHub-hosted snapshot repository, read over HTTPS.
//!
//! Layout under the base URL (by default
//! `https://raw.githubusercontent.com/{owner}/{repo}/{branch}/`):
//!
//! - `manifest.json`: every available snapshot with its fingerprint
//! - `{region}/{realm}/{timestamp}.json.gz`: one gzipped snapshot
//! - `release.json`: the newest application release
//!
//! When a proxy origin is configured, the full request URL is appended to it
//! (`https://proxy.example/https://raw.githubusercontent.com/...`).

use crate::error::{ErrorKind, Result};
use crate::models::{ManifestWire, ReleaseInfo, ReleaseWire, RemoteEntry};
use crate::source::RemoteSource;
use ahdb_store::{Compression, Region, SnapshotKey};
use async_trait::async_trait;
use exn::ResultExt;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub const DEFAULT_REPO: &str = "kamoo1/Kamoo-s-TSM-App";
pub const DEFAULT_BRANCH: &str = "main";
const RAW_ORIGIN: &str = "https://raw.githubusercontent.com";
const MANIFEST_PATH: &str = "manifest.json";
const RELEASE_PATH: &str = "release.json";
const DEFAULT_MAX_SNAPSHOT_BYTES: u64 = 256 * 1024 * 1024;
const USER_AGENT: &str = concat!("ahdb/", env!("CARGO_PKG_VERSION"));

/// `owner/name` of a GitHub repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}
impl RepoRef {
    /// Base URL for raw file access on `branch`.
    pub fn raw_base_url(&self, branch: &str) -> String {
        format!("{RAW_ORIGIN}/{}/{}/{branch}/", self.owner, self.name)
    }

    fn valid_segment(segment: &str) -> bool {
        !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}
impl FromStr for RepoRef {
    type Err = crate::error::Error;
    /// Accepts `owner/name` or `https://github.com/owner/name[.git]`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_end_matches('/');
        let path = ["https://github.com/", "http://github.com/", "github.com/"]
            .iter()
            .find_map(|prefix| trimmed.strip_prefix(prefix))
            .unwrap_or(trimmed);
        let path = path.strip_suffix(".git").unwrap_or(path);
        match path.split('/').collect::<Vec<_>>().as_slice() {
            [owner, name] if Self::valid_segment(owner) && Self::valid_segment(name) => Ok(Self {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            _ => exn::bail!(ErrorKind::InvalidConfig(format!("repository `{s}` is not `owner/name`"))),
        }
    }
}
impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Check a proxy origin and normalize it to end with `/`.
///
/// The proxy must be an `http` or `https` URL with a host.
pub fn validate_proxy(proxy: &str) -> Result<String> {
    let invalid = || ErrorKind::InvalidConfig(format!("proxy `{proxy}` must be an http(s) URL with a host"));
    let url = Url::parse(proxy.trim()).or_raise(invalid)?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none_or(str::is_empty) {
        exn::bail!(invalid());
    }
    let mut normalized = proxy.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Retry behaviour for transient failures: `attempts` extra tries, sleeping
/// `base_delay * 2^n` before try `n`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}
impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 0,
            base_delay: Duration::ZERO,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Clone, Debug)]
pub struct GithubOptions {
    pub timeout: Duration,
    pub proxy: Option<String>,
    pub retry: RetryPolicy,
    /// Largest decoded snapshot accepted from the remote.
    pub max_snapshot_bytes: u64,
}
impl Default for GithubOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            proxy: None,
            retry: RetryPolicy::default(),
            max_snapshot_bytes: DEFAULT_MAX_SNAPSHOT_BYTES,
        }
    }
}

/// [`RemoteSource`] backed by a GitHub repository (or any server with the
/// same layout).
pub struct GithubSource {
    client: Client,
    base_url: String,
    proxy: Option<String>,
    retry: RetryPolicy,
    max_snapshot_bytes: u64,
}

impl GithubSource {
    /// Source for `repo` on `branch` at raw.githubusercontent.com.
    pub fn new(repo: &RepoRef, branch: &str, options: GithubOptions) -> Result<Self> {
        Self::with_base_url(&repo.raw_base_url(branch), options)
    }

    /// Source for an arbitrary base URL laid out like the repository.
    pub fn with_base_url(base_url: &str, options: GithubOptions) -> Result<Self> {
        let mut base_url = base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Url::parse(&base_url).or_raise(|| ErrorKind::InvalidConfig(format!("base URL `{base_url}`")))?;
        let proxy = options.proxy.as_deref().map(validate_proxy).transpose()?;
        let client = Client::builder()
            .timeout(options.timeout)
            .user_agent(USER_AGENT)
            .build()
            .or_raise(|| ErrorKind::InvalidConfig("HTTP client".to_string()))?;
        Ok(Self {
            client,
            base_url,
            proxy,
            retry: options.retry,
            max_snapshot_bytes: options.max_snapshot_bytes,
        })
    }

    fn url(&self, relative: &str) -> String {
        let full = format!("{}{relative}", self.base_url);
        match &self.proxy {
            Some(proxy) => format!("{proxy}{full}"),
            None => full,
        }
    }

    fn snapshot_path(key: &SnapshotKey) -> String {
        format!("{}/{}/{}.json.gz", key.region, key.realm, key.timestamp)
    }

    /// GET with retries on transient failures.
    async fn get(&self, relative: &str) -> Result<Vec<u8>> {
        let url = self.url(relative);
        let mut attempt = 0;
        loop {
            match self.get_once(&url).await {
                Err(err) if err.is_retryable() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    tracing::warn!(%url, attempt, delay_ms = delay.as_millis() as u64, error = %*err, "Retrying remote request");
                    tokio::time::sleep(delay).await;
                },
                result => return result,
            }
        }
    }

    async fn get_once(&self, url: &str) -> Result<Vec<u8>> {
        tracing::debug!(%url, "GET");
        let response = self.client.get(url).send().await.map_err(|e| exn::Exn::from(classify_transport(url, &e)))?;
        let status = response.status();
        if !status.is_success() {
            exn::bail!(classify_status(url, status));
        }
        let body = response.bytes().await.map_err(|e| exn::Exn::from(classify_transport(url, &e)))?;
        Ok(body.to_vec())
    }

    async fn get_json<T: DeserializeOwned>(&self, relative: &str) -> Result<T> {
        let body = self.get(relative).await?;
        serde_json::from_slice(&body)
            .map_err(|e| exn::Exn::from(ErrorKind::CorruptData(format!("{relative}: {e}"))))
    }
}

impl fmt::Debug for GithubSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubSource")
            .field("base_url", &self.base_url)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

fn classify_transport(url: &str, err: &reqwest::Error) -> ErrorKind {
    if err.is_builder() {
        return ErrorKind::InvalidConfig(format!("{url}: {err}"));
    }
    if let Some(status) = err.status() {
        return classify_status(url, status);
    }
    // Timeouts, refused connections, resets and truncated bodies.
    ErrorKind::Transient(format!("{url}: {err}"))
}

fn classify_status(url: &str, status: StatusCode) -> ErrorKind {
    let detail = format!("{url}: HTTP {}", status.as_u16());
    match status {
        StatusCode::NOT_FOUND => ErrorKind::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
            ErrorKind::AuthFailure(detail)
        },
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => ErrorKind::Transient(detail),
        s if s.is_server_error() => ErrorKind::Transient(detail),
        _ => ErrorKind::InvalidConfig(detail),
    }
}

#[async_trait]
impl RemoteSource for GithubSource {
    fn describe(&self) -> String {
        match &self.proxy {
            Some(proxy) => format!("{} via {proxy}", self.base_url),
            None => self.base_url.clone(),
        }
    }

    #[instrument(skip(self), fields(source = %self.base_url))]
    async fn list_available(&self, region: Option<Region>) -> Result<Vec<RemoteEntry>> {
        let manifest: ManifestWire = self.get_json(MANIFEST_PATH).await?;
        let entries: Vec<RemoteEntry> = manifest
            .snapshots
            .into_iter()
            .map(RemoteEntry::from)
            .filter(|entry| region.is_none_or(|region| entry.key.region == region))
            .collect();
        tracing::info!(available = entries.len(), "Fetched remote manifest");
        Ok(entries)
    }

    #[instrument(skip(self), fields(%key))]
    async fn fetch(&self, key: &SnapshotKey) -> Result<Vec<u8>> {
        let path = Self::snapshot_path(key);
        let compressed = self.get(&path).await?;
        Compression::Gzip
            .decompress_limited(&compressed, self.max_snapshot_bytes)
            .or_raise(|| ErrorKind::CorruptData(format!("{path}: not gzip or too large")))
    }

    async fn current_release(&self) -> Result<ReleaseInfo> {
        let release: ReleaseWire = self.get_json(RELEASE_PATH).await?;
        Ok(release.into())
    }
}
