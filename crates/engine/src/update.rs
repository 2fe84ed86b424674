//! Software update checks against the remote release feed.

use crate::error::{ErrorKind, Result};
use crate::events::{EngineEvent, Events};
use ahdb_remote::{ReleaseInfo, RemoteHandle};
use ahdb_store::write_atomic;
use exn::ResultExt;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    Available(ReleaseInfo),
    Required(ReleaseInfo),
    /// A newer release exists but update checks are switched off.
    Skipped(ReleaseInfo),
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => f.write_str("up to date"),
            Self::Available(release) => write!(f, "update available: {}", release.version),
            Self::Required(release) => write!(f, "update required: {}", release.version),
            Self::Skipped(release) => write!(f, "update {} skipped", release.version),
        }
    }
}

/// Compare by semantic version precedence; build metadata is ignored.
pub fn classify(running: &Version, release: &ReleaseInfo, skip: bool) -> UpdateStatus {
    if release.version.cmp_precedence(running) != Ordering::Greater {
        return UpdateStatus::UpToDate;
    }
    match (skip, release.required) {
        (true, _) => UpdateStatus::Skipped(release.clone()),
        (false, true) => UpdateStatus::Required(release.clone()),
        (false, false) => UpdateStatus::Available(release.clone()),
    }
}

/// Coarse "last checked" age for display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Elapsed {
    Never,
    UnderMinute,
    Minutes(i64),
    Hours(i64),
    OverDay,
}

impl Elapsed {
    pub fn between(last: Option<OffsetDateTime>, now: OffsetDateTime) -> Self {
        let Some(last) = last else {
            return Self::Never;
        };
        let minutes = (now - last).whole_minutes();
        match minutes {
            m if m < 1 => Self::UnderMinute,
            m if m < 60 => Self::Minutes(m),
            m if m < 24 * 60 => Self::Hours(m / 60),
            _ => Self::OverDay,
        }
    }
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("N/A"),
            Self::UnderMinute => f.write_str("<1 min"),
            Self::Minutes(1) => f.write_str("1 minute"),
            Self::Minutes(m) => write!(f, "{m} minutes"),
            Self::Hours(1) => f.write_str("1 hour"),
            Self::Hours(h) => write!(f, "{h} hours"),
            Self::OverDay => f.write_str(">1 day"),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    /// Unix seconds of the last successful check.
    last_checked: i64,
}

#[derive(Default)]
struct LastCheck {
    status: Option<UpdateStatus>,
    at: Option<OffsetDateTime>,
}

pub struct UpdateChecker {
    remote: RemoteHandle,
    running: Version,
    skip: bool,
    state_file: Option<PathBuf>,
    events: Events,
    last: Mutex<LastCheck>,
}

impl UpdateChecker {
    pub fn new(remote: RemoteHandle, running: Version, events: Events) -> Self {
        Self {
            remote,
            running,
            skip: false,
            state_file: None,
            events,
            last: Mutex::new(LastCheck::default()),
        }
    }

    /// Report newer releases as [`UpdateStatus::Skipped`].
    pub fn with_skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    /// Persist the time of the last successful check in `path`, and pick up
    /// whatever an earlier process recorded there.
    pub async fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<StateFile>(&bytes) {
                Ok(state) => self.last_mut().at = OffsetDateTime::from_unix_timestamp(state.last_checked).ok(),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable update state"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable update state"),
        }
        self.state_file = Some(path);
        self
    }

    fn last_mut(&mut self) -> &mut LastCheck {
        self.last.get_mut().unwrap_or_else(|e| e.into_inner())
    }

    fn last(&self) -> std::sync::MutexGuard<'_, LastCheck> {
        self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn running(&self) -> &Version {
        &self.running
    }

    /// Classification from the last successful check.
    pub fn status(&self) -> Option<UpdateStatus> {
        self.last().status.clone()
    }

    pub fn last_checked(&self) -> Option<OffsetDateTime> {
        self.last().at
    }

    pub fn elapsed(&self, now: OffsetDateTime) -> Elapsed {
        Elapsed::between(self.last_checked(), now)
    }

    /// Fetch the current release and classify it. A failed check leaves the
    /// previous classification and timestamp untouched.
    pub async fn check(&self) -> Result<UpdateStatus> {
        let release = match self.remote.current_release().await {
            Ok(release) => release,
            Err(err) => {
                tracing::warn!(error = ?err, "Update check failed");
                self.events.emit(EngineEvent::UpdateCheckFailed(err.to_string()));
                let kind = ErrorKind::from_remote(&err);
                return Err(err).or_raise(|| kind);
            },
        };
        let status = classify(&self.running, &release, self.skip);
        let now = OffsetDateTime::now_utc();
        {
            let mut last = self.last();
            last.status = Some(status.clone());
            last.at = Some(now);
        }
        tracing::info!(running = %self.running, remote = %release.version, status = %status, "Checked for updates");
        if let Err(err) = self.persist(now).await {
            tracing::warn!(error = ?err, "Failed to record update check");
        }
        self.events.emit(EngineEvent::UpdateChecked(status.clone()));
        Ok(status)
    }

    async fn persist(&self, at: OffsetDateTime) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let state = StateFile {
            last_checked: at.unix_timestamp(),
        };
        let bytes = serde_json::to_vec(&state).or_raise(|| ErrorKind::StateFile(path.clone()))?;
        write_atomic(path, bytes).await.or_raise(|| ErrorKind::StateFile(path.clone()))
    }

    /// Check now and then every `interval` until cancelled.
    pub async fn run_periodic(&self, interval: Duration, cancel: CancellationToken) {
        loop {
            // Failures are logged and reported as events by `check`.
            let _ = self.check().await;
            tokio::select! {
                () = tokio::time::sleep(interval) => {},
                () = cancel.cancelled() => break,
            }
        }
        tracing::info!("Update checker shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahdb_remote::MockSource;
    use ahdb_remote::error::ErrorKind as RemoteErrorKind;
    use rstest::rstest;
    use std::sync::Arc;
    use time::Duration as TimeDuration;

    fn release(version: &str, required: bool) -> ReleaseInfo {
        ReleaseInfo {
            version: Version::parse(version).unwrap(),
            published: 1_700_000_000,
            required,
        }
    }

    #[rstest]
    #[case("1.2.0", "1.3.0", false, false, "available")]
    #[case("1.2.0", "2.0.0", true, false, "required")]
    #[case("1.2.0", "1.2.0", true, false, "up to date")]
    #[case("1.2.0", "1.1.9", true, false, "up to date")]
    #[case("1.2.0", "1.2.0+build.7", false, false, "up to date")]
    #[case("1.2.0-beta", "1.2.0", false, false, "available")]
    #[case("1.2.0", "1.3.0", true, true, "skipped")]
    fn test_classify(
        #[case] running: &str,
        #[case] remote: &str,
        #[case] required: bool,
        #[case] skip: bool,
        #[case] expected: &str,
    ) {
        let status = classify(&Version::parse(running).unwrap(), &release(remote, required), skip);
        let label = match status {
            UpdateStatus::UpToDate => "up to date",
            UpdateStatus::Available(_) => "available",
            UpdateStatus::Required(_) => "required",
            UpdateStatus::Skipped(_) => "skipped",
        };
        assert_eq!(label, expected);
    }

    #[rstest]
    #[case(None, "N/A")]
    #[case(Some(30), "<1 min")]
    #[case(Some(60), "1 minute")]
    #[case(Some(59 * 60), "59 minutes")]
    #[case(Some(60 * 60), "1 hour")]
    #[case(Some(90 * 60), "1 hour")]
    #[case(Some(5 * 3600), "5 hours")]
    #[case(Some(24 * 3600), ">1 day")]
    fn test_elapsed(#[case] ago: Option<i64>, #[case] expected: &str) {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let last = ago.map(|secs| now - TimeDuration::seconds(secs));
        assert_eq!(Elapsed::between(last, now).to_string(), expected);
    }

    #[test]
    fn test_ninety_minutes_is_hours() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(Elapsed::between(Some(now - TimeDuration::minutes(90)), now), Elapsed::Hours(1));
    }

    #[tokio::test]
    async fn test_check_records_status_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        let remote = Arc::new(MockSource::default());
        remote.set_release(release("1.3.0", false));
        let checker = UpdateChecker::new(remote.clone(), Version::new(1, 2, 0), Events::new())
            .with_state_file(&state)
            .await;
        assert_eq!(checker.elapsed(OffsetDateTime::now_utc()), Elapsed::Never);

        let status = checker.check().await.unwrap();
        assert_eq!(status, UpdateStatus::Available(release("1.3.0", false)));
        assert_eq!(checker.status(), Some(status));
        assert_eq!(checker.elapsed(OffsetDateTime::now_utc()), Elapsed::UnderMinute);

        // A new process sees the recorded time but no classification.
        let reloaded = UpdateChecker::new(remote, Version::new(1, 2, 0), Events::new())
            .with_state_file(&state)
            .await;
        assert!(reloaded.last_checked().is_some());
        assert!(reloaded.status().is_none());
    }

    #[tokio::test]
    async fn test_failed_check_keeps_previous_result() {
        let remote = Arc::new(MockSource::default());
        remote.set_release(release("2.0.0", true));
        let checker = UpdateChecker::new(remote.clone(), Version::new(1, 2, 0), Events::new());
        checker.check().await.unwrap();
        let at = checker.last_checked();

        remote.fail_release(RemoteErrorKind::Transient("timeout".into()));
        let err = checker.check().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(checker.status(), Some(UpdateStatus::Required(release("2.0.0", true))));
        assert_eq!(checker.last_checked(), at);
    }

    #[tokio::test]
    async fn test_corrupt_state_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        std::fs::write(&state, b"not json").unwrap();
        let checker = UpdateChecker::new(Arc::new(MockSource::default()), Version::new(1, 0, 0), Events::new())
            .with_state_file(&state)
            .await;
        assert!(checker.last_checked().is_none());
    }
}
