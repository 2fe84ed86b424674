//! Read-only access to the published auction snapshot repository.
//!
//! The [`RemoteSource`] trait is what the sync engine talks to. The
//! production implementation is [`GithubSource`]; [`MockSource`] (behind the
//! `mock` feature) serves tests.

pub mod error;
mod github;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod models;
mod source;

pub use crate::github::{
    DEFAULT_BRANCH, DEFAULT_REPO, GithubOptions, GithubSource, RepoRef, RetryPolicy, validate_proxy,
};
#[cfg(any(test, feature = "mock"))]
pub use crate::mock::MockSource;
pub use crate::models::{ReleaseInfo, RemoteEntry, parse_version};
pub use crate::source::{RemoteHandle, RemoteSource};
