//! Path validation for store-relative paths.

use crate::error::{ErrorKind, Result};
use std::path::{Component, Path, PathBuf};

/// Temporary files are written with this prefix and renamed into place.
pub(crate) const TEMP_PREFIX: &str = ".tmp";

/// Validates a store-relative path and returns its normalized form.
///
/// Paths may not escape the store root through `..`, contain NUL bytes, or
/// carry a platform prefix. `.` components and repeated separators are
/// dropped.
///
/// ```
/// use std::path::Path;
/// use ahdb_store::validate_path;
///
/// assert!(validate_path("us/stormrage/1700000000.json.gz").is_ok());
/// assert!(validate_path("../index.json").is_err());
/// assert_eq!(validate_path("us//./eu/../stormrage").unwrap(), Path::new("us/stormrage"));
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let invalid = || ErrorKind::InvalidPath(original.to_path_buf());
    let mut components = Vec::new();
    for component in original.components() {
        match component {
            Component::Normal(s) => {
                // NUL survives Path::components() on Unix but truncates in syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(invalid());
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(invalid()),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(invalid());
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(invalid()),
        false => Ok(components.into_iter().collect()),
    }
}

/// Whether the final component names a temporary file left by an atomic write.
pub(crate) fn is_temporary(path: &Path) -> bool {
    path.file_name().and_then(|name| name.to_str()).is_some_and(|name| name.starts_with(TEMP_PREFIX))
}
