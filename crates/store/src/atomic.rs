//! Write-to-temp-then-rename.
//!
//! Readers either see the previous file or the complete new one; a crash
//! mid-write leaves at most a `.tmp*` sibling behind, which
//! [`SnapshotStore::open`](crate::SnapshotStore::open) cleans up.

use crate::error::{ErrorKind, Result};
use crate::path::TEMP_PREFIX;
use exn::ResultExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::Builder;

/// Atomically replace `path` with `data`, creating parent directories.
pub async fn write_atomic(path: impl Into<PathBuf>, data: Vec<u8>) -> Result<()> {
    let path = path.into();
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()).map(Path::to_path_buf) else {
        exn::bail!(ErrorKind::InvalidPath(path));
    };
    tokio::fs::create_dir_all(&parent).await.map_err(|e| map_io_error(e, &parent))?;
    tokio::task::spawn_blocking(move || persist(&parent, &path, &data))
        .await
        .or_raise(|| ErrorKind::BackendError("atomic write task panicked".to_string()))?
}

fn persist(parent: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut temp = Builder::new().prefix(TEMP_PREFIX).tempfile_in(parent).map_err(|e| map_io_error(e, parent))?;
    temp.write_all(data).map_err(|e| map_io_error(e, temp.path()))?;
    temp.as_file().sync_all().map_err(|e| map_io_error(e, temp.path()))?;
    temp.persist(path).map_err(|e| map_io_error(e.error, path))?;
    Ok(())
}

pub(crate) fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
    match e.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
        _ => ErrorKind::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/AppData.lua");
        write_atomic(&target, b"first".to_vec()).await.unwrap();
        write_atomic(&target, b"second".to_vec()).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        // No temporary files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested")).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_write_atomic_requires_parent() {
        let err = write_atomic("AppData.lua", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }
}
