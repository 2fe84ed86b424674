//! Local filesystem storage backend.

use crate::atomic::{map_io_error, write_atomic};
use crate::backend::FileInfoStream;
use crate::error::ErrorKind;
use crate::{FileInfo, StorageBackend, error::Result, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::create_dir_all as sync_create_dir;
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    File(FileInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem storage backend rooted at an absolute directory.
///
/// ```no_run
/// use ahdb_store::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("db", "/home/user/.local/share/ahdb/db").map_err(|e| format!("{e:?}"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    root: PathBuf,
}
impl LocalBackend {
    /// Create a backend for `root`, creating the directory if missing.
    ///
    /// Returns [`InvalidPath`](ErrorKind::InvalidPath) if `root` is relative
    /// or names an existing non-directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Only happens once on startup; not worth an async constructor.
            sync_create_dir(&root).map_err(|e| map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{}` is not within root `{}`", absolute.display(), self.root.display()))
        })?;
        validate_path(relative)
    }

    // Keeps `?` usable; the stream loop below can only yield errors.
    async fn process_entry(&self, entry: DirEntry) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| map_io_error(e, &path))?;
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        if metadata.is_file() {
            return Ok(WalkEntry::File(FileInfo::new(self.relative_path(&path)?, metadata.len())));
        }
        // Broken symlinks and other oddities are ignored.
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream(&self) -> FileInfoStream<'_> {
        let mut stack = vec![self.root.clone()];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // A directory removed mid-walk (pruning) is simply empty.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| map_io_error(e, path))?)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        write_atomic(abs_path, data.to_vec()).await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        fs::remove_file(&abs_path).await.map_err(|e| map_io_error(e, path))?;
        // Leave no empty realm/region directories behind.
        let mut dir = abs_path.parent();
        while let Some(current) = dir
            && current != self.root
        {
            if fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("db", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("db", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("db", "relative/path").is_err());
    }

    #[test]
    fn test_new_rejects_file_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = temp_dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let err = LocalBackend::new("db", &file).err().unwrap();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }

    #[test]
    fn test_path_mapping() {
        let (temp_dir, backend) = backend();
        let abs = temp_dir.path().join("us/stormrage/1.json");
        assert_eq!(backend.absolute_path("us/stormrage/1.json").unwrap(), abs);
        assert_eq!(backend.relative_path(&abs).unwrap(), Path::new("us/stormrage/1.json"));
        assert!(backend.absolute_path("../escape").is_err());
        assert!(backend.relative_path("/elsewhere/1.json").is_err());
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let (_temp_dir, backend) = backend();
        let path = Path::new("us/stormrage/1.json");
        backend.write(path, b"payload").await.unwrap();
        assert!(backend.exists(path).await.unwrap());
        assert_eq!(backend.read(path).await.unwrap(), b"payload");
        backend.delete(path).await.unwrap();
        assert!(!backend.exists(path).await.unwrap());
        let err = backend.delete(path).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_directories() {
        let (temp_dir, backend) = backend();
        backend.write(Path::new("us/stormrage/1.json"), b"a").await.unwrap();
        backend.write(Path::new("us/area-52/1.json"), b"b").await.unwrap();
        backend.delete(Path::new("us/stormrage/1.json")).await.unwrap();
        assert!(!temp_dir.path().join("us/stormrage").exists());
        assert!(temp_dir.path().join("us/area-52").exists());
        assert!(temp_dir.path().exists());
    }

    #[tokio::test]
    async fn test_list_stream_walks_tree() {
        let (_temp_dir, backend) = backend();
        assert!(backend.list_stream().try_collect::<Vec<_>>().await.unwrap().is_empty());
        backend.write(Path::new("us/stormrage/1.json"), b"a").await.unwrap();
        backend.write(Path::new("us/stormrage/2.json.gz"), b"bb").await.unwrap();
        backend.write(Path::new("eu/draenor/1.json"), b"c").await.unwrap();
        backend.write(Path::new("index.json"), b"{}").await.unwrap();

        let mut files: Vec<FileInfo> = backend.list_stream().try_collect().await.unwrap();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            files,
            [
                FileInfo::new("eu/draenor/1.json", 1),
                FileInfo::new("index.json", 2),
                FileInfo::new("us/stormrage/1.json", 1),
                FileInfo::new("us/stormrage/2.json.gz", 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_path_security() {
        let (_temp_dir, backend) = backend();
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.write(Path::new("../etc/passwd"), b"data").await.is_err());
        assert!(backend.delete(Path::new("us/../../file")).await.is_err());
    }
}
