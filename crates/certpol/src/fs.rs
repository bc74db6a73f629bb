//! File sink: everything certpol does to the filesystem goes through here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use certpol_core::FilesystemError;
use chrono::Utc;
use rand_core::{OsRng, RngCore};
use tracing::debug;

/// Result of a file sink operation
pub type FsResult<T> = std::result::Result<T, FilesystemError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FilesystemError + '_ {
    move |source| FilesystemError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Filesystem operations used by issuance
#[async_trait]
pub trait FileSink: Send + Sync {
    /// Whether something exists at `path`. A dangling symlink counts.
    async fn exists(&self, path: &Path) -> bool;

    /// Whether `path` itself is a symlink
    async fn is_symlink(&self, path: &Path) -> bool;

    async fn read(&self, path: &Path) -> FsResult<Vec<u8>>;

    /// Replace `path` with `contents` so that readers see either the old or
    /// the new file, never a partial one. Missing parent directories are
    /// created.
    async fn write_atomic(&self, path: &Path, contents: &[u8], mode: u32) -> FsResult<()>;

    /// Copy the current file aside before it is replaced. Returns the
    /// backup path, or `None` when there was nothing to back up.
    async fn backup(&self, path: &Path) -> FsResult<Option<PathBuf>>;
}

/// The local filesystem, through tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl LocalFs {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{:016x}.tmp", OsRng.next_u64()))
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl FileSink for LocalFs {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::symlink_metadata(path).await.is_ok()
    }

    async fn is_symlink(&self, path: &Path) -> bool {
        tokio::fs::symlink_metadata(path)
            .await
            .is_ok_and(|m| m.file_type().is_symlink())
    }

    async fn read(&self, path: &Path) -> FsResult<Vec<u8>> {
        tokio::fs::read(path).await.map_err(io_err(path))
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8], mode: u32) -> FsResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let tmp = temp_path(path);
        let written = async {
            tokio::fs::write(&tmp, contents).await?;
            set_mode(&tmp, mode).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(path)(e));
        }
        debug!(path = %path.display(), bytes = contents.len(), mode = format!("{mode:o}"), "Wrote file");
        Ok(())
    }

    async fn backup(&self, path: &Path) -> FsResult<Option<PathBuf>> {
        if tokio::fs::metadata(path).await.is_err() {
            return Ok(None);
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stamp = Utc::now().format("%Y%m%d%H%M%S%6f");
        let target = path.with_file_name(format!("{name}.{stamp}.bak"));
        tokio::fs::copy(path, &target).await.map_err(io_err(path))?;
        debug!(path = %path.display(), backup = %target.display(), "Backed up file");
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/cert.pem");
        let fs = LocalFs::new();
        assert!(!fs.exists(&path).await);

        fs.write_atomic(&path, b"first", 0o600).await.unwrap();
        fs.write_atomic(&path, b"second", 0o644).await.unwrap();
        assert_eq!(fs.read(&path).await.unwrap(), b"second");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }

        // no temp files left behind
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        let fs = LocalFs::new();
        assert_eq!(fs.backup(&path).await.unwrap(), None);

        std::fs::write(&path, b"old").unwrap();
        let backup = fs.backup(&path).await.unwrap().unwrap();
        assert_eq!(std::fs::read(&backup).unwrap(), b"old");
        assert!(backup.to_string_lossy().ends_with(".bak"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_detection() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real.pem");
        let link = dir.path().join("link.pem");
        std::fs::write(&target, b"x").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let fs = LocalFs::new();
        assert!(fs.is_symlink(&link).await);
        assert!(!fs.is_symlink(&target).await);
        assert_eq!(fs.read(&link).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_read_missing_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalFs::new().read(&dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, FilesystemError::Io { .. }));
    }
}
