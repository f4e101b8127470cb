//! Crash-safe file replacement: write to a temporary file, fsync, then
//! rename over the target.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A file being written that replaces `path` only on [`AtomicFile::commit`].
///
/// Dropping an uncommitted file removes the temporary copy and leaves the
/// target untouched.
#[derive(Debug)]
pub struct AtomicFile {
    path: PathBuf,
    tmp_path: PathBuf,
    backup_dir: Option<PathBuf>,
    file: Option<File>,
}

impl AtomicFile {
    /// Start writing a replacement for `path`. The temporary file lives in
    /// `tmp_dir` (or next to the target) and must be on the same
    /// filesystem for the rename to be atomic.
    pub fn create(path: &Path, tmp_dir: Option<&Path>, backup_dir: Option<&Path>) -> io::Result<Self> {
        let file_name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
            .to_string_lossy()
            .into_owned();
        let dir = match tmp_dir {
            Some(dir) => dir.to_path_buf(),
            None => path.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(&dir)?;
        }
        let tmp_path = dir.join(format!(".{file_name}.{}.tmp", std::process::id()));
        let file = File::create(&tmp_path)?;
        Ok(Self {
            path: path.to_path_buf(),
            tmp_path,
            backup_dir: backup_dir.map(Path::to_path_buf),
            file: Some(file),
        })
    }

    /// Flush, fsync and rename over the target. If a backup directory was
    /// given, the previous version is copied there first.
    pub fn commit(mut self) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()?;
        file.sync_all()?;
        drop(file);

        if let Some(backup_dir) = &self.backup_dir
            && self.path.exists()
        {
            fs::create_dir_all(backup_dir)?;
            let name = self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
            fs::copy(&self.path, backup_dir.join(format!("{name}.{stamp}")))?;
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.tmp_path, &self.path)
    }

    /// Abandon the write.
    pub fn rollback(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.write(buf),
            None => Err(io::Error::other("atomic file already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        self.discard();
    }
}

/// Replace `path` with `contents` atomically.
pub fn write_atomic(
    path: &Path,
    contents: &[u8],
    tmp_dir: Option<&Path>,
    backup_dir: Option<&Path>,
) -> io::Result<()> {
    let mut file = AtomicFile::create(path, tmp_dir, backup_dir)?;
    file.write_all(contents)?;
    file.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.conf");
        fs::write(&path, "old").unwrap();
        write_atomic(&path, b"new", None, None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn drop_without_commit_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.conf");
        fs::write(&path, "old").unwrap();
        {
            let mut f = AtomicFile::create(&path, None, None).unwrap();
            f.write_all(b"half-written").unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "old");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn backup_copies_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("perch.conf");
        let tmp = dir.path().join("tmp");
        let backup = dir.path().join("backup");
        write_atomic(&path, b"v1", Some(&tmp), Some(&backup)).unwrap();
        write_atomic(&path, b"v2", Some(&tmp), Some(&backup)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "v2");
        let backups: Vec<_> = fs::read_dir(&backup).unwrap().flatten().collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read_to_string(backups[0].path()).unwrap(), "v1");
    }
}
