//! Exclusively locked package root.
//!
//! Every mutation of the package tree (pruning, patching, restoring) goes
//! through a [`LockedRoot`]. The lock is an `fs2` advisory lock on
//! `.prune-kernel.lock` inside the root; a held lock fails immediately.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::store::LOCK_FILE_NAME;
use crate::types::{CanonicalPath, Incident, IncidentKind};

/// Errors acquiring or using the root lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process (or handle) holds the lock.
    #[error("package root is locked by another run: {0}")]
    Held(PathBuf),

    /// The root is not a directory.
    #[error("package root not found: {0}")]
    RootNotFound(PathBuf),

    /// I/O failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LockError + '_ {
    move |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Handle to a package root held under an exclusive lock.
///
/// Released on drop.
#[derive(Debug)]
pub struct LockedRoot {
    root: PathBuf,
    lock_path: PathBuf,
    file: File,
}

impl LockedRoot {
    /// Take the exclusive lock on `root`.
    pub fn acquire(root: impl Into<PathBuf>) -> Result<Self, LockError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(LockError::RootNotFound(root));
        }
        let lock_path = root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;

        if file.try_lock_exclusive().is_err() {
            Incident::record(
                IncidentKind::ConcurrentMutation {
                    lock_path: lock_path.display().to_string(),
                },
                "root_lock",
            );
            return Err(LockError::Held(lock_path));
        }
        tracing::debug!(root = %root.display(), "Acquired package root lock");
        Ok(Self { root, lock_path, file })
    }

    /// Root directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Lock file location.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Absolute location of a root-relative path.
    pub fn resolve(&self, path: &CanonicalPath) -> PathBuf {
        self.root.join(path.as_str())
    }

    /// Replace a file's content atomically (temp file, fsync, rename).
    pub fn write_atomic(&self, path: &CanonicalPath, bytes: &[u8]) -> Result<(), LockError> {
        let target = self.resolve(path);
        let parent = target.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).map_err(io_err(&parent))?;
        let tmp = parent.join(format!(".{}.tmp-{}", path.file_name(), std::process::id()));
        {
            let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
            file.write_all(bytes).map_err(io_err(&tmp))?;
            file.sync_all().map_err(io_err(&tmp))?;
        }
        fs::rename(&tmp, &target).map_err(io_err(&target))?;
        Ok(())
    }

    /// Read a file; `Ok(None)` if it does not exist.
    pub fn read(&self, path: &CanonicalPath) -> Result<Option<Vec<u8>>, LockError> {
        let target = self.resolve(path);
        match fs::read(&target) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LockError::Io { path: target, source }),
        }
    }

    /// Whether a root-relative path exists.
    pub fn exists(&self, path: &CanonicalPath) -> bool {
        self.resolve(path).exists()
    }

    /// Rename within the root.
    pub fn rename(&self, from: &CanonicalPath, to: &CanonicalPath) -> Result<(), LockError> {
        let src = self.resolve(from);
        let dst = self.resolve(to);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::rename(&src, &dst).map_err(io_err(&src))
    }

    /// Remove a file.
    pub fn remove(&self, path: &CanonicalPath) -> Result<(), LockError> {
        let target = self.resolve(path);
        fs::remove_file(&target).map_err(io_err(&target))
    }

    /// Remove `dir` and its now-empty ancestors (never the root itself).
    /// Returns the directories removed.
    pub fn remove_empty_dirs(&self, dir: &str) -> Vec<String> {
        let mut removed = Vec::new();
        let mut current = CanonicalPath::new(dir);
        while !current.as_str().is_empty() {
            let abs = self.resolve(&current);
            let empty = fs::read_dir(&abs)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if !empty || fs::remove_dir(&abs).is_err() {
                break;
            }
            removed.push(current.to_string());
            current = CanonicalPath::new(current.parent());
        }
        removed
    }
}

impl Drop for LockedRoot {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let first = LockedRoot::acquire(dir.path()).unwrap();
        let second = LockedRoot::acquire(dir.path());
        assert!(matches!(second, Err(LockError::Held(_))));
        drop(first);
        assert!(LockedRoot::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = LockedRoot::acquire(dir.path()).unwrap();
        let path = CanonicalPath::new("pkg/__init__.py");
        root.write_atomic(&path, b"first\n").unwrap();
        root.write_atomic(&path, b"second\n").unwrap();
        assert_eq!(root.read(&path).unwrap().as_deref(), Some(&b"second\n"[..]));

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("pkg"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_remove_empty_dirs_stops_at_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::write(dir.path().join("a/keep.py"), "").unwrap();
        let root = LockedRoot::acquire(dir.path()).unwrap();
        let removed = root.remove_empty_dirs("a/b/c");
        assert_eq!(removed, vec!["a/b/c".to_string(), "a/b".to_string()]);
        assert!(dir.path().join("a").is_dir());
    }

    #[test]
    fn test_missing_root() {
        assert!(matches!(
            LockedRoot::acquire("/no/such/root"),
            Err(LockError::RootNotFound(_))
        ));
    }
}
