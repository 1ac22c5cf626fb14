//! File-system package store.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{is_bookkeeping, FileEntry, PackageStore, StoreError};
use crate::types::CanonicalPath;

/// Package tree on disk.
#[derive(Debug, Clone)]
pub struct FsPackageStore {
    root: PathBuf,
}

impl FsPackageStore {
    /// Open a package root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StoreError::RootNotFound(root.display().to_string()));
        }
        Ok(Self { root })
    }

    /// Package root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a canonical path.
    pub fn absolute(&self, path: &CanonicalPath) -> PathBuf {
        if path.is_external() {
            PathBuf::from(path.as_str())
        } else {
            self.root.join(path.as_str())
        }
    }

    fn relative(&self, abs: &Path) -> Option<CanonicalPath> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        Some(CanonicalPath::new(rel.to_string_lossy()))
    }
}

impl PackageStore for FsPackageStore {
    fn list_files(&self) -> Result<Vec<FileEntry>, StoreError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if is_bookkeeping(&name) {
                continue;
            }
            let Some(path) = self.relative(entry.path()) else {
                continue;
            };
            let size = entry.metadata()?.len();
            files.push(FileEntry { path, size });
        }
        files.sort();
        Ok(files)
    }

    fn read_bytes(&self, path: &CanonicalPath) -> Result<Option<Vec<u8>>, StoreError> {
        let abs = self.absolute(path);
        match std::fs::read(&abs) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: abs.display().to_string(),
                source,
            }),
        }
    }

    fn root_dir(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}
