//! Package storage backends.
//!
//! The builder only ever sees a package tree through a [`PackageStore`]:
//! the file-system backend for real runs and the in-memory backend for
//! tests and benches.

pub mod fs;
pub mod memory;

use std::path::Path;
use thiserror::Error;

use crate::types::CanonicalPath;

/// Name of the advisory lock file kept in the package root.
pub const LOCK_FILE_NAME: &str = ".prune-kernel.lock";

/// Prefix of quarantined files.
pub const QUARANTINE_PREFIX: &str = "__DELETED_";

/// Prefix of pre-patch aggregator backups.
pub const BACKUP_PREFIX: &str = "__INITIAL_";

/// One file listed by a store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileEntry {
    /// Root-relative canonical path.
    pub path: CanonicalPath,
    /// Size in bytes.
    pub size: u64,
}

/// Errors from storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The package root does not exist or is not a directory.
    #[error("package root not found: {0}")]
    RootNotFound(String),

    /// I/O failure on a specific path.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Directory walk failure.
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Trait for package storage backends.
///
/// Implementations must list files in canonical path order and must be
/// safe to share between threads; the batch analyzer runs one builder per
/// entry against the same store.
pub trait PackageStore: Send + Sync {
    /// List every file of the package tree (bookkeeping files excluded).
    fn list_files(&self) -> Result<Vec<FileEntry>, StoreError>;

    /// Read raw bytes. `Ok(None)` if the file no longer exists.
    fn read_bytes(&self, path: &CanonicalPath) -> Result<Option<Vec<u8>>, StoreError>;

    /// Read a file as text (lossy UTF-8). `Ok(None)` if it no longer exists.
    fn read_text(&self, path: &CanonicalPath) -> Result<Option<String>, StoreError> {
        Ok(self
            .read_bytes(path)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Human-readable location, used in logs and artifacts.
    fn describe(&self) -> String;

    /// Directory the tree lives in, for stores backed by the file system.
    fn root_dir(&self) -> Option<&Path> {
        None
    }
}

/// Whether a file name is engine bookkeeping rather than package content.
pub fn is_bookkeeping(file_name: &str) -> bool {
    file_name == LOCK_FILE_NAME
        || file_name.starts_with(QUARANTINE_PREFIX)
        || file_name.starts_with(BACKUP_PREFIX)
        || file_name.contains(".tmp-")
}

pub use fs::FsPackageStore;
pub use memory::InMemoryPackageStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bookkeeping_names() {
        assert!(is_bookkeeping(".prune-kernel.lock"));
        assert!(is_bookkeeping("__DELETED_x.py"));
        assert!(is_bookkeeping("__INITIAL___init__.py"));
        assert!(is_bookkeeping(".__init__.py.tmp-4242"));
        assert!(!is_bookkeeping("__init__.py"));
        assert!(!is_bookkeeping("deleted.py"));
    }
}
