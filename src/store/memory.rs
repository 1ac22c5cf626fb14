//! In-memory package store for testing.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

use super::{FileEntry, PackageStore, StoreError};
use crate::types::CanonicalPath;

/// In-memory package tree.
///
/// Uses BTreeMap for deterministic iteration order. Files can be removed
/// after a snapshot was captured to simulate a tree changing underneath the
/// builder.
#[derive(Debug, Default)]
pub struct InMemoryPackageStore {
    files: RwLock<BTreeMap<CanonicalPath, Vec<u8>>>,
    /// Listed but unreadable.
    phantoms: RwLock<BTreeSet<CanonicalPath>>,
}

impl InMemoryPackageStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with_file(self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.add_file(path, content);
        self
    }

    /// Add or replace a file.
    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.files.write().insert(CanonicalPath::new(path), content.into());
    }

    /// Remove a file's content while keeping it listed.
    pub fn vanish(&self, path: &str) {
        let path = CanonicalPath::new(path);
        self.files.write().remove(&path);
        self.phantoms.write().insert(path);
    }

    /// Remove a file entirely.
    pub fn remove_file(&self, path: &str) {
        let path = CanonicalPath::new(path);
        self.files.write().remove(&path);
        self.phantoms.write().remove(&path);
    }

    /// Number of readable files.
    pub fn num_files(&self) -> usize {
        self.files.read().len()
    }
}

impl PackageStore for InMemoryPackageStore {
    fn list_files(&self) -> Result<Vec<FileEntry>, StoreError> {
        let files = self.files.read();
        let phantoms = self.phantoms.read();
        let mut out: Vec<FileEntry> = files
            .iter()
            .map(|(path, bytes)| FileEntry {
                path: path.clone(),
                size: bytes.len() as u64,
            })
            .chain(phantoms.iter().map(|path| FileEntry {
                path: path.clone(),
                size: 0,
            }))
            .collect();
        out.sort();
        Ok(out)
    }

    fn read_bytes(&self, path: &CanonicalPath) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.files.read().get(path).cloned())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
