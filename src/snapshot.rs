//! Immutable package snapshot and its fingerprint.
//!
//! A `PackageSnapshot` indexes every file of the package tree once, before
//! any analysis begins. The builder, resolver and tagger only consult the
//! snapshot, never the live tree, so a run is a pure function of the
//! snapshot, the entry set and the policy. The `snapshot_id` is the
//! "dataset version" embedded in every artifact.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::canonical::canonical_hash_hex;
use crate::store::{PackageStore, StoreError};
use crate::types::{CanonicalPath, NodeKind};
use crate::PRUNE_KERNEL_SCHEMA_VERSION;

/// Per-file metadata captured in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Size in bytes.
    pub size: u64,
    /// Classified kind.
    pub kind: NodeKind,
}

/// Deterministic fingerprint of a package tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFingerprint {
    /// Unique identifier (xxh64 of all components).
    pub snapshot_id: String,
    /// Number of files.
    pub file_count: u64,
    /// Total bytes.
    pub total_bytes: u64,
    /// Schema version used for types.
    pub schema_version: String,
    /// Hash of sorted (path, size) pairs.
    pub listing_hash: String,
}

/// Internal struct for computing snapshot_id hash.
#[derive(Serialize)]
struct SnapshotIdInput<'a> {
    file_count: u64,
    total_bytes: u64,
    schema_version: &'a str,
    listing_hash: &'a str,
}

impl SnapshotFingerprint {
    fn compute(files: &BTreeMap<CanonicalPath, FileMeta>) -> Self {
        let listing: Vec<(&str, u64)> = files.iter().map(|(p, m)| (p.as_str(), m.size)).collect();
        let listing_hash = canonical_hash_hex(&listing).unwrap_or_default();
        let file_count = files.len() as u64;
        let total_bytes = files.values().map(|m| m.size).sum();

        let snapshot_id = canonical_hash_hex(&SnapshotIdInput {
            file_count,
            total_bytes,
            schema_version: PRUNE_KERNEL_SCHEMA_VERSION,
            listing_hash: &listing_hash,
        })
        .unwrap_or_default();

        Self {
            snapshot_id,
            file_count,
            total_bytes,
            schema_version: PRUNE_KERNEL_SCHEMA_VERSION.to_string(),
            listing_hash,
        }
    }
}

/// Read-only index over a package tree.
#[derive(Clone)]
pub struct PackageSnapshot {
    store: Arc<dyn PackageStore>,
    files: BTreeMap<CanonicalPath, FileMeta>,
    dirs: BTreeSet<String>,
    by_name: BTreeMap<String, Vec<CanonicalPath>>,
    fingerprint: SnapshotFingerprint,
}

impl std::fmt::Debug for PackageSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageSnapshot")
            .field("store", &self.store.describe())
            .field("files", &self.files.len())
            .field("snapshot_id", &self.fingerprint.snapshot_id)
            .finish()
    }
}

impl PackageSnapshot {
    /// Capture a snapshot of the store's current contents.
    pub fn capture(store: Arc<dyn PackageStore>) -> Result<Self, StoreError> {
        let listing = store.list_files()?;
        let files: BTreeMap<CanonicalPath, FileMeta> = listing
            .into_iter()
            .map(|entry| {
                let kind = NodeKind::classify(&entry.path);
                (entry.path, FileMeta { size: entry.size, kind })
            })
            .collect();

        let snapshot = Self::index(store, files);
        tracing::info!(
            store = %snapshot.store.describe(),
            files = snapshot.fingerprint.file_count,
            bytes = snapshot.fingerprint.total_bytes,
            snapshot_id = %snapshot.fingerprint.snapshot_id,
            "Captured package snapshot"
        );
        Ok(snapshot)
    }

    fn index(store: Arc<dyn PackageStore>, files: BTreeMap<CanonicalPath, FileMeta>) -> Self {
        let mut dirs = BTreeSet::new();
        let mut by_name: BTreeMap<String, Vec<CanonicalPath>> = BTreeMap::new();
        for path in files.keys() {
            for ancestor in path.ancestors() {
                if !dirs.insert(ancestor.to_string()) {
                    break;
                }
            }
            by_name
                .entry(path.file_name().to_string())
                .or_default()
                .push(path.clone());
        }
        let fingerprint = SnapshotFingerprint::compute(&files);
        Self {
            store,
            files,
            dirs,
            by_name,
            fingerprint,
        }
    }

    /// A copy of this snapshot that also lists `extra` files.
    ///
    /// The patcher resolves aggregator imports against the pre-deletion
    /// layout; extra files keep their kind but have size 0.
    pub fn with_extra_files<'a>(&self, extra: impl IntoIterator<Item = &'a CanonicalPath>) -> Self {
        let mut files = self.files.clone();
        for path in extra {
            files.entry(path.clone()).or_insert_with(|| FileMeta {
                size: 0,
                kind: NodeKind::classify(path),
            });
        }
        Self::index(Arc::clone(&self.store), files)
    }

    /// Snapshot fingerprint.
    pub fn fingerprint(&self) -> &SnapshotFingerprint {
        &self.fingerprint
    }

    /// Snapshot id shorthand.
    pub fn snapshot_id(&self) -> &str {
        &self.fingerprint.snapshot_id
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn PackageStore> {
        &self.store
    }

    /// Whether `path` is a file in the snapshot.
    pub fn contains(&self, path: &CanonicalPath) -> bool {
        self.files.contains_key(path)
    }

    /// Metadata for a file.
    pub fn meta(&self, path: &CanonicalPath) -> Option<FileMeta> {
        self.files.get(path).copied()
    }

    /// Whether `dir` is a directory containing at least one file.
    pub fn is_dir(&self, dir: &str) -> bool {
        dir.is_empty() || self.dirs.contains(dir)
    }

    /// All files, in canonical order.
    pub fn files(&self) -> impl Iterator<Item = (&CanonicalPath, &FileMeta)> {
        self.files.iter()
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the snapshot has no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files directly inside `dir`, in canonical order.
    pub fn files_in_dir<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = &'a CanonicalPath> + 'a {
        self.files_under(dir).filter(move |p| p.parent() == dir)
    }

    /// Files anywhere below `dir`, in canonical order.
    pub fn files_under<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = &'a CanonicalPath> + 'a {
        let start = CanonicalPath::new(if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        });
        self.files
            .range(start..)
            .map(|(p, _)| p)
            .take_while(move |p| dir.is_empty() || p.is_under(dir))
    }

    /// Files whose name is exactly `name`.
    pub fn files_named(&self, name: &str) -> &[CanonicalPath] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Read a file's text through the backing store.
    pub fn read_text(&self, path: &CanonicalPath) -> Result<Option<String>, StoreError> {
        self.store.read_text(path)
    }

    /// Read a file's bytes through the backing store.
    pub fn read_bytes(&self, path: &CanonicalPath) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.read_bytes(path)
    }

    /// Total bytes across all files.
    pub fn total_bytes(&self) -> u64 {
        self.fingerprint.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPackageStore;

    fn sample() -> PackageSnapshot {
        let store = InMemoryPackageStore::new()
            .with_file("pkg/__init__.py", "")
            .with_file("pkg/a.py", "import os\n")
            .with_file("pkg/sub/b.py", "")
            .with_file("pkg2/c.py", "")
            .with_file("top.pth", "pkg\n");
        PackageSnapshot::capture(Arc::new(store)).unwrap()
    }

    #[test]
    fn test_snapshot_determinism() {
        let a = sample();
        let b = sample();
        assert_eq!(a.snapshot_id(), b.snapshot_id());
        assert_eq!(a.fingerprint().file_count, 5);
        assert_eq!(a.total_bytes(), 14);
    }

    #[test]
    fn test_snapshot_differs_on_change() {
        let a = sample();
        let store = InMemoryPackageStore::new().with_file("pkg/__init__.py", "");
        let b = PackageSnapshot::capture(Arc::new(store)).unwrap();
        assert_ne!(a.snapshot_id(), b.snapshot_id());
    }

    #[test]
    fn test_directory_queries() {
        let snap = sample();
        assert!(snap.is_dir("pkg"));
        assert!(snap.is_dir("pkg/sub"));
        assert!(!snap.is_dir("pk"));

        let direct: Vec<_> = snap.files_in_dir("pkg").map(|p| p.as_str()).collect();
        assert_eq!(direct, vec!["pkg/__init__.py", "pkg/a.py"]);

        let under: Vec<_> = snap.files_under("pkg").map(|p| p.as_str()).collect();
        assert_eq!(under, vec!["pkg/__init__.py", "pkg/a.py", "pkg/sub/b.py"]);

        let root: Vec<_> = snap.files_in_dir("").map(|p| p.as_str()).collect();
        assert_eq!(root, vec!["top.pth"]);
    }

    #[test]
    fn test_with_extra_files() {
        let snap = sample();
        let extra = CanonicalPath::new("pkg/gone.py");
        let widened = snap.with_extra_files([&extra]);
        assert!(widened.contains(&extra));
        assert!(!snap.contains(&extra));
        assert_eq!(widened.meta(&extra).map(|m| m.kind), Some(NodeKind::Source));
    }

    #[test]
    fn test_files_named() {
        let snap = sample();
        assert_eq!(snap.files_named("a.py").len(), 1);
        assert!(snap.files_named("zzz").is_empty());
    }
}
