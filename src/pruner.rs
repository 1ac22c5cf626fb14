//! Deletion planning, commit and restore.
//!
//! ## Deletion Units
//!
//! A compiled extension, its stub and every same-stem non-source sibling in
//! its directory form one unit: the unit is kept if any member is kept.
//! Enclosing `__init__.py` files of kept files and bytecode of kept sources
//! are kept as well. The rules are applied until nothing changes.
//!
//! ## Commit
//!
//! Every planned file is first renamed to `__DELETED_<name>` in place. If any
//! rename fails, the renamed files are moved back and the commit fails. In
//! `Delete` mode the quarantined files are removed afterwards, together with
//! directories left empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

use crate::canonical::sha256_hex;
use crate::policy::{DeletionMode, PrunePolicy};
use crate::root::{LockError, LockedRoot};
use crate::snapshot::PackageSnapshot;
use crate::store::QUARANTINE_PREFIX;
use crate::types::{CanonicalPath, Confidence, Incident, NodeKind, Tag, TagReason, TagSet};

/// Error type for prune operations.
#[derive(Debug, Error)]
pub enum PruneError {
    /// Root lock or file system failure.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// A rename failed and the batch was rolled back.
    #[error("commit of {path} failed, {rolled_back} renames rolled back: {source}")]
    RolledBack {
        /// File whose rename failed.
        path: String,
        /// Renames undone.
        rolled_back: usize,
        /// Underlying failure.
        source: LockError,
    },

    /// A quarantined file no longer matches its recorded digest.
    #[error("content of {path} changed since it was pruned (expected {expected}, found {actual})")]
    Integrity {
        /// Original path.
        path: String,
        /// Recorded digest.
        expected: String,
        /// Digest found.
        actual: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Planning
// ─────────────────────────────────────────────────────────────────────────────

/// One file the plan would delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedDeletion {
    /// File path.
    pub path: CanonicalPath,
    /// Size in bytes.
    pub size: u64,
    /// File kind.
    pub kind: NodeKind,
    /// Why the file is unreachable.
    pub reason: TagReason,
}

/// Per-file line of the impact report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileImpact {
    /// File path.
    pub path: CanonicalPath,
    /// Tag after keep rules.
    pub tag: Tag,
    /// Confidence for reachable files.
    pub confidence: Option<Confidence>,
    /// Size in bytes.
    pub size: u64,
    /// Whether the plan deletes it.
    pub deleted: bool,
}

/// Dry-run impact report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    /// Snapshot the report describes.
    pub snapshot_id: String,
    /// Policy hash used.
    pub policy_hash: String,
    /// Files in the snapshot.
    pub total_files: usize,
    /// Bytes in the snapshot.
    pub total_bytes: u64,
    /// Files the plan deletes.
    pub removed_files: usize,
    /// Bytes the plan deletes.
    pub removed_bytes: u64,
    /// `removed_bytes` as a percentage of `total_bytes`.
    pub removed_percent: f64,
    /// Ambiguous files (always kept).
    pub ambiguous: Vec<CanonicalPath>,
    /// Unreachable files kept by protection, scope or unit rules.
    pub retained: Vec<CanonicalPath>,
    /// Every file.
    pub files: Vec<FileImpact>,
    /// Incidents raised while building the graph.
    pub incidents: Vec<Incident>,
}

/// A deletion plan and its impact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrunePlan {
    /// Files to delete, in path order.
    pub deletions: Vec<PlannedDeletion>,
    /// Impact report.
    pub report: ImpactReport,
}

/// Plans and commits deletions for one snapshot.
#[derive(Debug, Clone)]
pub struct Pruner {
    snapshot: Arc<PackageSnapshot>,
    policy: PrunePolicy,
}

impl Pruner {
    /// Create a pruner.
    pub fn new(snapshot: Arc<PackageSnapshot>, policy: PrunePolicy) -> Self {
        Self { snapshot, policy }
    }

    /// Whether a file is never deleted regardless of its tag.
    pub fn is_protected(&self, path: &CanonicalPath) -> bool {
        if path.is_external() {
            return true;
        }
        let metadata_dir = path
            .ancestors()
            .any(|dir| dir.ends_with(".dist-info") || dir.ends_with(".egg-info"));
        let top_pth = path.parent().is_empty() && path.extension() == Some("pth");
        metadata_dir || top_pth || self.policy.is_protected_prefix(path.as_str())
    }

    /// Plan deletions from a tag set without touching the file system.
    pub fn plan(&self, tags: &TagSet, incidents: &[Incident]) -> PrunePlan {
        let mut kept: BTreeSet<CanonicalPath> = BTreeSet::new();
        let mut retained: BTreeSet<CanonicalPath> = BTreeSet::new();
        for (path, _) in self.snapshot.files() {
            let tag = tags.tag(path);
            if tag.is_kept() {
                kept.insert(path.clone());
            } else if self.is_protected(path) || !self.policy.in_scope(path.top_level()) {
                kept.insert(path.clone());
                retained.insert(path.clone());
            }
        }

        let units = self.deletion_units();
        loop {
            let mut additions: Vec<CanonicalPath> = Vec::new();
            for members in &units {
                if members.iter().any(|m| kept.contains(m)) {
                    additions.extend(members.iter().filter(|m| !kept.contains(*m)).cloned());
                }
            }
            for path in &kept {
                for dir in path.ancestors() {
                    let init = CanonicalPath::join(dir, "__init__.py");
                    if self.snapshot.contains(&init) && !kept.contains(&init) {
                        additions.push(init);
                    }
                }
                if path.extension() == Some("py") {
                    let cache = if path.parent().is_empty() {
                        "__pycache__".to_string()
                    } else {
                        format!("{}/__pycache__", path.parent())
                    };
                    additions.extend(
                        self.snapshot
                            .files_in_dir(&cache)
                            .filter(|p| p.stem() == path.stem() && !kept.contains(*p))
                            .cloned(),
                    );
                }
            }
            if additions.is_empty() {
                break;
            }
            for path in additions {
                if tags.tag(&path) == Tag::Unreachable {
                    retained.insert(path.clone());
                }
                kept.insert(path);
            }
        }

        let mut deletions = Vec::new();
        let mut files = Vec::with_capacity(self.snapshot.len());
        let mut ambiguous = Vec::new();
        for (path, meta) in self.snapshot.files() {
            let entry = tags.get(path);
            let tag = tags.tag(path);
            let deleted = !kept.contains(path);
            if tag == Tag::Ambiguous {
                ambiguous.push(path.clone());
            }
            if deleted {
                deletions.push(PlannedDeletion {
                    path: path.clone(),
                    size: meta.size,
                    kind: meta.kind,
                    reason: entry.map(|e| e.reason.clone()).unwrap_or(TagReason::NotReached),
                });
            }
            files.push(FileImpact {
                path: path.clone(),
                tag,
                confidence: entry.and_then(|e| e.confidence),
                size: meta.size,
                deleted,
            });
        }

        let total_bytes = self.snapshot.total_bytes();
        let removed_bytes: u64 = deletions.iter().map(|d| d.size).sum();
        let removed_percent = if total_bytes == 0 {
            0.0
        } else {
            removed_bytes as f64 * 100.0 / total_bytes as f64
        };
        let report = ImpactReport {
            snapshot_id: self.snapshot.snapshot_id().to_string(),
            policy_hash: self.policy.params_hash(),
            total_files: self.snapshot.len(),
            total_bytes,
            removed_files: deletions.len(),
            removed_bytes,
            removed_percent,
            ambiguous,
            retained: retained.into_iter().collect(),
            files,
            incidents: incidents.to_vec(),
        };
        tracing::info!(
            removed_files = report.removed_files,
            removed_bytes = report.removed_bytes,
            removed_percent = report.removed_percent,
            ambiguous = report.ambiguous.len(),
            "Planned prune"
        );
        PrunePlan { deletions, report }
    }

    /// Members of every compiled unit, keyed by (directory, stem).
    fn deletion_units(&self) -> Vec<Vec<CanonicalPath>> {
        let mut leaders: BTreeSet<(String, String)> = BTreeSet::new();
        for (path, meta) in self.snapshot.files() {
            if meta.kind == NodeKind::CompiledExtension || path.extension() == Some("pyi") {
                leaders.insert((path.parent().to_string(), path.stem().to_string()));
            }
        }
        let mut units: BTreeMap<(String, String), Vec<CanonicalPath>> = BTreeMap::new();
        for (dir, stem) in leaders {
            let members: Vec<CanonicalPath> = self
                .snapshot
                .files_in_dir(&dir)
                .filter(|p| p.stem() == stem)
                .filter(|p| {
                    self.snapshot
                        .meta(p)
                        .map(|m| !m.kind.is_python_source())
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            units.insert((dir, stem), members);
        }
        units.into_values().collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commit
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply a plan under the root lock.
    pub fn commit(&self, root: &LockedRoot, plan: &PrunePlan, mode: DeletionMode) -> Result<PruneRecord, PruneError> {
        let mut staged: Vec<(PlannedDeletion, u64, String, CanonicalPath)> = Vec::new();
        for deletion in &plan.deletions {
            let Some(bytes) = root.read(&deletion.path)? else {
                tracing::warn!(path = %deletion.path, "Planned deletion already absent");
                continue;
            };
            let quarantine = quarantine_path(&deletion.path);
            staged.push((deletion.clone(), bytes.len() as u64, sha256_hex(&bytes), quarantine));
        }

        for (idx, (deletion, _, _, quarantine)) in staged.iter().enumerate() {
            if let Err(source) = root.rename(&deletion.path, quarantine) {
                let mut rolled_back = 0;
                for (done, _, _, q) in staged[..idx].iter().rev() {
                    match root.rename(q, &done.path) {
                        Ok(()) => rolled_back += 1,
                        Err(e) => tracing::error!(path = %done.path, error = %e, "Rollback rename failed"),
                    }
                }
                tracing::error!(path = %deletion.path, rolled_back, "Prune commit rolled back");
                return Err(PruneError::RolledBack {
                    path: deletion.path.to_string(),
                    rolled_back,
                    source,
                });
            }
        }

        let mut entries = Vec::with_capacity(staged.len());
        let mut emptied: BTreeSet<String> = BTreeSet::new();
        for (deletion, size, sha256, quarantine) in staged {
            let quarantine_path = match mode {
                DeletionMode::Quarantine => Some(quarantine),
                DeletionMode::Delete => match root.remove(&quarantine) {
                    Ok(()) => {
                        emptied.insert(deletion.path.parent().to_string());
                        None
                    }
                    Err(e) => {
                        tracing::warn!(path = %deletion.path, error = %e, "Removal failed; file left in quarantine");
                        Some(quarantine)
                    }
                },
            };
            entries.push(PruneEntry {
                path: deletion.path,
                size,
                sha256,
                kind: deletion.kind,
                reason: deletion.reason,
                quarantine_path,
            });
        }
        let mut removed_dirs = Vec::new();
        for dir in emptied.iter().rev() {
            removed_dirs.extend(root.remove_empty_dirs(dir));
        }

        let record = PruneRecord {
            run_id: uuid::Uuid::new_v4().to_string(),
            snapshot_id: plan.report.snapshot_id.clone(),
            policy_hash: plan.report.policy_hash.clone(),
            mode,
            created_at: Utc::now(),
            entries,
            removed_dirs,
        };
        tracing::info!(
            run_id = %record.run_id,
            files = record.entries.len(),
            bytes = record.total_bytes(),
            mode = ?mode,
            "Committed prune"
        );
        Ok(record)
    }
}

/// In-place quarantine location of a file.
pub fn quarantine_path(path: &CanonicalPath) -> CanonicalPath {
    CanonicalPath::join(path.parent(), &format!("{QUARANTINE_PREFIX}{}", path.file_name()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Records and restore
// ─────────────────────────────────────────────────────────────────────────────

/// Undo record for one deleted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneEntry {
    /// Original path.
    pub path: CanonicalPath,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the content.
    pub sha256: String,
    /// File kind.
    pub kind: NodeKind,
    /// Why it was deleted.
    pub reason: TagReason,
    /// Where it was quarantined (`None` when deleted outright).
    pub quarantine_path: Option<CanonicalPath>,
}

/// Undo log of one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneRecord {
    /// Run identifier.
    pub run_id: String,
    /// Snapshot the plan was made from.
    pub snapshot_id: String,
    /// Policy hash used.
    pub policy_hash: String,
    /// Deletion mode.
    pub mode: DeletionMode,
    /// Commit time.
    pub created_at: DateTime<Utc>,
    /// One entry per deleted file.
    pub entries: Vec<PruneEntry>,
    /// Directories removed after deletion.
    pub removed_dirs: Vec<String>,
}

impl PruneRecord {
    /// Bytes removed.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Paths removed.
    pub fn deleted_paths(&self) -> BTreeSet<CanonicalPath> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }
}

/// Outcome of a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Files moved back from quarantine.
    pub restored: Vec<CanonicalPath>,
    /// Deleted outright or missing from quarantine; must come from elsewhere.
    pub unrecoverable: Vec<CanonicalPath>,
}

/// Move quarantined files of `record` back into place.
///
/// With `only`, restores just those paths. Restored entries are removed from
/// the record; the content is checked against the recorded digest first.
pub fn restore(
    root: &LockedRoot,
    record: &mut PruneRecord,
    only: Option<&BTreeSet<CanonicalPath>>,
) -> Result<RestoreReport, PruneError> {
    let mut report = RestoreReport::default();
    let mut remaining = Vec::with_capacity(record.entries.len());
    let mut outcome = Ok(());
    let mut entries = std::mem::take(&mut record.entries).into_iter();
    while let Some(entry) = entries.next() {
        if only.map(|set| !set.contains(&entry.path)).unwrap_or(false) {
            remaining.push(entry);
            continue;
        }
        match restore_entry(root, &entry) {
            Ok(true) => report.restored.push(entry.path),
            Ok(false) => {
                report.unrecoverable.push(entry.path.clone());
                remaining.push(entry);
            }
            Err(e) => {
                remaining.push(entry);
                remaining.extend(entries.by_ref());
                outcome = Err(e);
                break;
            }
        }
    }
    record.entries = remaining;
    outcome?;
    tracing::info!(
        restored = report.restored.len(),
        unrecoverable = report.unrecoverable.len(),
        "Restored pruned files"
    );
    Ok(report)
}

/// Move one entry back. `Ok(false)` if there is nothing to move.
fn restore_entry(root: &LockedRoot, entry: &PruneEntry) -> Result<bool, PruneError> {
    let Some(quarantine) = &entry.quarantine_path else {
        return Ok(false);
    };
    let Some(bytes) = root.read(quarantine)? else {
        return Ok(false);
    };
    let actual = sha256_hex(&bytes);
    if actual != entry.sha256 {
        return Err(PruneError::Integrity {
            path: entry.path.to_string(),
            expected: entry.sha256.clone(),
            actual,
        });
    }
    root.rename(quarantine, &entry.path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FsPackageStore, InMemoryPackageStore};
    use std::fs;

    fn mem_snapshot(files: &[(&str, &str)]) -> Arc<PackageSnapshot> {
        let store = files
            .iter()
            .fold(InMemoryPackageStore::new(), |s, (p, c)| s.with_file(p, *c));
        Arc::new(PackageSnapshot::capture(Arc::new(store)).unwrap())
    }

    fn reach(tags: &mut TagSet, paths: &[&str]) {
        for p in paths {
            tags.raise((*p).into(), Tag::Reachable, Some(Confidence::Certain), TagReason::Entry);
        }
    }

    fn deleted(plan: &PrunePlan) -> Vec<&str> {
        plan.deletions.iter().map(|d| d.path.as_str()).collect()
    }

    #[test]
    fn test_plan_keeps_units_ancestors_and_protected() {
        let snap = mem_snapshot(&[
            ("pkg/__init__.py", ""),
            ("pkg/sub/__init__.py", ""),
            ("pkg/sub/used.py", "x"),
            ("pkg/sub/unused.py", "yy"),
            ("pkg/sub/__pycache__/used.cpython-313.pyc", "c"),
            ("pkg/fast.cpython-313-x86_64-linux-gnu.so", "ELF"),
            ("pkg/fast.pyi", ""),
            ("pkg/fast.dat", "d"),
            ("pkg-1.0.dist-info/RECORD", "r"),
            ("pkg.pth", "pkg"),
        ]);
        let mut tags = TagSet::new();
        reach(&mut tags, &["pkg/sub/used.py", "pkg/fast.pyi"]);
        let plan = Pruner::new(snap, PrunePolicy::minimal()).plan(&tags, &[]);

        assert_eq!(deleted(&plan), vec!["pkg/sub/unused.py"]);
        assert_eq!(plan.report.removed_bytes, 2);
        assert!(plan.report.retained.contains(&"pkg/fast.dat".into()));
        assert!(plan.report.retained.contains(&"pkg/__init__.py".into()));
        assert!(plan.report.retained.contains(&"pkg.pth".into()));
    }

    #[test]
    fn test_ambiguous_is_never_planned() {
        let snap = mem_snapshot(&[("a.py", ""), ("lazy.py", "")]);
        let mut tags = TagSet::new();
        reach(&mut tags, &["a.py"]);
        tags.raise(
            "lazy.py".into(),
            Tag::Ambiguous,
            None,
            TagReason::UnknownOnly { from: "a.py".into() },
        );
        let plan = Pruner::new(snap, PrunePolicy::minimal()).plan(&tags, &[]);
        assert!(plan.deletions.is_empty());
        assert_eq!(plan.report.ambiguous, vec![CanonicalPath::new("lazy.py")]);
    }

    #[test]
    fn test_scope_limits_candidates() {
        let snap = mem_snapshot(&[("inside/x.py", ""), ("outside/y.py", "")]);
        let policy = PrunePolicy {
            expand_scope: Some(["inside".to_string()].into_iter().collect()),
            ..PrunePolicy::minimal()
        };
        let plan = Pruner::new(snap, policy).plan(&TagSet::new(), &[]);
        assert_eq!(deleted(&plan), vec!["inside/x.py"]);
    }

    fn disk_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pkg/gone")).unwrap();
        fs::write(dir.path().join("pkg/__init__.py"), "").unwrap();
        fs::write(dir.path().join("pkg/a.py"), "a = 1\n").unwrap();
        fs::write(dir.path().join("pkg/gone/b.py"), "b = 2\n").unwrap();
        dir
    }

    fn disk_plan(dir: &tempfile::TempDir) -> (Pruner, PrunePlan) {
        let store = FsPackageStore::open(dir.path()).unwrap();
        let snap = Arc::new(PackageSnapshot::capture(Arc::new(store)).unwrap());
        let mut tags = TagSet::new();
        reach(&mut tags, &["pkg/__init__.py"]);
        let pruner = Pruner::new(snap, PrunePolicy::minimal());
        let plan = pruner.plan(&tags, &[]);
        (pruner, plan)
    }

    #[test]
    fn test_quarantine_commit_and_restore() {
        let dir = disk_tree();
        let (pruner, plan) = disk_plan(&dir);
        assert_eq!(deleted(&plan), vec!["pkg/a.py", "pkg/gone/b.py"]);

        let root = LockedRoot::acquire(dir.path()).unwrap();
        let mut record = pruner.commit(&root, &plan, DeletionMode::Quarantine).unwrap();
        assert_eq!(record.entries.len(), 2);
        assert!(!dir.path().join("pkg/a.py").exists());
        assert!(dir.path().join("pkg/__DELETED_a.py").exists());
        assert_eq!(record.entries[0].sha256, sha256_hex(b"a = 1\n"));

        let only: BTreeSet<CanonicalPath> = ["pkg/a.py".into()].into_iter().collect();
        let report = restore(&root, &mut record, Some(&only)).unwrap();
        assert_eq!(report.restored, vec![CanonicalPath::new("pkg/a.py")]);
        assert_eq!(fs::read_to_string(dir.path().join("pkg/a.py")).unwrap(), "a = 1\n");
        assert_eq!(record.entries.len(), 1);

        restore(&root, &mut record, None).unwrap();
        assert!(record.entries.is_empty());
        assert!(dir.path().join("pkg/gone/b.py").exists());
    }

    #[test]
    fn test_delete_mode_removes_empty_dirs() {
        let dir = disk_tree();
        let (pruner, plan) = disk_plan(&dir);
        let root = LockedRoot::acquire(dir.path()).unwrap();
        let mut record = pruner.commit(&root, &plan, DeletionMode::Delete).unwrap();

        assert!(!dir.path().join("pkg/gone").exists());
        assert!(dir.path().join("pkg/__init__.py").exists());
        assert_eq!(record.removed_dirs, vec!["pkg/gone".to_string()]);

        let report = restore(&root, &mut record, None).unwrap();
        assert!(report.restored.is_empty());
        assert_eq!(report.unrecoverable.len(), 2);
    }

    #[test]
    fn test_failed_rename_rolls_back() {
        let dir = disk_tree();
        let (pruner, plan) = disk_plan(&dir);
        fs::create_dir_all(dir.path().join("pkg/gone/__DELETED_b.py/blocker")).unwrap();

        let root = LockedRoot::acquire(dir.path()).unwrap();
        let err = pruner.commit(&root, &plan, DeletionMode::Quarantine).unwrap_err();
        assert!(matches!(err, PruneError::RolledBack { rolled_back: 1, .. }));
        assert!(dir.path().join("pkg/a.py").exists());
        assert!(dir.path().join("pkg/gone/b.py").exists());
    }

    #[test]
    fn test_integrity_check_on_restore() {
        let dir = disk_tree();
        let (pruner, plan) = disk_plan(&dir);
        let root = LockedRoot::acquire(dir.path()).unwrap();
        let mut record = pruner.commit(&root, &plan, DeletionMode::Quarantine).unwrap();
        fs::write(dir.path().join("pkg/__DELETED_a.py"), "tampered").unwrap();

        let err = restore(&root, &mut record, None).unwrap_err();
        assert!(matches!(err, PruneError::Integrity { .. }));
        assert_eq!(record.entries.len(), 2);
    }
}
