//! Pipeline orchestration.
//!
//! A [`PruneSession`] owns one baseline snapshot and runs the stages in
//! order: build, merge hints, tag, plan, commit, patch, emit. After a commit
//! it exposes exactly three repair operations for an external repair loop:
//! [`PruneSession::rebuild_with_hints`], [`PruneSession::restore_node`] and
//! [`PruneSession::rerun_patcher`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::builder::{BuildError, EntryPoint, GraphBuilder};
use crate::emitter::{ArtifactBundle, ArtifactBundler, EmitError, GraphExport};
use crate::graph::DependencyGraph;
use crate::hints::{HintCollector, HintMerger, MergeReport, TraceInbox, TraceStatus};
use crate::manifest::{DistributionIndex, ManifestError, PrunedManifest, Requirement};
use crate::patcher::{restore_backups, revert_aggregators, AggregatorPatcher, PatchError, PatchReport};
use crate::policy::{PolicyError, PrunePolicy};
use crate::pruner::{restore, ImpactReport, PruneError, PrunePlan, PruneRecord, Pruner, RestoreReport};
use crate::root::{LockError, LockedRoot};
use crate::snapshot::PackageSnapshot;
use crate::store::{FsPackageStore, PackageStore, StoreError};
use crate::tagger::Tagger;
use crate::types::{CanonicalPath, Incident, RuntimeHint, TagSet};

/// Error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Invalid policy.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Closure build failure.
    #[error("build error: {0}")]
    Build(#[from] BuildError),

    /// Root lock failure.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Commit or restore failure.
    #[error("prune error: {0}")]
    Prune(#[from] PruneError),

    /// Patcher failure.
    #[error("patch error: {0}")]
    Patch(#[from] PatchError),

    /// Manifest failure.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Artifact failure.
    #[error("emit error: {0}")]
    Emit(#[from] EmitError),

    /// A runtime trace is still being collected; tags are provisional.
    #[error("runtime trace still collecting; tags are provisional")]
    TraceIncomplete,

    /// The package tree is not backed by a directory.
    #[error("package store is not on disk")]
    NotOnDisk,

    /// The session already committed a deletion.
    #[error("deletion already committed in this session")]
    AlreadyCommitted,

    /// Path is not a file of the baseline snapshot.
    #[error("not a file of the package: {0}")]
    UnknownPath(String),
}

/// Everything a commit produced.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Impact of the committed plan.
    pub impact: ImpactReport,
    /// Undo log.
    pub record: PruneRecord,
    /// Aggregator rewrites.
    pub patch: PatchReport,
}

/// Result of a rebuild.
#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    /// Hint merge summary.
    pub merge: MergeReport,
    /// Files deleted by the commit that the rebuilt graph keeps.
    pub resurrect: Vec<CanonicalPath>,
}

/// One pruning run over a package root.
pub struct PruneSession {
    root: Option<PathBuf>,
    snapshot: Arc<PackageSnapshot>,
    policy: PrunePolicy,
    entries: Vec<EntryPoint>,
    builder: GraphBuilder,
    graph: DependencyGraph,
    incidents: Vec<Incident>,
    hints: Vec<RuntimeHint>,
    promoted: BTreeSet<CanonicalPath>,
    trace: Option<Arc<TraceInbox>>,
    impact: Option<ImpactReport>,
    record: Option<PruneRecord>,
    patch_report: Option<PatchReport>,
    originals: BTreeMap<CanonicalPath, Vec<u8>>,
}

impl std::fmt::Debug for PruneSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PruneSession")
            .field("root", &self.root)
            .field("snapshot_id", &self.snapshot.snapshot_id())
            .field("entries", &self.entries.len())
            .field("nodes", &self.graph.node_count())
            .field("committed", &self.record.is_some())
            .finish()
    }
}

impl PruneSession {
    /// Open a package root on disk and build the closure of `entries`.
    pub fn open(root: impl Into<PathBuf>, entries: Vec<EntryPoint>, policy: PrunePolicy) -> Result<Self, SessionError> {
        let store = FsPackageStore::open(root)?;
        Self::from_store(Arc::new(store), entries, policy)
    }

    /// Start a session over any store.
    pub fn from_store(
        store: Arc<dyn PackageStore>,
        entries: Vec<EntryPoint>,
        policy: PrunePolicy,
    ) -> Result<Self, SessionError> {
        policy.validate()?;
        let root = store.root_dir().map(Path::to_path_buf);
        let snapshot = Arc::new(PackageSnapshot::capture(store)?);
        let mut builder = GraphBuilder::new(Arc::clone(&snapshot), policy.clone())?;
        let output = builder.build(&entries)?;
        Ok(Self {
            root,
            snapshot,
            policy,
            entries,
            builder,
            graph: output.graph,
            incidents: output.incidents,
            hints: Vec::new(),
            promoted: BTreeSet::new(),
            trace: None,
            impact: None,
            record: None,
            patch_report: None,
            originals: BTreeMap::new(),
        })
    }

    /// Baseline snapshot.
    pub fn snapshot(&self) -> &Arc<PackageSnapshot> {
        &self.snapshot
    }

    /// Current graph.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Policy in use.
    pub fn policy(&self) -> &PrunePolicy {
        &self.policy
    }

    /// Incidents of the current graph and merges.
    pub fn incidents(&self) -> &[Incident] {
        &self.incidents
    }

    /// Undo log of the commit, if any.
    pub fn record(&self) -> Option<&PruneRecord> {
        self.record.as_ref()
    }

    /// Latest aggregator patch report, if any.
    pub fn patch_report(&self) -> Option<&PatchReport> {
        self.patch_report.as_ref()
    }

    /// Files currently deleted by this session.
    pub fn deleted(&self) -> BTreeSet<CanonicalPath> {
        self.record
            .as_ref()
            .map(PruneRecord::deleted_paths)
            .unwrap_or_default()
    }

    fn root_dir(&self) -> Result<&Path, SessionError> {
        self.root.as_deref().ok_or(SessionError::NotOnDisk)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Hints
    // ─────────────────────────────────────────────────────────────────────

    /// Merge runtime hints into the current graph.
    pub fn merge_hints(&mut self, hints: &[RuntimeHint]) -> Result<MergeReport, SessionError> {
        let report = HintMerger::for_snapshot(&self.snapshot).merge(&mut self.graph, &mut self.builder, hints)?;
        self.hints.extend_from_slice(hints);
        self.incidents.extend(report.incidents.iter().cloned());
        Ok(report)
    }

    /// Open a channel for a long-running trace. Spawn the returned
    /// collector's `run`; tags stay provisional until it completes and the
    /// inbox is drained.
    pub fn trace_channel(&mut self, capacity: usize) -> (mpsc::Sender<RuntimeHint>, HintCollector) {
        let (tx, collector) = HintCollector::channel(capacity);
        self.trace = Some(collector.inbox());
        (tx, collector)
    }

    /// Merge whatever the trace delivered so far.
    pub fn drain_trace(&mut self) -> Result<MergeReport, SessionError> {
        let Some(inbox) = self.trace.clone() else {
            return Ok(MergeReport::default());
        };
        let hints = inbox.drain();
        self.merge_hints(&hints)
    }

    /// Trace collection state, if a trace is attached.
    pub fn trace_status(&self) -> Option<TraceStatus> {
        self.trace.as_ref().map(|inbox| inbox.status())
    }

    fn trace_settled(&self) -> bool {
        self.trace
            .as_ref()
            .map(|inbox| inbox.status() == TraceStatus::Complete && inbox.pending() == 0)
            .unwrap_or(true)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tagging, planning, commit
    // ─────────────────────────────────────────────────────────────────────

    /// Tag the current graph.
    pub fn tags(&self) -> TagSet {
        let mut tags = Tagger::new(&self.graph, &self.snapshot).tag();
        tags.provisional = !self.trace_settled();
        tags
    }

    /// Plan without touching the file system.
    pub fn dry_run(&self) -> PrunePlan {
        let tags = self.tags();
        Pruner::new(Arc::clone(&self.snapshot), self.policy.clone()).plan(&tags, &self.incidents)
    }

    /// Delete unreachable units under the root lock, then patch aggregators.
    pub fn commit(&mut self) -> Result<CommitOutcome, SessionError> {
        if self.record.is_some() {
            return Err(SessionError::AlreadyCommitted);
        }
        let tags = self.tags();
        if tags.provisional {
            return Err(SessionError::TraceIncomplete);
        }
        let locked = LockedRoot::acquire(self.root_dir()?)?;

        let pruner = Pruner::new(Arc::clone(&self.snapshot), self.policy.clone());
        let plan = pruner.plan(&tags, &self.incidents);
        let record = pruner.commit(&locked, &plan, self.policy.deletion_mode)?;
        self.impact = Some(plan.report.clone());
        self.record = Some(record.clone());

        // The record stays on the session even if patching fails below.
        let patch = self.patch(&locked)?;
        tracing::info!(
            run_id = %record.run_id,
            deleted = record.entries.len(),
            bytes = record.total_bytes(),
            patched = patch.patched.len(),
            "Committed prune"
        );
        Ok(CommitOutcome {
            impact: plan.report,
            record,
            patch,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Repair loop
    // ─────────────────────────────────────────────────────────────────────

    /// Rebuild the graph from scratch with every hint seen so far plus
    /// `hints`, keeping manual promotions. The disk is not touched.
    pub fn rebuild_with_hints(&mut self, hints: &[RuntimeHint]) -> Result<RebuildReport, SessionError> {
        self.hints.extend_from_slice(hints);
        let merge = self.rebuild()?;
        let tags = self.tags();
        let resurrect = self
            .deleted()
            .into_iter()
            .filter(|p| tags.tag(p).is_kept())
            .collect();
        Ok(RebuildReport { merge, resurrect })
    }

    /// Promote `path` to reachable and bring back from quarantine every
    /// deleted file the promotion makes reachable again.
    pub fn restore_node(&mut self, path: &CanonicalPath) -> Result<RestoreReport, SessionError> {
        if !self.snapshot.contains(path) {
            return Err(SessionError::UnknownPath(path.to_string()));
        }
        self.promoted.insert(path.clone());
        self.rebuild()?;

        let mut report = RestoreReport::default();
        if self.record.is_none() {
            return Ok(report);
        }
        let locked = LockedRoot::acquire(self.root_dir()?)?;
        loop {
            let tags = self.tags();
            let wanted: BTreeSet<CanonicalPath> = self
                .deleted()
                .into_iter()
                .filter(|p| tags.tag(p).is_kept() && !report.unrecoverable.contains(p))
                .collect();
            let Some(record) = self.record.as_mut() else {
                break;
            };
            if wanted.is_empty() {
                break;
            }
            let step = restore(&locked, record, Some(&wanted))?;
            report.unrecoverable.extend(step.unrecoverable);
            if step.restored.is_empty() {
                break;
            }
            report.restored.extend(step.restored);
            self.rebuild()?;
        }
        if !report.restored.is_empty() {
            revert_aggregators(&locked, &self.originals)?;
            self.originals.clear();
            self.patch(&locked)?;
        }
        tracing::info!(
            path = %path,
            restored = report.restored.len(),
            unrecoverable = report.unrecoverable.len(),
            "Restored node"
        );
        Ok(report)
    }

    /// Re-run the aggregator patcher against the current deletion set,
    /// starting from the pre-patch backups when they were kept.
    pub fn rerun_patcher(&mut self) -> Result<PatchReport, SessionError> {
        let locked = LockedRoot::acquire(self.root_dir()?)?;
        if self.policy.keep_backups {
            restore_backups(&locked, &self.snapshot)?;
        }
        self.patch(&locked)
    }

    /// Patch aggregators against the current deletion set, remembering the
    /// pre-patch content of every file first rewritten here.
    fn patch(&mut self, locked: &LockedRoot) -> Result<PatchReport, SessionError> {
        let mut patcher = AggregatorPatcher::new(&self.snapshot, self.deleted(), self.policy.clone())?;
        let outcome = patcher.patch_all(locked);
        for (path, bytes) in patcher.into_originals() {
            self.originals.entry(path).or_insert(bytes);
        }
        let report = outcome?;
        self.patch_report = Some(report.clone());
        Ok(report)
    }

    fn rebuild(&mut self) -> Result<MergeReport, SessionError> {
        let mut builder = GraphBuilder::new(Arc::clone(&self.snapshot), self.policy.clone())?;
        let output = builder.build(&self.entries)?;
        let mut graph = output.graph;
        let mut incidents = output.incidents;

        let merge = HintMerger::for_snapshot(&self.snapshot).merge(&mut graph, &mut builder, &self.hints)?;
        incidents.extend(merge.incidents.iter().cloned());

        let mut seeds = Vec::new();
        for path in &self.promoted {
            let Some(meta) = self.snapshot.meta(path) else {
                continue;
            };
            let (handle, _) = graph.intern(path.clone(), meta.kind, meta.size);
            graph.promote(handle);
            if !graph.is_expanded(handle) {
                seeds.push(handle);
            }
        }
        if !seeds.is_empty() {
            let (more, _) = builder.expand_from(&mut graph, seeds)?;
            incidents.extend(more);
        }

        tracing::info!(
            nodes = graph.node_count(),
            hints = self.hints.len(),
            promoted = self.promoted.len(),
            "Rebuilt import graph"
        );
        self.builder = builder;
        self.graph = graph;
        self.incidents = incidents;
        Ok(merge)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Artifacts
    // ─────────────────────────────────────────────────────────────────────

    /// Canonical graph export with current tags.
    pub fn export_graph(&self) -> Result<GraphExport, SessionError> {
        let tags = self.tags();
        Ok(GraphExport::new(
            &self.graph,
            &tags,
            self.snapshot.snapshot_id(),
            &self.policy.params_hash(),
        )?)
    }

    /// Assemble every artifact of the session.
    pub fn artifacts(&self, requirements: Option<&[Requirement]>) -> Result<ArtifactBundle, SessionError> {
        let tags = self.tags();
        let graph = GraphExport::new(
            &self.graph,
            &tags,
            self.snapshot.snapshot_id(),
            &self.policy.params_hash(),
        )?;
        let impact = match &self.impact {
            Some(impact) => impact.clone(),
            None => Pruner::new(Arc::clone(&self.snapshot), self.policy.clone())
                .plan(&tags, &self.incidents)
                .report,
        };

        let mut bundler = ArtifactBundler::new().graph(graph).impact_report(impact);
        if let Some(requirements) = requirements {
            let index = DistributionIndex::from_snapshot(&self.snapshot)?;
            bundler = bundler.requirements(PrunedManifest::compute(requirements, &index, &tags));
        }
        if let Some(record) = &self.record {
            bundler = bundler.prune_record(record.clone());
        }
        if let Some(report) = &self.patch_report {
            bundler = bundler.patch_report(report.clone());
        }
        Ok(bundler.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DeletionMode;
    use crate::store::InMemoryPackageStore;
    use crate::types::Tag;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn quarantine_policy() -> PrunePolicy {
        PrunePolicy {
            deletion_mode: DeletionMode::Quarantine,
            ..PrunePolicy::minimal()
        }
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "main.py", "import pkg\n");
        write(root, "pkg/__init__.py", "from .core import run\nfrom .extra import helper\n");
        write(root, "pkg/core.py", "def run():\n    pass\n");
        write(root, "pkg/extra.py", "import pkg.deep\n");
        write(root, "pkg/deep.py", "");
        write(root, "plugin.py", "import pkg.deep\n");
        dir
    }

    const AGGREGATOR: &str = "from .heavy import thing\nfrom .extra import more\nfrom .core import run\n";

    /// `pkg/__init__.py` imports two modules nothing else needs.
    fn aggregator_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "main.py", "from pkg.core import run\n");
        write(root, "pkg/__init__.py", AGGREGATOR);
        write(root, "pkg/core.py", "def run():\n    pass\n");
        write(root, "pkg/heavy.py", "thing = 1\n");
        write(root, "pkg/extra.py", "more = 2\n");
        dir
    }

    fn open_lazy(dir: &tempfile::TempDir) -> PruneSession {
        let policy = PrunePolicy {
            expand_aggregators: false,
            keep_backups: true,
            ..quarantine_policy()
        };
        PruneSession::open(dir.path(), vec![EntryPoint::new("main.py")], policy).unwrap()
    }

    #[test]
    fn test_dry_run_leaves_disk_untouched() {
        let dir = tree();
        let session = PruneSession::open(dir.path(), vec![EntryPoint::new("main.py")], quarantine_policy()).unwrap();
        let plan = session.dry_run();
        let deleted: Vec<_> = plan.deletions.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(deleted, vec!["plugin.py"]);
        assert!(dir.path().join("plugin.py").exists());
    }

    #[test]
    fn test_commit_then_restore_node() {
        let dir = tree();
        let mut session =
            PruneSession::open(dir.path(), vec![EntryPoint::new("main.py")], quarantine_policy()).unwrap();
        let outcome = session.commit().unwrap();
        assert_eq!(outcome.record.entries.len(), 1);
        assert!(!dir.path().join("plugin.py").exists());
        assert!(matches!(session.commit(), Err(SessionError::AlreadyCommitted)));

        let report = session.restore_node(&"plugin.py".into()).unwrap();
        assert_eq!(report.restored, vec![CanonicalPath::new("plugin.py")]);
        assert!(dir.path().join("plugin.py").exists());
        assert!(session.deleted().is_empty());
        assert_eq!(session.tags().tag(&"plugin.py".into()), Tag::Reachable);
    }

    #[test]
    fn test_rebuild_with_hints_lists_resurrections() {
        let dir = tree();
        let mut session =
            PruneSession::open(dir.path(), vec![EntryPoint::new("main.py")], quarantine_policy()).unwrap();
        session.commit().unwrap();
        let report = session.rebuild_with_hints(&[RuntimeHint::new("plugin.py")]).unwrap();
        assert_eq!(report.merge.accepted, 1);
        assert_eq!(report.resurrect, vec![CanonicalPath::new("plugin.py")]);
    }

    #[test]
    fn test_rerun_patcher_after_commit() {
        let dir = tree();
        let mut session =
            PruneSession::open(dir.path(), vec![EntryPoint::new("main.py")], quarantine_policy()).unwrap();
        session.commit().unwrap();
        let report = session.rerun_patcher().unwrap();
        assert!(report.patched.is_empty());
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_commit_refused_while_trace_collecting() {
        let dir = tree();
        let mut session =
            PruneSession::open(dir.path(), vec![EntryPoint::new("main.py")], quarantine_policy()).unwrap();
        let (tx, collector) = session.trace_channel(8);
        let task = tokio::spawn(collector.run());
        tx.send(RuntimeHint::new("plugin.py")).await.unwrap();

        assert!(session.tags().provisional);
        assert!(matches!(session.commit(), Err(SessionError::TraceIncomplete)));

        drop(tx);
        task.await.unwrap();
        assert_eq!(session.trace_status(), Some(TraceStatus::Complete));
        session.drain_trace().unwrap();
        assert!(!session.tags().provisional);
        let outcome = session.commit().unwrap();
        assert!(outcome.record.entries.is_empty());
    }

    #[test]
    fn test_in_memory_session_cannot_commit() {
        let store = InMemoryPackageStore::new().with_file("main.py", "");
        let mut session =
            PruneSession::from_store(Arc::new(store), vec![EntryPoint::new("main.py")], PrunePolicy::minimal())
                .unwrap();
        assert!(matches!(session.commit(), Err(SessionError::NotOnDisk)));
        assert!(session.export_graph().is_ok());
    }

    #[test]
    fn test_record_survives_failed_patch() {
        let dir = aggregator_tree();
        let mut session = open_lazy(&dir);
        let blocker = dir.path().join(format!("pkg/.__init__.py.tmp-{}", std::process::id()));
        fs::create_dir_all(&blocker).unwrap();

        let err = session.commit().unwrap_err();
        assert!(matches!(err, SessionError::Patch(_)), "{err}");
        assert!(!dir.path().join("pkg/heavy.py").exists());
        let deleted: Vec<_> = session.deleted().into_iter().collect();
        assert_eq!(deleted, vec![CanonicalPath::new("pkg/extra.py"), CanonicalPath::new("pkg/heavy.py")]);
        assert_eq!(session.record().map(|r| r.entries.len()), Some(2));
        assert!(matches!(session.commit(), Err(SessionError::AlreadyCommitted)));

        fs::remove_dir(&blocker).unwrap();
        let report = session.restore_node(&"pkg/heavy.py".into()).unwrap();
        assert_eq!(report.restored, vec![CanonicalPath::new("pkg/heavy.py")]);
        assert_eq!(fs::read_to_string(dir.path().join("pkg/heavy.py")).unwrap(), "thing = 1\n");
    }

    #[test]
    fn test_restore_node_repatches_aggregators() {
        let dir = aggregator_tree();
        let mut session = open_lazy(&dir);
        let outcome = session.commit().unwrap();
        assert_eq!(outcome.patch.patched.len(), 1);
        assert_eq!(outcome.patch.patched[0].stubbed, vec!["thing", "more"]);

        let init = dir.path().join("pkg/__init__.py");
        session.restore_node(&"pkg/heavy.py".into()).unwrap();
        let text = fs::read_to_string(&init).unwrap();
        assert!(text.contains("from .heavy import thing\n"));
        assert!(!text.contains("thing = _PrunedAway("));
        assert!(text.contains("more = _PrunedAway(\"more\", \"pkg.extra\")"));
        assert_eq!(session.patch_report().unwrap().patched[0].stubbed, vec!["more"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("pkg/__INITIAL___init__.py")).unwrap(),
            AGGREGATOR
        );

        session.restore_node(&"pkg/extra.py".into()).unwrap();
        assert_eq!(fs::read_to_string(&init).unwrap(), AGGREGATOR);
        assert!(session.patch_report().unwrap().patched.is_empty());
        assert!(!dir.path().join("pkg/__INITIAL___init__.py").exists());
    }
}
