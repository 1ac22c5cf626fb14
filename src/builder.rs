//! Deterministic closure builder.
//!
//! The builder computes the static import closure of an entry set over a
//! package snapshot.
//!
//! ## Algorithm
//!
//! 1. Intern every entry file and mark it as a root
//! 2. Push the roots onto a FIFO frontier of node handles
//! 3. While the frontier is not empty:
//!    - Poll the cancel flag; on cancellation return a checkpoint
//!    - Pop a handle; skip it if already expanded
//!    - Scan the file, resolve every reference, add one edge per resolution
//!    - Push targets reached over certain/probable edges that are not yet
//!      expanded; the pruning scope never limits expansion
//!    - Fail with the partial graph if the node budget is exceeded
//! 4. The closure is complete when the frontier is empty
//!
//! Every node is expanded at most once, so the closure is O(|V| + |E|) and
//! terminates on cyclic imports.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::graph::DependencyGraph;
use crate::policy::PrunePolicy;
use crate::resolver::{Leaf, Resolution, ResolvedTarget, Resolver};
use crate::snapshot::PackageSnapshot;
use crate::store::StoreError;
use crate::syntax::{PythonParser, SyntaxError};
use crate::types::{
    CanonicalPath, Confidence, EdgeTarget, ExportSurface, ImportEdge, Incident, IncidentKind,
    NodeHandle, NodeKind, ResolutionKind,
};

/// Error type for builder operations.
#[derive(Debug, Error)]
pub enum BuildError {
    /// An entry file is neither in the snapshot nor readable.
    #[error("entry file not found: {0}")]
    EntryNotFound(String),

    /// The closure exceeded `max_closure_nodes`; the partial graph is attached.
    #[error("closure exceeded {limit} nodes (reached {reached})")]
    ClosureTooLarge {
        /// Configured limit.
        limit: usize,
        /// Node count when the limit tripped.
        reached: usize,
        /// Graph built so far.
        partial: Box<DependencyGraph>,
    },

    /// The build was cancelled; resume from the checkpoint.
    #[error("build cancelled with {} nodes pending", .0.frontier.len())]
    Cancelled(Box<ClosureCheckpoint>),

    /// A checkpoint was taken against a different snapshot or policy.
    #[error("checkpoint does not match snapshot {snapshot_id}")]
    CheckpointMismatch {
        /// Snapshot the checkpoint expected.
        snapshot_id: String,
    },

    /// Storage failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Parser failure.
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),
}

/// An entry file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Canonical path (root-relative, or absolute outside the root).
    pub path: CanonicalPath,
}

impl EntryPoint {
    /// Entry by canonical path.
    pub fn new(path: impl Into<CanonicalPath>) -> Self {
        Self { path: path.into() }
    }

    /// Entry from a file system path, made root-relative when inside `root`.
    pub fn from_file(root: &Path, file: &Path) -> Self {
        let absolute = if file.is_absolute() {
            file.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(file))
                .unwrap_or_else(|_| file.to_path_buf())
        };
        let path = match absolute.strip_prefix(root) {
            Ok(rel) => CanonicalPath::new(rel.to_string_lossy()),
            Err(_) => CanonicalPath::new(absolute.to_string_lossy()),
        };
        Self { path }
    }
}

impl From<&str> for EntryPoint {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Resumable build state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosureCheckpoint {
    /// Snapshot the build ran against.
    pub snapshot_id: String,
    /// Policy hash the build ran with.
    pub policy_hash: String,
    /// Graph so far.
    pub graph: DependencyGraph,
    /// Pending frontier, in order.
    pub frontier: Vec<NodeHandle>,
    /// Incidents recorded so far.
    pub incidents: Vec<Incident>,
}

/// Counters for one build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    /// Nodes expanded in this run.
    pub expanded: usize,
    /// Edges added in this run.
    pub edges_added: usize,
    /// Expansions above the fan-out threshold.
    pub fanout_warnings: usize,
}

/// A completed closure.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// The dependency graph.
    pub graph: DependencyGraph,
    /// Recoverable incidents.
    pub incidents: Vec<Incident>,
    /// Counters.
    pub stats: BuildStats,
}

/// Closure builder over one snapshot.
///
/// Single-threaded and deterministic: the same snapshot, entries and policy
/// always produce the same handles, edges and edge order.
pub struct GraphBuilder {
    snapshot: Arc<PackageSnapshot>,
    resolver: Arc<Resolver>,
    policy: PrunePolicy,
    parser: PythonParser,
    cancel: Option<Arc<AtomicBool>>,
    exports: HashMap<CanonicalPath, ExportSurface>,
}

impl std::fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("snapshot_id", &self.snapshot.snapshot_id())
            .field("policy", &self.policy.policy_id())
            .finish()
    }
}

impl GraphBuilder {
    /// Create a builder with its own resolver.
    pub fn new(snapshot: Arc<PackageSnapshot>, policy: PrunePolicy) -> Result<Self, BuildError> {
        let resolver = Arc::new(Resolver::new(Arc::clone(&snapshot), policy.resolver_cache_size));
        Self::with_resolver(resolver, policy)
    }

    /// Create a builder sharing an existing resolver.
    pub fn with_resolver(resolver: Arc<Resolver>, policy: PrunePolicy) -> Result<Self, BuildError> {
        Ok(Self {
            snapshot: Arc::clone(resolver.snapshot()),
            resolver,
            policy,
            parser: PythonParser::new()?,
            cancel: None,
            exports: HashMap::new(),
        })
    }

    /// Attach a cancel flag polled between expansions.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Policy in use.
    pub fn policy(&self) -> &PrunePolicy {
        &self.policy
    }

    /// Snapshot in use.
    pub fn snapshot(&self) -> &Arc<PackageSnapshot> {
        &self.snapshot
    }

    /// Build the closure of `entries`.
    pub fn build(&mut self, entries: &[EntryPoint]) -> Result<BuildOutput, BuildError> {
        let mut graph = DependencyGraph::new();
        let mut seeds = Vec::with_capacity(entries.len());
        for entry in entries {
            let handle = self.intern_entry(&mut graph, entry)?;
            graph.add_root(handle);
            seeds.push(handle);
        }
        tracing::info!(
            entries = entries.len(),
            snapshot_id = %self.snapshot.snapshot_id(),
            "Building import closure"
        );
        let (incidents, stats) = self.run(&mut graph, seeds, Vec::new())?;
        Ok(BuildOutput {
            graph,
            incidents,
            stats,
        })
    }

    /// Continue a cancelled build.
    pub fn resume(&mut self, checkpoint: ClosureCheckpoint) -> Result<BuildOutput, BuildError> {
        if checkpoint.snapshot_id != self.snapshot.snapshot_id()
            || checkpoint.policy_hash != self.policy.params_hash()
        {
            return Err(BuildError::CheckpointMismatch {
                snapshot_id: checkpoint.snapshot_id,
            });
        }
        let ClosureCheckpoint {
            mut graph,
            frontier,
            incidents,
            ..
        } = checkpoint;
        tracing::info!(pending = frontier.len(), "Resuming import closure");
        let (incidents, stats) = self.run(&mut graph, frontier, incidents)?;
        Ok(BuildOutput {
            graph,
            incidents,
            stats,
        })
    }

    /// Expand the closure of `seeds` inside an existing graph.
    ///
    /// Seeds are expanded whatever their confidence; the runtime-hint
    /// merger uses this to pull in what a hinted file imports.
    pub fn expand_from(
        &mut self,
        graph: &mut DependencyGraph,
        seeds: Vec<NodeHandle>,
    ) -> Result<(Vec<Incident>, BuildStats), BuildError> {
        self.run(graph, seeds, Vec::new())
    }

    fn intern_entry(&self, graph: &mut DependencyGraph, entry: &EntryPoint) -> Result<NodeHandle, BuildError> {
        if let Some(meta) = self.snapshot.meta(&entry.path) {
            return Ok(graph.intern(entry.path.clone(), meta.kind, meta.size).0);
        }
        let bytes = self
            .snapshot
            .read_bytes(&entry.path)?
            .ok_or_else(|| BuildError::EntryNotFound(entry.path.to_string()))?;
        let kind = NodeKind::classify(&entry.path);
        Ok(graph.intern(entry.path.clone(), kind, bytes.len() as u64).0)
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn run(
        &mut self,
        graph: &mut DependencyGraph,
        seeds: Vec<NodeHandle>,
        mut incidents: Vec<Incident>,
    ) -> Result<(Vec<Incident>, BuildStats), BuildError> {
        let mut stats = BuildStats::default();
        let mut frontier: VecDeque<NodeHandle> = VecDeque::new();
        let mut queued: HashSet<NodeHandle> = HashSet::new();
        for seed in seeds {
            if queued.insert(seed) {
                frontier.push_back(seed);
            }
        }

        while let Some(handle) = frontier.front().copied() {
            if self.cancelled() {
                tracing::warn!(pending = frontier.len(), "Closure build cancelled");
                return Err(BuildError::Cancelled(Box::new(ClosureCheckpoint {
                    snapshot_id: self.snapshot.snapshot_id().to_string(),
                    policy_hash: self.policy.params_hash(),
                    graph: std::mem::take(graph),
                    frontier: frontier.into_iter().collect(),
                    incidents,
                })));
            }
            frontier.pop_front();
            if graph.is_expanded(handle) {
                continue;
            }
            graph.set_expanded(handle);
            stats.expanded += 1;

            let before = graph.edge_count();
            let next = self.expand_node(graph, handle, &mut incidents)?;
            let added = graph.edge_count() - before;
            stats.edges_added += added;
            if added > self.policy.fanout_warn_threshold {
                stats.fanout_warnings += 1;
                tracing::warn!(
                    node = %graph.path(handle),
                    edges = added,
                    threshold = self.policy.fanout_warn_threshold,
                    "Large fan-out during expansion"
                );
            }

            for target in next {
                if !graph.is_expanded(target) && queued.insert(target) {
                    frontier.push_back(target);
                }
            }

            if graph.node_count() > self.policy.max_closure_nodes {
                let reached = graph.node_count();
                Incident::record(
                    IncidentKind::ResourceExhaustion {
                        limit: self.policy.max_closure_nodes,
                        reached,
                    },
                    "builder",
                );
                return Err(BuildError::ClosureTooLarge {
                    limit: self.policy.max_closure_nodes,
                    reached,
                    partial: Box::new(std::mem::take(graph)),
                });
            }
        }

        tracing::info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            expanded = stats.expanded,
            incidents = incidents.len(),
            "Import closure complete"
        );
        Ok((incidents, stats))
    }

    /// Expand one node. Returns handles that should join the frontier.
    fn expand_node(
        &mut self,
        graph: &mut DependencyGraph,
        handle: NodeHandle,
        incidents: &mut Vec<Incident>,
    ) -> Result<Vec<NodeHandle>, BuildError> {
        let node = graph.node(handle).clone();
        tracing::debug!(node = %node.path, kind = %node.kind, "Expanding node");

        let mut resolutions: Vec<Resolution> = Vec::new();
        if node.is_unit_leader() {
            self.unit_members(&node.path, node.kind, &mut resolutions);
        } else if node.kind.is_python_source() {
            let skip_scan = node.kind == NodeKind::Aggregator
                && !self.policy.expand_aggregators
                && !graph.roots().contains(&handle);
            if !skip_scan {
                match self.scan_source(graph, handle, &mut resolutions) {
                    Ok(()) => {}
                    Err(detail) => {
                        let incident = Incident::record(
                            IncidentKind::GraphInconsistency {
                                path: node.path.to_string(),
                                detail,
                            },
                            "builder",
                        );
                        incidents.push(incident);
                        let downgraded = graph.downgrade_incoming(handle);
                        tracing::warn!(
                            node = %node.path,
                            downgraded,
                            "Unreadable file; incoming edges downgraded"
                        );
                        return Ok(Vec::new());
                    }
                }
            }
            self.structural(&node.path, &mut resolutions);
        }

        let mut next = Vec::new();
        for res in resolutions {
            let target = match res.target {
                ResolvedTarget::File(path) => {
                    let Some(meta) = self.snapshot.meta(&path) else {
                        continue;
                    };
                    let (target, _) = graph.intern(path, meta.kind, meta.size);
                    if res.confidence.propagates() {
                        next.push(target);
                    }
                    EdgeTarget::Node(target)
                }
                ResolvedTarget::Unresolved(text) => EdgeTarget::Unresolved(text),
            };
            graph.add_edge(ImportEdge::new(handle, target, res.kind, res.confidence, res.line));
        }
        Ok(next)
    }

    /// Scan a Python source node. `Err` carries an inconsistency description.
    fn scan_source(
        &mut self,
        graph: &mut DependencyGraph,
        handle: NodeHandle,
        out: &mut Vec<Resolution>,
    ) -> Result<(), String> {
        let path = graph.path(handle).clone();
        let text = match self.snapshot.read_text(&path) {
            Ok(Some(text)) => text,
            Ok(None) => return Err("file listed in snapshot but missing".to_string()),
            Err(e) => return Err(e.to_string()),
        };
        let scan = self.parser.scan(&text).map_err(|e| e.to_string())?;
        if scan.has_syntax_errors {
            tracing::debug!(node = %path, "Source has syntax errors; imports are best effort");
        }
        graph.node_mut(handle).exports = scan.exports.clone();
        self.exports.insert(path.clone(), scan.exports);

        for stmt in &scan.imports {
            let resolved = self.resolver.resolve_import(stmt, &path);
            for res in &resolved {
                if res.kind == ResolutionKind::Wildcard {
                    if let ResolvedTarget::File(target) = &res.target {
                        self.wildcard_submodules(target, res, out);
                    }
                }
            }
            out.extend(resolved);
        }
        for dynamic in &scan.dynamic {
            out.extend(self.resolver.resolve_dynamic(dynamic));
        }
        if self.policy.scan_data_literals {
            for literal in &scan.literals {
                out.extend(self.resolver.resolve_literal(literal, &path));
            }
        }
        Ok(())
    }

    /// `from pkg import *` also loads the submodules listed in `pkg.__all__`.
    fn wildcard_submodules(&mut self, target: &CanonicalPath, res: &Resolution, out: &mut Vec<Resolution>) {
        if target.file_name() != "__init__.py" {
            return;
        }
        let Some(package) = target.module_name() else {
            return;
        };
        let surface = match self.exports.get(target) {
            Some(surface) => surface.clone(),
            None => {
                let Ok(Some(text)) = self.snapshot.read_text(target) else {
                    return;
                };
                let Ok(scan) = self.parser.scan(&text) else {
                    return;
                };
                self.exports.insert(target.clone(), scan.exports.clone());
                scan.exports
            }
        };

        match surface {
            ExportSurface::Known(names) => {
                for name in names {
                    let lookup = self.resolver.lookup(&format!("{package}.{name}"));
                    let cap = match lookup.leaf {
                        Leaf::Compiled(_) | Leaf::Stub(_) => Confidence::Probable,
                        _ => Confidence::Certain,
                    };
                    for file in lookup.leaf.files() {
                        out.push(Resolution {
                            target: ResolvedTarget::File(file.clone()),
                            kind: ResolutionKind::Wildcard,
                            confidence: res.confidence.at_most(cap),
                            line: res.line,
                        });
                    }
                }
            }
            ExportSurface::Dynamic => {
                let dir = target.parent().to_string();
                let submodules: Vec<CanonicalPath> = self
                    .snapshot
                    .files_under(&dir)
                    .filter(|p| {
                        let depth_ok = p.parent() == dir
                            || (p.file_name() == "__init__.py" && CanonicalPath::new(p.parent()).parent() == dir);
                        depth_ok && p != &target && self.snapshot.meta(p).map(|m| m.kind != NodeKind::Data).unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                for file in submodules {
                    out.push(Resolution {
                        target: ResolvedTarget::File(file),
                        kind: ResolutionKind::Wildcard,
                        confidence: Confidence::Unknown,
                        line: res.line,
                    });
                }
            }
            ExportSurface::Empty => {}
        }
    }

    /// Edges every Python source carries regardless of its imports:
    /// enclosing package initializers and cached bytecode.
    fn structural(&self, path: &CanonicalPath, out: &mut Vec<Resolution>) {
        if path.is_external() {
            return;
        }
        let own_dir = path.parent();
        for dir in path.ancestors() {
            let init = CanonicalPath::join(dir, "__init__.py");
            if &init != path && self.snapshot.contains(&init) {
                out.push(Resolution {
                    target: ResolvedTarget::File(init),
                    kind: ResolutionKind::Direct,
                    confidence: Confidence::Certain,
                    line: 0,
                });
            }
        }

        let cache_dir = if own_dir.is_empty() {
            "__pycache__".to_string()
        } else {
            format!("{own_dir}/__pycache__")
        };
        let stem = path.stem();
        for cached in self.snapshot.files_in_dir(&cache_dir) {
            if cached.stem() == stem && cached.extension() == Some("pyc") {
                out.push(Resolution {
                    target: ResolvedTarget::File(cached.clone()),
                    kind: ResolutionKind::CoUnit,
                    confidence: Confidence::Certain,
                    line: 0,
                });
            }
        }
    }

    /// Same-stem siblings of a compiled unit and the vendored libraries of
    /// its top-level package.
    fn unit_members(&self, path: &CanonicalPath, kind: NodeKind, out: &mut Vec<Resolution>) {
        let dir = path.parent();
        let stem = path.stem();
        for sibling in self.snapshot.files_in_dir(dir) {
            if sibling == path || sibling.stem() != stem {
                continue;
            }
            let kind = self.snapshot.meta(sibling).map(|m| m.kind);
            if matches!(kind, Some(NodeKind::Source) | Some(NodeKind::Aggregator)) {
                continue;
            }
            out.push(Resolution {
                target: ResolvedTarget::File(sibling.clone()),
                kind: ResolutionKind::CoUnit,
                confidence: Confidence::Probable,
                line: 0,
            });
        }

        if path.is_external() || kind != NodeKind::CompiledExtension {
            return;
        }
        let top = path.top_level();
        let top = top.split('.').next().unwrap_or(top);
        for libs in [format!("{top}.libs"), format!("{top}/.libs")] {
            for lib in self.snapshot.files_under(&libs) {
                out.push(Resolution {
                    target: ResolvedTarget::File(lib.clone()),
                    kind: ResolutionKind::Deferred,
                    confidence: Confidence::Unknown,
                    line: 0,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPackageStore;
    use crate::types::NodeKind;

    fn snapshot(store: InMemoryPackageStore) -> Arc<PackageSnapshot> {
        Arc::new(PackageSnapshot::capture(Arc::new(store)).unwrap())
    }

    fn build(store: InMemoryPackageStore, entries: &[&str]) -> BuildOutput {
        let mut builder = GraphBuilder::new(snapshot(store), PrunePolicy::minimal()).unwrap();
        let entries: Vec<EntryPoint> = entries.iter().map(|e| EntryPoint::new(*e)).collect();
        builder.build(&entries).unwrap()
    }

    fn has(out: &BuildOutput, path: &str) -> bool {
        out.graph.handle(&path.into()).is_some()
    }

    #[test]
    fn test_cycle_terminates() {
        let store = InMemoryPackageStore::new()
            .with_file("a.py", "import b\n")
            .with_file("b.py", "import a\n");
        let out = build(store, &["a.py"]);
        assert_eq!(out.graph.node_count(), 2);
        assert_eq!(out.stats.expanded, 2);
        assert_eq!(out.graph.edge_count(), 2);
    }

    #[test]
    fn test_diamond_expands_shared_node_once() {
        let store = InMemoryPackageStore::new()
            .with_file("top.py", "import left\nimport right\n")
            .with_file("left.py", "import shared\n")
            .with_file("right.py", "import shared\n")
            .with_file("shared.py", "x = 1\n");
        let out = build(store, &["top.py"]);
        assert_eq!(out.graph.node_count(), 4);
        assert_eq!(out.stats.expanded, 4);
        let shared = out.graph.handle(&"shared.py".into()).unwrap();
        assert_eq!(out.graph.incoming(shared).count(), 2);
    }

    #[test]
    fn test_deferred_targets_not_expanded() {
        let store = InMemoryPackageStore::new()
            .with_file("entry.py", "def f():\n    import lazy\n")
            .with_file("lazy.py", "import deeper\n")
            .with_file("deeper.py", "");
        let out = build(store, &["entry.py"]);
        let lazy = out.graph.handle(&"lazy.py".into()).unwrap();
        assert!(!out.graph.is_expanded(lazy));
        assert!(!has(&out, "deeper.py"));
    }

    #[test]
    fn test_parent_package_and_pycache_edges() {
        let store = InMemoryPackageStore::new()
            .with_file("entry.py", "import pkg.mod\n")
            .with_file("pkg/__init__.py", "")
            .with_file("pkg/mod.py", "")
            .with_file("pkg/__pycache__/mod.cpython-313.pyc", "")
            .with_file("pkg/__pycache__/other.cpython-313.pyc", "");
        let out = build(store, &["entry.py"]);
        assert!(has(&out, "pkg/__pycache__/mod.cpython-313.pyc"));
        assert!(!has(&out, "pkg/__pycache__/other.cpython-313.pyc"));

        let mod_h = out.graph.handle(&"pkg/mod.py".into()).unwrap();
        let co_unit = out
            .graph
            .outgoing(mod_h)
            .filter(|e| e.kind == ResolutionKind::CoUnit)
            .count();
        assert_eq!(co_unit, 1);
    }

    #[test]
    fn test_compiled_unit_and_vendored_libs() {
        let store = InMemoryPackageStore::new()
            .with_file("entry.py", "import sp.fast\n")
            .with_file("sp/__init__.py", "")
            .with_file("sp/fast.cpython-313-x86_64-linux-gnu.so", "ELF")
            .with_file("sp/fast.pyi", "")
            .with_file("sp/fast.dat", "")
            .with_file("sp.libs/libopenblas.so", "ELF");
        let out = build(store, &["entry.py"]);

        let so = out
            .graph
            .handle(&"sp/fast.cpython-313-x86_64-linux-gnu.so".into())
            .unwrap();
        assert_eq!(out.graph.node(so).kind, NodeKind::CompiledExtension);
        let members: Vec<_> = out
            .graph
            .outgoing(so)
            .filter(|e| e.kind == ResolutionKind::CoUnit)
            .collect();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|e| e.confidence == Confidence::Probable));

        let lib = out.graph.handle(&"sp.libs/libopenblas.so".into()).unwrap();
        let incoming: Vec<_> = out.graph.incoming(lib).collect();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].confidence, Confidence::Unknown);
        assert!(!out.graph.is_expanded(lib));
    }

    #[test]
    fn test_wildcard_pulls_all_listed_submodules() {
        let store = InMemoryPackageStore::new()
            .with_file("entry.py", "from pkg import *\n")
            .with_file("pkg/__init__.py", "__all__ = ['sub', 'helper']\n")
            .with_file("pkg/sub.py", "")
            .with_file("pkg/unlisted.py", "");
        let out = build(store, &["entry.py"]);
        let entry = out.graph.handle(&"entry.py".into()).unwrap();
        let sub = out.graph.handle(&"pkg/sub.py".into()).unwrap();
        assert!(out
            .graph
            .outgoing(entry)
            .any(|e| e.target == EdgeTarget::Node(sub) && e.kind == ResolutionKind::Wildcard));
        assert!(out.graph.is_expanded(sub));
        assert!(!has(&out, "pkg/unlisted.py"));
    }

    #[test]
    fn test_missing_file_is_downgraded() {
        let store = InMemoryPackageStore::new()
            .with_file("entry.py", "import gone\n")
            .with_file("gone.py", "");
        store.vanish("gone.py");
        let out = build(store, &["entry.py"]);

        assert_eq!(out.incidents.len(), 1);
        assert!(matches!(out.incidents[0].kind, IncidentKind::GraphInconsistency { .. }));
        let gone = out.graph.handle(&"gone.py".into()).unwrap();
        assert_eq!(out.graph.incoming(gone).count(), 0);
    }

    #[test]
    fn test_closure_budget() {
        let store = InMemoryPackageStore::new()
            .with_file("a.py", "import b, c, d\n")
            .with_file("b.py", "")
            .with_file("c.py", "")
            .with_file("d.py", "");
        let policy = PrunePolicy {
            max_closure_nodes: 2,
            ..PrunePolicy::minimal()
        };
        let mut builder = GraphBuilder::new(snapshot(store), policy).unwrap();
        match builder.build(&[EntryPoint::new("a.py")]) {
            Err(BuildError::ClosureTooLarge { limit, partial, .. }) => {
                assert_eq!(limit, 2);
                assert_eq!(partial.node_count(), 4);
            }
            other => panic!("expected ClosureTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_and_resume_match_uninterrupted_build() {
        let make = || {
            InMemoryPackageStore::new()
                .with_file("a.py", "import b\nimport c\n")
                .with_file("b.py", "import d\n")
                .with_file("c.py", "import d\n")
                .with_file("d.py", "")
        };
        let full = build(make(), &["a.py"]);

        let snap = snapshot(make());
        let flag = Arc::new(AtomicBool::new(true));
        let mut builder = GraphBuilder::new(Arc::clone(&snap), PrunePolicy::minimal())
            .unwrap()
            .with_cancel_flag(Arc::clone(&flag));
        let checkpoint = match builder.build(&[EntryPoint::new("a.py")]) {
            Err(BuildError::Cancelled(cp)) => cp,
            other => panic!("expected cancellation, got {other:?}"),
        };
        assert_eq!(checkpoint.frontier.len(), 1);

        let json = serde_json::to_string(&*checkpoint).unwrap();
        let restored: ClosureCheckpoint = serde_json::from_str(&json).unwrap();
        flag.store(false, Ordering::SeqCst);
        let resumed = builder.resume(restored).unwrap();

        assert_eq!(resumed.graph.edges(), full.graph.edges());
        assert_eq!(resumed.graph.node_count(), full.graph.node_count());
    }

    #[test]
    fn test_scope_does_not_limit_expansion() {
        let store = InMemoryPackageStore::new()
            .with_file("entry.py", "import outside\n")
            .with_file("outside/__init__.py", "import outside.deep\n")
            .with_file("outside/deep.py", "import inside.core\n")
            .with_file("inside/__init__.py", "")
            .with_file("inside/core.py", "")
            .with_file("inside/unused.py", "");
        let policy = PrunePolicy {
            expand_scope: Some(["inside".to_string()].into_iter().collect()),
            ..PrunePolicy::minimal()
        };
        let mut builder = GraphBuilder::new(snapshot(store), policy).unwrap();
        let out = builder.build(&[EntryPoint::new("entry.py")]).unwrap();
        assert!(has(&out, "outside/deep.py"));
        assert!(has(&out, "inside/core.py"));
        assert!(!has(&out, "inside/unused.py"));
    }

    #[test]
    fn test_entry_outside_root() {
        let store = InMemoryPackageStore::new()
            .with_file("/work/run.py", "import pkg\n")
            .with_file("pkg/__init__.py", "");
        let out = build(store, &["/work/run.py"]);
        assert!(has(&out, "pkg/__init__.py"));
    }

    #[test]
    fn test_unknown_entry_fails() {
        let store = InMemoryPackageStore::new().with_file("a.py", "");
        let mut builder = GraphBuilder::new(snapshot(store), PrunePolicy::minimal()).unwrap();
        assert!(matches!(
            builder.build(&[EntryPoint::new("nope.py")]),
            Err(BuildError::EntryNotFound(_))
        ));
    }
}
