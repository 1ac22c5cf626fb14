//! Runtime-hint merging.
//!
//! Hints are files an instrumented run actually loaded. Each accepted hint
//! hangs off the synthetic `<runtime>` root with a certain-confidence edge
//! and has its static closure expanded. Merging only ever adds nodes, edges
//! and hinted marks, so it is idempotent and the merge order does not
//! affect the resulting tags.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::builder::{BuildError, GraphBuilder};
use crate::graph::DependencyGraph;
use crate::snapshot::PackageSnapshot;
use crate::types::{CanonicalPath, ImportEdge, Incident, IncidentKind, NodeHandle, RuntimeHint};

/// Outcome of one merge call.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Hints newly attached to the runtime root.
    pub accepted: usize,
    /// Hints for files that were already hinted.
    pub duplicates: usize,
    /// Rejected hints and expansion incidents.
    pub incidents: Vec<Incident>,
}

impl MergeReport {
    /// Number of rejected hints.
    pub fn rejected(&self) -> usize {
        self.incidents
            .iter()
            .filter(|i| matches!(i.kind, IncidentKind::HintRejected { .. }))
            .count()
    }
}

/// Merges runtime hints into a dependency graph.
#[derive(Debug, Clone, Default)]
pub struct HintMerger {
    root: Option<PathBuf>,
}

impl HintMerger {
    /// Merger for a snapshot; absolute hint paths are made relative to the
    /// store's root directory when it has one.
    pub fn for_snapshot(snapshot: &PackageSnapshot) -> Self {
        Self {
            root: snapshot.store().root_dir().map(Path::to_path_buf),
        }
    }

    /// Normalize a hint path to a canonical path inside the package root.
    pub fn normalize(&self, raw: &str) -> Result<CanonicalPath, String> {
        let path = Path::new(raw);
        if !path.is_absolute() {
            let mut depth: i64 = 0;
            for segment in raw.replace('\\', "/").split('/') {
                match segment {
                    "" | "." => {}
                    ".." => depth -= 1,
                    _ => depth += 1,
                }
                if depth < 0 {
                    return Err("path escapes the package root".to_string());
                }
            }
            return Ok(CanonicalPath::new(raw));
        }
        let Some(root) = &self.root else {
            return Err("absolute path but the package root is not on disk".to_string());
        };
        match path.strip_prefix(root) {
            Ok(rel) => Ok(CanonicalPath::new(rel.to_string_lossy())),
            Err(_) => Err(format!("outside package root {}", root.display())),
        }
    }

    /// Merge `hints` into `graph`, expanding each hinted file's closure.
    pub fn merge(
        &self,
        graph: &mut DependencyGraph,
        builder: &mut GraphBuilder,
        hints: &[RuntimeHint],
    ) -> Result<MergeReport, BuildError> {
        let snapshot = Arc::clone(builder.snapshot());
        let mut report = MergeReport::default();
        let mut seeds: Vec<NodeHandle> = Vec::new();

        for hint in hints {
            let path = match self.normalize(&hint.path) {
                Ok(path) => path,
                Err(reason) => {
                    report.incidents.push(reject(&hint.path, reason));
                    continue;
                }
            };
            let Some(meta) = snapshot.meta(&path) else {
                report
                    .incidents
                    .push(reject(&hint.path, "not present in the snapshot".to_string()));
                continue;
            };

            let (handle, _) = graph.intern(path, meta.kind, meta.size);
            let runtime = graph.ensure_runtime_root();
            graph.add_edge(ImportEdge::runtime(runtime, handle));
            if graph.mark_hinted(handle) {
                report.accepted += 1;
            } else {
                report.duplicates += 1;
            }
            if !graph.is_expanded(handle) {
                seeds.push(handle);
            }
        }

        if !seeds.is_empty() {
            let (incidents, stats) = builder.expand_from(graph, seeds)?;
            report.incidents.extend(incidents);
            tracing::debug!(expanded = stats.expanded, "Expanded hinted closures");
        }

        tracing::info!(
            accepted = report.accepted,
            duplicates = report.duplicates,
            rejected = report.rejected(),
            "Merged runtime hints"
        );
        Ok(report)
    }
}

fn reject(path: &str, reason: String) -> Incident {
    Incident::record(
        IncidentKind::HintRejected {
            path: path.to_string(),
            reason,
        },
        "hint_merger",
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Async trace collection
// ─────────────────────────────────────────────────────────────────────────────

/// Collection state of a runtime trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    /// The producer is still running; tags are provisional.
    Collecting,
    /// The producer closed its channel.
    Complete,
}

/// Shared buffer between a [`HintCollector`] and the session merging hints.
#[derive(Debug, Default)]
pub struct TraceInbox {
    pending: Mutex<Vec<RuntimeHint>>,
    received: AtomicUsize,
    complete: AtomicBool,
}

impl TraceInbox {
    /// Create an inbox in the collecting state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a hint.
    pub fn push(&self, hint: RuntimeHint) {
        self.pending.lock().push(hint);
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    /// Take every queued hint.
    pub fn drain(&self) -> Vec<RuntimeHint> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Hints queued but not yet drained.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Total hints received so far.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Mark the trace complete.
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    /// Current status.
    pub fn status(&self) -> TraceStatus {
        if self.complete.load(Ordering::SeqCst) {
            TraceStatus::Complete
        } else {
            TraceStatus::Collecting
        }
    }
}

/// Consumes hints from a long-running trace producer.
#[derive(Debug)]
pub struct HintCollector {
    inbox: Arc<TraceInbox>,
    rx: mpsc::Receiver<RuntimeHint>,
}

impl HintCollector {
    /// Create a channel of `capacity` and the collector draining it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<RuntimeHint>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let collector = Self {
            inbox: Arc::new(TraceInbox::new()),
            rx,
        };
        (tx, collector)
    }

    /// Inbox the collector fills.
    pub fn inbox(&self) -> Arc<TraceInbox> {
        Arc::clone(&self.inbox)
    }

    /// Receive until every sender is dropped, then mark the trace complete.
    pub async fn run(mut self) -> usize {
        while let Some(hint) = self.rx.recv().await {
            tracing::trace!(path = %hint.path, "Runtime hint received");
            self.inbox.push(hint);
        }
        self.inbox.mark_complete();
        let received = self.inbox.received();
        tracing::info!(received, "Runtime trace complete");
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::EntryPoint;
    use crate::policy::PrunePolicy;
    use crate::store::InMemoryPackageStore;

    fn setup() -> (DependencyGraph, GraphBuilder) {
        let store = InMemoryPackageStore::new()
            .with_file("entry.py", "def late():\n    import plugin\n")
            .with_file("plugin.py", "import helper\n")
            .with_file("helper.py", "")
            .with_file("unused.py", "");
        let snapshot = Arc::new(PackageSnapshot::capture(Arc::new(store)).unwrap());
        let mut builder = GraphBuilder::new(snapshot, PrunePolicy::minimal()).unwrap();
        let out = builder.build(&[EntryPoint::new("entry.py")]).unwrap();
        (out.graph, builder)
    }

    #[test]
    fn test_hint_expands_closure() {
        let (mut graph, mut builder) = setup();
        assert!(graph.handle(&"helper.py".into()).is_none());

        let report = HintMerger::default()
            .merge(&mut graph, &mut builder, &[RuntimeHint::new("plugin.py")])
            .unwrap();
        assert_eq!(report.accepted, 1);
        let plugin = graph.handle(&"plugin.py".into()).unwrap();
        assert!(graph.hinted().contains(&plugin));
        assert!(graph.is_expanded(plugin));
        assert!(graph.handle(&"helper.py".into()).is_some());

        let runtime = graph.runtime_root().unwrap();
        assert_eq!(graph.outgoing(runtime).count(), 1);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (mut graph, mut builder) = setup();
        let merger = HintMerger::default();
        let hints = [RuntimeHint::new("plugin.py")];
        merger.merge(&mut graph, &mut builder, &hints).unwrap();
        let edges = graph.edge_count();
        let nodes = graph.node_count();

        let again = merger.merge(&mut graph, &mut builder, &hints).unwrap();
        assert_eq!(again.accepted, 0);
        assert_eq!(again.duplicates, 1);
        assert_eq!(graph.edge_count(), edges);
        assert_eq!(graph.node_count(), nodes);
    }

    #[test]
    fn test_rejected_hints() {
        let (mut graph, mut builder) = setup();
        let report = HintMerger::default()
            .merge(
                &mut graph,
                &mut builder,
                &[RuntimeHint::new("missing.py"), RuntimeHint::new("/usr/lib/python3/os.py")],
            )
            .unwrap();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.rejected(), 2);
        assert!(graph.runtime_root().is_none());
    }

    #[test]
    fn test_normalize_against_root() {
        let merger = HintMerger {
            root: Some(PathBuf::from("/site-packages")),
        };
        assert_eq!(
            merger.normalize("/site-packages/pkg/a.py").unwrap().as_str(),
            "pkg/a.py"
        );
        assert_eq!(merger.normalize("./pkg/a.py").unwrap().as_str(), "pkg/a.py");
        assert!(merger.normalize("/elsewhere/a.py").is_err());
        assert!(merger.normalize("../a.py").is_err());
    }

    #[tokio::test]
    async fn test_collector_completes_when_channel_closes() {
        let (tx, collector) = HintCollector::channel(4);
        let inbox = collector.inbox();
        let task = tokio::spawn(collector.run());

        tx.send(RuntimeHint::new("a.py")).await.unwrap();
        tx.send(RuntimeHint::new("b.py")).await.unwrap();
        drop(tx);

        assert_eq!(task.await.unwrap(), 2);
        assert_eq!(inbox.status(), TraceStatus::Complete);
        let drained = inbox.drain();
        assert_eq!(drained.len(), 2);
        assert!(inbox.drain().is_empty());
    }
}
