//! Reachability tagging.
//!
//! A file is reachable iff it is an entry, a runtime-hinted file, a
//! promoted file, or reached over a certain/probable edge from a reachable
//! file. Its recorded confidence is the strongest path confidence: nodes
//! reached over certain edges alone are `Certain`, the rest `Probable`.
//! Files touched only by unknown edges from reachable files are ambiguous.
//! Everything else in the snapshot is unreachable.

use std::collections::VecDeque;

use crate::graph::DependencyGraph;
use crate::snapshot::PackageSnapshot;
use crate::types::{Confidence, NodeHandle, Tag, TagReason, TagSet};

/// Computes a [`TagSet`] from a graph and the snapshot it was built from.
#[derive(Debug, Clone, Copy)]
pub struct Tagger<'a> {
    graph: &'a DependencyGraph,
    snapshot: &'a PackageSnapshot,
}

impl<'a> Tagger<'a> {
    /// Create a tagger.
    pub fn new(graph: &'a DependencyGraph, snapshot: &'a PackageSnapshot) -> Self {
        Self { graph, snapshot }
    }

    /// Tag every graph node and every snapshot file.
    pub fn tag(&self) -> TagSet {
        let graph = self.graph;
        let mut tags = TagSet::new();
        let runtime = graph.runtime_root();

        let mut seeds: Vec<(NodeHandle, TagReason)> = Vec::new();
        for &root in graph.roots() {
            seeds.push((root, TagReason::Entry));
        }
        for &hinted in graph.hinted() {
            seeds.push((hinted, TagReason::RuntimeHint));
        }
        for &promoted in graph.promoted() {
            seeds.push((promoted, TagReason::ManualOverride));
        }
        for (handle, reason) in &seeds {
            tags.raise(
                graph.path(*handle).clone(),
                Tag::Reachable,
                Some(Confidence::Certain),
                reason.clone(),
            );
        }
        let starts: Vec<NodeHandle> = seeds.iter().map(|(h, _)| *h).collect();

        let mut reached = vec![false; graph.node_count()];
        self.propagate(&starts, Confidence::Certain, &mut reached, &mut tags);
        let certain: Vec<NodeHandle> = (0..reached.len())
            .filter(|&i| reached[i])
            .map(|i| NodeHandle::new(i as u32))
            .collect();
        self.propagate(&certain, Confidence::Probable, &mut reached, &mut tags);

        for (handle, node) in graph.nodes() {
            if !reached[handle.index()] || Some(handle) == runtime {
                continue;
            }
            for edge in graph.outgoing(handle) {
                if edge.confidence != Confidence::Unknown {
                    continue;
                }
                let Some(target) = edge.target.node() else {
                    continue;
                };
                if !reached[target.index()] {
                    tags.raise(
                        graph.path(target).clone(),
                        Tag::Ambiguous,
                        None,
                        TagReason::UnknownOnly {
                            from: node.path.clone(),
                        },
                    );
                }
            }
        }

        for (handle, node) in graph.nodes() {
            if Some(handle) == runtime {
                continue;
            }
            tags.raise(node.path.clone(), Tag::Unreachable, None, TagReason::NotPropagated);
        }
        for (path, _) in self.snapshot.files() {
            tags.raise(path.clone(), Tag::Unreachable, None, TagReason::NotReached);
        }

        tracing::info!(
            reachable = tags.count(Tag::Reachable),
            ambiguous = tags.count(Tag::Ambiguous),
            unreachable = tags.count(Tag::Unreachable),
            "Tagged package files"
        );
        tags
    }

    /// BFS over edges of at least `floor` confidence, tagging newly reached
    /// nodes `Reachable` with confidence `floor`.
    fn propagate(&self, starts: &[NodeHandle], floor: Confidence, reached: &mut [bool], tags: &mut TagSet) {
        let graph = self.graph;
        let runtime = graph.runtime_root();
        let mut queue: VecDeque<NodeHandle> = VecDeque::new();
        for &start in starts {
            reached[start.index()] = true;
            queue.push_back(start);
        }
        if let Some(root) = runtime {
            if !reached[root.index()] {
                reached[root.index()] = true;
                queue.push_back(root);
            }
        }

        while let Some(handle) = queue.pop_front() {
            for edge in graph.outgoing(handle) {
                if edge.confidence < floor {
                    continue;
                }
                let Some(target) = edge.target.node() else {
                    continue;
                };
                if reached[target.index()] {
                    continue;
                }
                reached[target.index()] = true;
                let reason = if Some(handle) == runtime {
                    TagReason::RuntimeHint
                } else {
                    TagReason::Edge {
                        from: graph.path(handle).clone(),
                        kind: edge.kind,
                    }
                };
                tags.raise(graph.path(target).clone(), Tag::Reachable, Some(floor), reason);
                queue.push_back(target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanonicalPath, EdgeTarget, ImportEdge, NodeKind, ResolutionKind};
    use crate::store::InMemoryPackageStore;
    use std::sync::Arc;

    fn snapshot(paths: &[&str]) -> PackageSnapshot {
        let store = paths
            .iter()
            .fold(InMemoryPackageStore::new(), |s, p| s.with_file(p, ""));
        PackageSnapshot::capture(Arc::new(store)).unwrap()
    }

    fn link(g: &mut DependencyGraph, a: &str, b: &str, confidence: Confidence) {
        let (ha, _) = g.intern(a.into(), NodeKind::Source, 0);
        let (hb, _) = g.intern(b.into(), NodeKind::Source, 0);
        g.add_edge(ImportEdge::new(ha, EdgeTarget::Node(hb), ResolutionKind::Direct, confidence, 1));
    }

    fn entry_of(tags: &TagSet, p: &str) -> (Tag, Option<Confidence>) {
        let e = tags.get(&CanonicalPath::new(p)).unwrap();
        (e.tag, e.confidence)
    }

    #[test]
    fn test_confidence_is_strongest_path() {
        let snap = snapshot(&["e.py", "a.py", "b.py", "c.py"]);
        let mut g = DependencyGraph::new();
        link(&mut g, "e.py", "a.py", Confidence::Certain);
        link(&mut g, "e.py", "b.py", Confidence::Probable);
        link(&mut g, "b.py", "c.py", Confidence::Certain);
        link(&mut g, "a.py", "c.py", Confidence::Certain);
        g.add_root(NodeHandle::new(0));

        let tags = Tagger::new(&g, &snap).tag();
        assert_eq!(entry_of(&tags, "e.py"), (Tag::Reachable, Some(Confidence::Certain)));
        assert_eq!(entry_of(&tags, "a.py"), (Tag::Reachable, Some(Confidence::Certain)));
        assert_eq!(entry_of(&tags, "b.py"), (Tag::Reachable, Some(Confidence::Probable)));
        assert_eq!(entry_of(&tags, "c.py"), (Tag::Reachable, Some(Confidence::Certain)));
    }

    #[test]
    fn test_unknown_only_is_ambiguous() {
        let snap = snapshot(&["e.py", "lazy.py", "island.py", "orphan.py"]);
        let mut g = DependencyGraph::new();
        link(&mut g, "e.py", "lazy.py", Confidence::Unknown);
        link(&mut g, "island.py", "lazy.py", Confidence::Certain);
        g.add_root(NodeHandle::new(0));

        let tags = Tagger::new(&g, &snap).tag();
        assert_eq!(tags.tag(&"lazy.py".into()), Tag::Ambiguous);
        assert_eq!(tags.tag(&"island.py".into()), Tag::Unreachable);
        assert_eq!(
            tags.get(&"island.py".into()).map(|e| e.reason.clone()),
            Some(TagReason::NotPropagated)
        );
        assert_eq!(
            tags.get(&"orphan.py".into()).map(|e| e.reason.clone()),
            Some(TagReason::NotReached)
        );
    }

    #[test]
    fn test_hints_and_promotions_are_reachable() {
        let snap = snapshot(&["e.py", "hinted.py", "dep.py", "promoted.py"]);
        let mut g = DependencyGraph::new();
        let (e, _) = g.intern("e.py".into(), NodeKind::Source, 0);
        g.add_root(e);
        link(&mut g, "hinted.py", "dep.py", Confidence::Probable);
        let hinted = g.handle(&"hinted.py".into()).unwrap();
        let runtime = g.ensure_runtime_root();
        g.add_edge(ImportEdge::runtime(runtime, hinted));
        g.mark_hinted(hinted);
        let (promoted, _) = g.intern("promoted.py".into(), NodeKind::Source, 0);
        g.promote(promoted);

        let tags = Tagger::new(&g, &snap).tag();
        assert_eq!(tags.get(&"hinted.py".into()).map(|e| e.reason.clone()), Some(TagReason::RuntimeHint));
        assert_eq!(entry_of(&tags, "dep.py"), (Tag::Reachable, Some(Confidence::Probable)));
        assert_eq!(
            tags.get(&"promoted.py".into()).map(|e| e.reason.clone()),
            Some(TagReason::ManualOverride)
        );
        assert!(tags.get(&CanonicalPath::runtime_root()).is_none());
    }
}
