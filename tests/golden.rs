//! Golden tests for the prune kernel.
//!
//! These tests verify determinism and correctness of closure building and
//! tagging over in-memory package trees.

use std::sync::Arc;

use prune_kernel::{
    CanonicalPath, Confidence, EntryPoint, GraphBuilder, GraphExport, InMemoryPackageStore, PackageSnapshot,
    PrunePolicy, PruneSession, Pruner, ResolutionKind, RuntimeHint, Tag, TagReason, TagSet, Tagger,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn store(files: &[(&str, &str)]) -> InMemoryPackageStore {
    files
        .iter()
        .fold(InMemoryPackageStore::new(), |s, (path, text)| s.with_file(path, *text))
}

fn snapshot(files: &[(&str, &str)]) -> Arc<PackageSnapshot> {
    Arc::new(PackageSnapshot::capture(Arc::new(store(files))).unwrap())
}

fn tag_tree(files: &[(&str, &str)], entry: &str, policy: &PrunePolicy) -> (TagSet, GraphExport) {
    let snap = snapshot(files);
    let mut builder = GraphBuilder::new(Arc::clone(&snap), policy.clone()).unwrap();
    let out = builder.build(&[EntryPoint::new(entry)]).unwrap();
    let tags = Tagger::new(&out.graph, &snap).tag();
    let export = GraphExport::new(&out.graph, &tags, snap.snapshot_id(), &policy.params_hash()).unwrap();
    (tags, export)
}

fn state(tags: &TagSet, path: &str) -> (Tag, Option<Confidence>) {
    let entry = tags.get(&CanonicalPath::new(path)).unwrap();
    (entry.tag, entry.confidence)
}

const SCENARIO: &[(&str, &str)] = &[
    ("main.py", "import alpha\n"),
    ("alpha/__init__.py", "from .beta import *\n"),
    ("alpha/beta.py", "from .gamma import compute\n"),
    ("alpha/gamma.cpython-311-x86_64-linux-gnu.so", "\x7fELF"),
    ("alpha/gamma.dat", "weights"),
    ("alpha/unused.py", "import json\n"),
    ("delta/__init__.py", "from .core import *\n"),
    ("delta/core.py", ""),
];

const WIDE: &[(&str, &str)] = &[
    ("app.py", "import lib\nfrom lib import io, fmt\nimport missing\n"),
    ("lib/__init__.py", "__all__ = ['io', 'fmt']\nfrom .io import *\n"),
    ("lib/io.py", "import lib.fmt\nDATA = 'table.csv'\n"),
    ("lib/fmt.py", "def later():\n    import lib.extra\n"),
    ("lib/extra.py", ""),
    ("lib/table.csv", "a,b\n"),
    ("lib/__pycache__/io.cpython-311.pyc", ""),
    ("other/__init__.py", ""),
];

// ─────────────────────────────────────────────────────────────────────────────
// DETERMINISM TESTS
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_same_tree_same_export_bytes_10_runs() {
    let policy = PrunePolicy::default();
    let (_, first) = tag_tree(WIDE, "app.py", &policy);
    let first_bytes = first.to_bytes().unwrap();
    for _ in 0..10 {
        let (_, again) = tag_tree(WIDE, "app.py", &policy);
        assert_eq!(again.to_bytes().unwrap(), first_bytes);
        assert_eq!(again.graph_hash, first.graph_hash);
    }
}

#[test]
fn test_file_order_does_not_change_export() {
    let policy = PrunePolicy::default();
    let mut reversed: Vec<(&str, &str)> = WIDE.to_vec();
    reversed.reverse();
    let (_, a) = tag_tree(WIDE, "app.py", &policy);
    let (_, b) = tag_tree(&reversed, "app.py", &policy);
    assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
}

#[test]
fn test_policy_change_changes_graph_hash() {
    let (_, a) = tag_tree(WIDE, "app.py", &PrunePolicy::default());
    let other = PrunePolicy {
        scan_data_literals: false,
        ..PrunePolicy::default()
    };
    let (_, b) = tag_tree(WIDE, "app.py", &other);
    assert_ne!(a.graph_hash, b.graph_hash);
    assert_ne!(a.policy_hash, b.policy_hash);
}

#[test]
fn test_content_change_changes_graph_hash() {
    let (_, a) = tag_tree(WIDE, "app.py", &PrunePolicy::default());
    let mut edited: Vec<(&str, &str)> = WIDE.to_vec();
    edited[4] = ("lib/extra.py", "VALUE = 1\n");
    let (_, b) = tag_tree(&edited, "app.py", &PrunePolicy::default());
    assert_ne!(a.snapshot_id, b.snapshot_id);
    assert_ne!(a.graph_hash, b.graph_hash);
}

// ─────────────────────────────────────────────────────────────────────────────
// CORRECTNESS TESTS
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_wildcard_compiled_data_scenario() {
    let (tags, _) = tag_tree(SCENARIO, "main.py", &PrunePolicy::default());

    assert_eq!(state(&tags, "main.py"), (Tag::Reachable, Some(Confidence::Certain)));
    assert_eq!(state(&tags, "alpha/__init__.py"), (Tag::Reachable, Some(Confidence::Certain)));
    assert_eq!(state(&tags, "alpha/beta.py"), (Tag::Reachable, Some(Confidence::Probable)));
    assert_eq!(
        state(&tags, "alpha/gamma.cpython-311-x86_64-linux-gnu.so"),
        (Tag::Reachable, Some(Confidence::Probable))
    );
    assert_eq!(tags.tag(&"alpha/gamma.dat".into()), Tag::Reachable);
    assert!(matches!(
        tags.get(&"alpha/gamma.dat".into()).map(|e| &e.reason),
        Some(TagReason::Edge { kind: ResolutionKind::CoUnit, .. })
    ));

    let unreachable: Vec<_> = tags.paths_with(Tag::Unreachable).into_iter().map(CanonicalPath::as_str).collect();
    assert_eq!(unreachable, vec!["alpha/unused.py", "delta/__init__.py", "delta/core.py"]);
    assert_eq!(tags.count(Tag::Reachable), 5);
}

#[test]
fn test_cycle_closure_is_complete() {
    let files = [
        ("a.py", "import b\n"),
        ("b.py", "import c\n"),
        ("c.py", "import a\nimport d\n"),
        ("d.py", ""),
        ("e.py", "import a\n"),
    ];
    let (tags, export) = tag_tree(&files, "a.py", &PrunePolicy::default());
    for path in ["a.py", "b.py", "c.py", "d.py"] {
        assert_eq!(state(&tags, path), (Tag::Reachable, Some(Confidence::Certain)), "{path}");
    }
    assert_eq!(tags.tag(&"e.py".into()), Tag::Unreachable);
    assert_eq!(export.nodes.len(), 4);
    assert_eq!(export.edges.len(), 4);
}

#[test]
fn test_diamond_interns_shared_node_once() {
    let files = [
        ("top.py", "import left\nimport right\n"),
        ("left.py", "import base\n"),
        ("right.py", "import base\n"),
        ("base.py", ""),
    ];
    let (_, export) = tag_tree(&files, "top.py", &PrunePolicy::default());
    let base: Vec<_> = export.nodes.iter().filter(|n| n.path.as_str() == "base.py").collect();
    assert_eq!(base.len(), 1);
    let into_base = export
        .edges
        .iter()
        .filter(|e| e.target.as_ref().map(CanonicalPath::as_str) == Some("base.py"))
        .count();
    assert_eq!(into_base, 2);
}

#[test]
fn test_unknown_only_nodes_are_kept() {
    let (tags, export) = tag_tree(WIDE, "app.py", &PrunePolicy::default());
    assert_eq!(tags.tag(&"lib/extra.py".into()), Tag::Ambiguous);
    assert!(export.edges.iter().any(|e| e.unresolved.as_deref() == Some("missing")));

    let snap = snapshot(WIDE);
    let mut builder = GraphBuilder::new(Arc::clone(&snap), PrunePolicy::default()).unwrap();
    let out = builder.build(&[EntryPoint::new("app.py")]).unwrap();
    let tags = Tagger::new(&out.graph, &snap).tag();
    let plan = Pruner::new(snap, PrunePolicy::default()).plan(&tags, &out.incidents);
    let deleted: Vec<_> = plan.deletions.iter().map(|d| d.path.as_str()).collect();
    assert_eq!(deleted, vec!["other/__init__.py"]);
    assert_eq!(plan.report.ambiguous, vec![CanonicalPath::new("lib/extra.py")]);
}

#[test]
fn test_data_and_bytecode_follow_their_source() {
    let (tags, _) = tag_tree(WIDE, "app.py", &PrunePolicy::default());
    assert_eq!(state(&tags, "lib/table.csv"), (Tag::Reachable, Some(Confidence::Probable)));
    assert_eq!(
        state(&tags, "lib/__pycache__/io.cpython-311.pyc"),
        (Tag::Reachable, Some(Confidence::Certain))
    );
}

#[test]
fn test_hint_upgrades_ambiguous_to_reachable() {
    let mut session =
        PruneSession::from_store(Arc::new(store(WIDE)), vec![EntryPoint::new("app.py")], PrunePolicy::default())
            .unwrap();
    assert_eq!(session.tags().tag(&"lib/extra.py".into()), Tag::Ambiguous);
    session.merge_hints(&[RuntimeHint::new("lib/extra.py")]).unwrap();
    assert_eq!(
        state(&session.tags(), "lib/extra.py"),
        (Tag::Reachable, Some(Confidence::Certain))
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// HINT MERGE PROPERTIES
// ─────────────────────────────────────────────────────────────────────────────

mod hint_properties {
    use super::*;
    use proptest::prelude::*;

    const TREE: &[(&str, &str)] = &[
        ("entry.py", "import pkg\n"),
        ("pkg/__init__.py", "def load():\n    import pkg.a\n"),
        ("pkg/a.py", "import pkg.b\n"),
        ("pkg/b.py", "from . import c\n"),
        ("pkg/c.py", ""),
        ("pkg/d.py", "import pkg.a\n"),
        ("solo.py", ""),
        ("data/blob.bin", ""),
    ];

    const CANDIDATES: &[&str] = &[
        "pkg/a.py",
        "pkg/b.py",
        "pkg/c.py",
        "pkg/d.py",
        "solo.py",
        "data/blob.bin",
        "missing.py",
        "../escape.py",
    ];

    fn hints() -> impl Strategy<Value = Vec<RuntimeHint>> {
        prop::collection::vec(prop::sample::select(CANDIDATES), 0..6)
            .prop_map(|paths| paths.into_iter().map(RuntimeHint::new).collect())
    }

    fn session() -> PruneSession {
        PruneSession::from_store(Arc::new(store(TREE)), vec![EntryPoint::new("entry.py")], PrunePolicy::default())
            .unwrap()
    }

    fn states(session: &PruneSession) -> Vec<(CanonicalPath, Tag, Option<Confidence>)> {
        session
            .tags()
            .iter()
            .map(|(path, entry)| (path.clone(), entry.tag, entry.confidence))
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn hint_merge_is_idempotent(a in hints()) {
            let mut once = session();
            once.merge_hints(&a).unwrap();
            let mut twice = session();
            twice.merge_hints(&a).unwrap();
            twice.merge_hints(&a).unwrap();
            prop_assert_eq!(states(&once), states(&twice));
            prop_assert_eq!(once.graph().edge_count(), twice.graph().edge_count());
        }

        #[test]
        fn hint_merge_is_commutative(a in hints(), b in hints()) {
            let mut ab = session();
            ab.merge_hints(&a).unwrap();
            ab.merge_hints(&b).unwrap();
            let mut ba = session();
            ba.merge_hints(&b).unwrap();
            ba.merge_hints(&a).unwrap();
            prop_assert_eq!(states(&ab), states(&ba));
        }

        #[test]
        fn hints_never_downgrade_reachable(a in hints()) {
            let before = session();
            let mut after = session();
            after.merge_hints(&a).unwrap();
            let after_tags = after.tags();
            for (path, entry) in before.tags().iter() {
                prop_assert!(after_tags.tag(path) >= entry.tag);
            }
        }
    }
}
