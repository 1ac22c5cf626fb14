//! Performance benchmarks for closure building and tagging.
//!
//! Run with: `cargo bench --bench closure`
//!
//! ## Performance Targets
//!
//! | Operation | Target | Notes |
//! |-----------|--------|-------|
//! | Closure build | <100ms for 5k files | Cold resolver cache |
//! | Tagging | <10ms for 5k nodes | Two-pass propagation |
//! | Resolver lookup | <1µs | LRU cache hit |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use prune_kernel::{
    EntryPoint, GraphBuilder, GraphExport, InMemoryPackageStore, PackageSnapshot, PrunePolicy, Pruner, Resolver,
    Tagger,
};

/// A synthetic tree of `packages` packages with `modules` modules each.
///
/// Module `i` of package `p` imports module `i + 1` and every package
/// imports the next one from its `__init__.py`; a tenth of the modules are
/// never imported.
fn make_snapshot(packages: usize, modules: usize) -> Arc<PackageSnapshot> {
    let store = InMemoryPackageStore::new();
    store.add_file("main.py", "import pkg0\n");
    for p in 0..packages {
        let init = if p + 1 < packages {
            format!("from .m0 import *\nimport pkg{}\n", p + 1)
        } else {
            "from .m0 import *\n".to_string()
        };
        store.add_file(&format!("pkg{p}/__init__.py"), init);
        for m in 0..modules {
            let body = if m + 1 < modules && m % 10 != 8 {
                format!("from . import m{}\nVALUE = {m}\n", m + 1)
            } else {
                format!("VALUE = {m}\n")
            };
            store.add_file(&format!("pkg{p}/m{m}.py"), body);
        }
        store.add_file(&format!("pkg{p}/data/table.csv"), "a,b\n");
    }
    Arc::new(PackageSnapshot::capture(Arc::new(store)).expect("in-memory capture"))
}

/// Benchmark a full closure build.
fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("closure_build");

    for (packages, modules) in [(10, 10), (50, 20), (100, 50)] {
        let snapshot = make_snapshot(packages, modules);
        group.throughput(Throughput::Elements(snapshot.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("files", snapshot.len()),
            &snapshot,
            |b, snapshot| {
                b.iter(|| {
                    let mut builder =
                        GraphBuilder::new(Arc::clone(snapshot), PrunePolicy::default()).expect("builder");
                    builder.build(black_box(&[EntryPoint::new("main.py")])).expect("build")
                })
            },
        );
    }

    group.finish();
}

/// Benchmark tagging and planning over a prebuilt graph.
fn bench_tag_and_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("tag_and_plan");

    for (packages, modules) in [(10, 10), (100, 50)] {
        let snapshot = make_snapshot(packages, modules);
        let mut builder = GraphBuilder::new(Arc::clone(&snapshot), PrunePolicy::default()).expect("builder");
        let output = builder.build(&[EntryPoint::new("main.py")]).expect("build");
        let pruner = Pruner::new(Arc::clone(&snapshot), PrunePolicy::default());

        group.bench_with_input(
            BenchmarkId::new("nodes", output.graph.node_count()),
            &output,
            |b, output| {
                b.iter(|| {
                    let tags = Tagger::new(&output.graph, &snapshot).tag();
                    pruner.plan(black_box(&tags), &output.incidents)
                })
            },
        );
    }

    group.finish();
}

/// Benchmark the canonical export hash.
fn bench_export(c: &mut Criterion) {
    let snapshot = make_snapshot(100, 50);
    let policy = PrunePolicy::default();
    let mut builder = GraphBuilder::new(Arc::clone(&snapshot), policy.clone()).expect("builder");
    let output = builder.build(&[EntryPoint::new("main.py")]).expect("build");
    let tags = Tagger::new(&output.graph, &snapshot).tag();
    let policy_hash = policy.params_hash();

    c.bench_function("graph_export", |b| {
        b.iter(|| {
            GraphExport::new(
                black_box(&output.graph),
                &tags,
                snapshot.snapshot_id(),
                &policy_hash,
            )
            .expect("export")
        })
    });
}

/// Benchmark resolver lookups, cold and cached.
fn bench_resolver(c: &mut Criterion) {
    let snapshot = make_snapshot(100, 50);
    let mut group = c.benchmark_group("resolver_lookup");

    group.bench_function("cached", |b| {
        let resolver = Resolver::new(Arc::clone(&snapshot), 4096);
        resolver.lookup("pkg42.m17");
        b.iter(|| resolver.lookup(black_box("pkg42.m17")))
    });

    group.bench_function("cold", |b| {
        b.iter(|| {
            let resolver = Resolver::new(Arc::clone(&snapshot), 1);
            resolver.lookup(black_box("pkg42.m17"))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_build, bench_tag_and_plan, bench_export, bench_resolver);
criterion_main!(benches);
