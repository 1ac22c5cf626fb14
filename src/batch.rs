//! Parallel multi-entry analysis.
//!
//! Each entry is built and tagged independently on a blocking task; the
//! tasks share one read-only snapshot and resolver cache. Results come back
//! in entry order whatever order the tasks finish in, and a registry of
//! per-entry graph hashes fingerprints the batch.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::builder::{BuildError, EntryPoint, GraphBuilder};
use crate::canonical::canonical_hash_hex;
use crate::emitter::{EmitError, GraphExport};
use crate::graph::DependencyGraph;
use crate::policy::PrunePolicy;
use crate::resolver::Resolver;
use crate::snapshot::PackageSnapshot;
use crate::tagger::Tagger;
use crate::types::{CanonicalPath, Incident, Tag, TagSet};

/// Errors from a batch run.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Building one entry's closure failed.
    #[error("closure of {entry} failed: {source}")]
    Build {
        /// Entry path.
        entry: String,
        /// Underlying error.
        source: BuildError,
    },

    /// Hashing one entry's graph failed.
    #[error(transparent)]
    Emit(#[from] EmitError),

    /// A worker task panicked or was aborted.
    #[error("analysis task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Entry set with a deterministic hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySet {
    /// Entries, sorted and deduplicated.
    pub entries: Vec<CanonicalPath>,
    /// Hash of the entry list.
    pub entry_set_hash: String,
}

impl EntrySet {
    /// Create from entry points.
    pub fn new(entries: &[EntryPoint]) -> Result<Self, EmitError> {
        let mut paths: Vec<CanonicalPath> = entries.iter().map(|e| e.path.clone()).collect();
        paths.sort();
        paths.dedup();
        let entry_set_hash = canonical_hash_hex(&paths)?;
        Ok(Self {
            entries: paths,
            entry_set_hash,
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registry line for one analysed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRegistryEntry {
    /// Entry path.
    pub entry: CanonicalPath,
    /// Graph export hash.
    pub graph_hash: String,
    /// Nodes in the closure.
    pub node_count: usize,
    /// Edges in the closure.
    pub edge_count: usize,
    /// Reachable files.
    pub reachable: usize,
}

/// One entry's graph and tags.
#[derive(Debug, Clone)]
pub struct EntryAnalysis {
    /// Entry path.
    pub entry: CanonicalPath,
    /// Its closure.
    pub graph: DependencyGraph,
    /// Its tags.
    pub tags: TagSet,
    /// Incidents raised while building.
    pub incidents: Vec<Incident>,
}

/// Output of [`BatchAnalyzer::analyze_all`].
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Snapshot analysed.
    pub snapshot_id: String,
    /// Hash of the entry set.
    pub entry_set_hash: String,
    /// Policy id.
    pub policy_id: String,
    /// Policy hash.
    pub policy_hash: String,
    /// Per-entry results, in entry order.
    pub analyses: Vec<EntryAnalysis>,
    /// Per-entry registry, in entry order.
    pub registry: Vec<EntryRegistryEntry>,
    /// Hash of the registry.
    pub registry_hash: String,
}

impl BatchResult {
    /// Tags that keep a file if any entry needs it.
    pub fn union_tags(&self) -> TagSet {
        let mut union = TagSet::new();
        for analysis in &self.analyses {
            union.union_with(&analysis.tags);
        }
        union
    }
}

/// Analyses many entries against one snapshot in parallel.
#[derive(Debug, Clone)]
pub struct BatchAnalyzer {
    resolver: Arc<Resolver>,
    policy: PrunePolicy,
}

impl BatchAnalyzer {
    /// Create an analyzer with a shared resolver.
    pub fn new(snapshot: Arc<PackageSnapshot>, policy: PrunePolicy) -> Self {
        let resolver = Arc::new(Resolver::new(snapshot, policy.resolver_cache_size));
        Self { resolver, policy }
    }

    /// Policy in use.
    pub fn policy(&self) -> &PrunePolicy {
        &self.policy
    }

    /// Build and tag every entry, one blocking task each.
    pub async fn analyze_all(&self, entries: &[EntryPoint]) -> Result<BatchResult, BatchError> {
        let snapshot = Arc::clone(self.resolver.snapshot());
        let policy_hash = self.policy.params_hash();

        let tasks: Vec<_> = entries
            .iter()
            .cloned()
            .map(|entry| {
                let resolver = Arc::clone(&self.resolver);
                let policy = self.policy.clone();
                tokio::task::spawn_blocking(move || analyze_one(resolver, policy, entry))
            })
            .collect();

        let mut analyses = Vec::with_capacity(tasks.len());
        let mut registry = Vec::with_capacity(tasks.len());
        for task in tasks {
            let analysis = task.await??;
            let export = GraphExport::new(
                &analysis.graph,
                &analysis.tags,
                snapshot.snapshot_id(),
                &policy_hash,
            )?;
            registry.push(EntryRegistryEntry {
                entry: analysis.entry.clone(),
                graph_hash: export.graph_hash,
                node_count: export.nodes.len(),
                edge_count: export.edges.len(),
                reachable: analysis.tags.count(Tag::Reachable),
            });
            analyses.push(analysis);
        }

        let registry_hash = canonical_hash_hex(&registry).map_err(EmitError::from)?;
        let entry_set = EntrySet::new(entries)?;
        tracing::info!(
            entries = analyses.len(),
            entry_set_hash = %entry_set.entry_set_hash,
            registry_hash = %registry_hash,
            "Batch analysis complete"
        );

        Ok(BatchResult {
            snapshot_id: snapshot.snapshot_id().to_string(),
            entry_set_hash: entry_set.entry_set_hash,
            policy_id: self.policy.policy_id().to_string(),
            policy_hash,
            analyses,
            registry,
            registry_hash,
        })
    }
}

fn analyze_one(resolver: Arc<Resolver>, policy: PrunePolicy, entry: EntryPoint) -> Result<EntryAnalysis, BatchError> {
    let build_err = |source| BatchError::Build {
        entry: entry.path.to_string(),
        source,
    };
    let snapshot = Arc::clone(resolver.snapshot());
    let mut builder = GraphBuilder::with_resolver(resolver, policy).map_err(build_err)?;
    let output = builder.build(std::slice::from_ref(&entry)).map_err(build_err)?;
    let tags = Tagger::new(&output.graph, &snapshot).tag();
    tracing::debug!(entry = %entry.path, nodes = output.graph.node_count(), "Analysed entry");
    Ok(EntryAnalysis {
        entry: entry.path,
        graph: output.graph,
        tags,
        incidents: output.incidents,
    })
}
