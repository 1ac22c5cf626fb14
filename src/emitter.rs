//! Artifact emission.
//!
//! Serializes the graph, tag set and run reports into versioned JSON files
//! and ties them together with a manifest carrying each artifact's hash and
//! the snapshot id. The graph export is canonical: nodes and edges are
//! sorted and it carries no timestamps, so two runs over the same snapshot,
//! entries and policy produce byte-identical exports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::canonical::canonical_hash_hex;
use crate::graph::DependencyGraph;
use crate::manifest::PrunedManifest;
use crate::patcher::PatchReport;
use crate::pruner::{ImpactReport, PruneRecord};
use crate::types::{CanonicalPath, Confidence, EdgeTarget, NodeHandle, NodeKind, ResolutionKind, Tag, TagSet};
use crate::PRUNE_KERNEL_SCHEMA_VERSION;

/// Errors emitting artifacts.
#[derive(Debug, Error)]
pub enum EmitError {
    /// A required artifact was not supplied to the bundler.
    #[error("missing required artifact: {0}")]
    Missing(&'static str),

    /// Serialization failed.
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Writing an artifact failed.
    #[error("failed to write {path}: {source}")]
    Io {
        /// Artifact path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Graph export
// ─────────────────────────────────────────────────────────────────────────────

/// One node of the export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportNode {
    /// Canonical path.
    pub path: CanonicalPath,
    /// File kind.
    pub kind: NodeKind,
    /// Reachability tag.
    pub tag: Tag,
    /// Confidence for reachable nodes.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub confidence: Option<Confidence>,
    /// Size in bytes.
    pub size: u64,
}

/// One edge of the export.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExportEdge {
    /// Importer path.
    pub source: CanonicalPath,
    /// Target path, for resolved edges.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target: Option<CanonicalPath>,
    /// Reference text, for unresolved edges.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unresolved: Option<String>,
    /// Resolution kind.
    pub kind: ResolutionKind,
    /// Confidence.
    pub confidence: Confidence,
    /// Source line.
    pub line: u32,
}

#[derive(Serialize)]
struct GraphHashInput<'a> {
    schema_version: &'a str,
    snapshot_id: &'a str,
    policy_hash: &'a str,
    roots: &'a [CanonicalPath],
    hinted: &'a [CanonicalPath],
    promoted: &'a [CanonicalPath],
    nodes: &'a [ExportNode],
    edges: &'a [ExportEdge],
}

/// Canonical, hashed export of a tagged dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphExport {
    /// Schema version.
    pub schema_version: String,
    /// Snapshot the graph was built from.
    pub snapshot_id: String,
    /// Policy hash used.
    pub policy_hash: String,
    /// Entry nodes.
    pub roots: Vec<CanonicalPath>,
    /// Runtime-hinted nodes.
    pub hinted: Vec<CanonicalPath>,
    /// Manually promoted nodes.
    pub promoted: Vec<CanonicalPath>,
    /// Nodes sorted by path (the synthetic runtime root is omitted).
    pub nodes: Vec<ExportNode>,
    /// Edges sorted by (source, target, kind, confidence, line).
    pub edges: Vec<ExportEdge>,
    /// Hash of everything above.
    pub graph_hash: String,
}

impl GraphExport {
    /// Export `graph` with `tags`.
    pub fn new(
        graph: &DependencyGraph,
        tags: &TagSet,
        snapshot_id: &str,
        policy_hash: &str,
    ) -> Result<Self, EmitError> {
        let runtime = graph.runtime_root();

        let mut nodes: Vec<ExportNode> = graph
            .nodes()
            .filter(|(h, _)| Some(*h) != runtime)
            .map(|(_, node)| {
                let entry = tags.get(&node.path);
                ExportNode {
                    path: node.path.clone(),
                    kind: node.kind,
                    tag: entry.map(|e| e.tag).unwrap_or(Tag::Unreachable),
                    confidence: entry.and_then(|e| e.confidence),
                    size: node.size,
                }
            })
            .collect();
        nodes.sort_by(|a, b| a.path.cmp(&b.path));

        let mut edges: Vec<ExportEdge> = graph
            .edges()
            .iter()
            .map(|edge| {
                let (target, unresolved) = match &edge.target {
                    EdgeTarget::Node(h) => (Some(graph.path(*h).clone()), None),
                    EdgeTarget::Unresolved(text) => (None, Some(text.clone())),
                };
                ExportEdge {
                    source: graph.path(edge.source).clone(),
                    target,
                    unresolved,
                    kind: edge.kind,
                    confidence: edge.confidence,
                    line: edge.line,
                }
            })
            .collect();
        edges.sort();

        let roots = sorted_paths(graph, graph.roots().iter().copied());
        let hinted = sorted_paths(graph, graph.hinted().iter().copied());
        let promoted = sorted_paths(graph, graph.promoted().iter().copied());

        let graph_hash = canonical_hash_hex(&GraphHashInput {
            schema_version: PRUNE_KERNEL_SCHEMA_VERSION,
            snapshot_id,
            policy_hash,
            roots: &roots,
            hinted: &hinted,
            promoted: &promoted,
            nodes: &nodes,
            edges: &edges,
        })?;

        Ok(Self {
            schema_version: PRUNE_KERNEL_SCHEMA_VERSION.to_string(),
            snapshot_id: snapshot_id.to_string(),
            policy_hash: policy_hash.to_string(),
            roots,
            hinted,
            promoted,
            nodes,
            edges,
            graph_hash,
        })
    }

    /// Pretty JSON with a trailing newline.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EmitError> {
        to_artifact_bytes(self)
    }
}

fn sorted_paths(graph: &DependencyGraph, handles: impl Iterator<Item = NodeHandle>) -> Vec<CanonicalPath> {
    let mut paths: Vec<CanonicalPath> = handles.map(|h| graph.path(h).clone()).collect();
    paths.sort();
    paths
}

fn to_artifact_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, EmitError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ─────────────────────────────────────────────────────────────────────────────
// Bundle
// ─────────────────────────────────────────────────────────────────────────────

/// File names of the emitted artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    /// Graph export.
    pub import_graph: String,
    /// Impact report.
    pub impact_report: String,
    /// Pruned requirement manifest.
    pub pruned_requirements: String,
    /// Surviving requirements as a plain listing.
    pub pruned_requirements_txt: String,
    /// Prune record (undo log).
    pub prune_record: String,
    /// Patch report.
    pub patch_report: String,
    /// Artifact manifest.
    pub manifest: String,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            import_graph: "import_graph_v1.json".to_string(),
            impact_report: "impact_report_v1.json".to_string(),
            pruned_requirements: "pruned_requirements_v1.json".to_string(),
            pruned_requirements_txt: "requirements.pruned.txt".to_string(),
            prune_record: "prune_record_v1.json".to_string(),
            patch_report: "patch_report_v1.json".to_string(),
            manifest: "artifact_manifest_v1.json".to_string(),
        }
    }
}

/// Summary counts for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStats {
    /// Nodes in the graph export.
    pub node_count: usize,
    /// Edges in the graph export.
    pub edge_count: usize,
    /// Reachable nodes.
    pub reachable: usize,
    /// Ambiguous files.
    pub ambiguous: usize,
    /// Files the plan deletes.
    pub removed_files: usize,
    /// Bytes the plan deletes.
    pub removed_bytes: u64,
    /// Aggregators rewritten, if the patcher ran.
    pub patched: Option<usize>,
}

/// Manifest tying a run's artifacts together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Hash of every artifact hash below.
    pub bundle_id: String,
    /// Schema version.
    pub version: String,
    /// Snapshot id.
    pub snapshot_id: String,
    /// Policy hash.
    pub policy_hash: String,
    /// Graph export hash.
    pub graph_hash: String,
    /// Impact report hash.
    pub impact_report_hash: String,
    /// Pruned manifest hash, if emitted.
    pub pruned_requirements_hash: Option<String>,
    /// Prune record hash, if emitted.
    pub prune_record_hash: Option<String>,
    /// Patch report hash, if emitted.
    pub patch_report_hash: Option<String>,
    /// When the bundle was assembled.
    pub computed_at: DateTime<Utc>,
    /// File names.
    pub artifact_paths: ArtifactPaths,
    /// Summary counts.
    pub stats: ArtifactStats,
}

#[derive(Serialize)]
struct BundleIdInput<'a> {
    snapshot_id: &'a str,
    policy_hash: &'a str,
    graph_hash: &'a str,
    impact_report_hash: &'a str,
    pruned_requirements_hash: Option<&'a str>,
    prune_record_hash: Option<&'a str>,
    patch_report_hash: Option<&'a str>,
}

/// Every artifact of a run plus their manifest.
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    /// Manifest.
    pub manifest: ArtifactManifest,
    /// Graph export.
    pub graph: GraphExport,
    /// Impact report.
    pub impact: ImpactReport,
    /// Pruned requirement manifest.
    pub requirements: Option<PrunedManifest>,
    /// Prune record.
    pub prune_record: Option<PruneRecord>,
    /// Patch report.
    pub patch_report: Option<PatchReport>,
}

impl ArtifactBundle {
    /// Write every present artifact into `dir`, manifest last. Returns the
    /// files written.
    pub fn write_all(&self, dir: &Path) -> Result<Vec<PathBuf>, EmitError> {
        std::fs::create_dir_all(dir).map_err(|source| EmitError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let paths = &self.manifest.artifact_paths;
        let mut written = Vec::new();

        write_file(dir, &paths.import_graph, &self.graph.to_bytes()?, &mut written)?;
        write_file(dir, &paths.impact_report, &to_artifact_bytes(&self.impact)?, &mut written)?;
        if let Some(requirements) = &self.requirements {
            write_file(dir, &paths.pruned_requirements, &to_artifact_bytes(requirements)?, &mut written)?;
            write_file(
                dir,
                &paths.pruned_requirements_txt,
                requirements.to_requirements_txt().as_bytes(),
                &mut written,
            )?;
        }
        if let Some(record) = &self.prune_record {
            write_file(dir, &paths.prune_record, &to_artifact_bytes(record)?, &mut written)?;
        }
        if let Some(report) = &self.patch_report {
            write_file(dir, &paths.patch_report, &to_artifact_bytes(report)?, &mut written)?;
        }
        write_file(dir, &paths.manifest, &to_artifact_bytes(&self.manifest)?, &mut written)?;

        tracing::info!(
            dir = %dir.display(),
            files = written.len(),
            bundle_id = %self.manifest.bundle_id,
            "Wrote artifacts"
        );
        Ok(written)
    }
}

fn write_file(dir: &Path, name: &str, bytes: &[u8], written: &mut Vec<PathBuf>) -> Result<(), EmitError> {
    let path = dir.join(name);
    std::fs::write(&path, bytes).map_err(|source| EmitError::Io {
        path: path.clone(),
        source,
    })?;
    written.push(path);
    Ok(())
}

/// Builder for an [`ArtifactBundle`].
#[derive(Debug, Clone, Default)]
pub struct ArtifactBundler {
    graph: Option<GraphExport>,
    impact: Option<ImpactReport>,
    requirements: Option<PrunedManifest>,
    prune_record: Option<PruneRecord>,
    patch_report: Option<PatchReport>,
    artifact_paths: ArtifactPaths,
}

impl ArtifactBundler {
    /// Create an empty bundler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set custom artifact file names.
    pub fn with_paths(mut self, paths: ArtifactPaths) -> Self {
        self.artifact_paths = paths;
        self
    }

    /// Set the graph export (required).
    pub fn graph(mut self, graph: GraphExport) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Set the impact report (required).
    pub fn impact_report(mut self, report: ImpactReport) -> Self {
        self.impact = Some(report);
        self
    }

    /// Set the pruned requirement manifest.
    pub fn requirements(mut self, manifest: PrunedManifest) -> Self {
        self.requirements = Some(manifest);
        self
    }

    /// Set the prune record.
    pub fn prune_record(mut self, record: PruneRecord) -> Self {
        self.prune_record = Some(record);
        self
    }

    /// Set the patch report.
    pub fn patch_report(mut self, report: PatchReport) -> Self {
        self.patch_report = Some(report);
        self
    }

    /// Assemble the bundle and its manifest.
    pub fn build(self) -> Result<ArtifactBundle, EmitError> {
        let graph = self.graph.ok_or(EmitError::Missing("graph"))?;
        let impact = self.impact.ok_or(EmitError::Missing("impact_report"))?;

        let impact_report_hash = canonical_hash_hex(&impact)?;
        let pruned_requirements_hash = self.requirements.as_ref().map(canonical_hash_hex).transpose()?;
        let prune_record_hash = self.prune_record.as_ref().map(canonical_hash_hex).transpose()?;
        let patch_report_hash = self.patch_report.as_ref().map(canonical_hash_hex).transpose()?;

        let bundle_id = canonical_hash_hex(&BundleIdInput {
            snapshot_id: &graph.snapshot_id,
            policy_hash: &graph.policy_hash,
            graph_hash: &graph.graph_hash,
            impact_report_hash: &impact_report_hash,
            pruned_requirements_hash: pruned_requirements_hash.as_deref(),
            prune_record_hash: prune_record_hash.as_deref(),
            patch_report_hash: patch_report_hash.as_deref(),
        })?;

        let stats = ArtifactStats {
            node_count: graph.nodes.len(),
            edge_count: graph.edges.len(),
            reachable: graph.nodes.iter().filter(|n| n.tag == Tag::Reachable).count(),
            ambiguous: impact.ambiguous.len(),
            removed_files: impact.removed_files,
            removed_bytes: impact.removed_bytes,
            patched: self.patch_report.as_ref().map(|r| r.patched.len()),
        };

        let manifest = ArtifactManifest {
            bundle_id,
            version: PRUNE_KERNEL_SCHEMA_VERSION.to_string(),
            snapshot_id: graph.snapshot_id.clone(),
            policy_hash: graph.policy_hash.clone(),
            graph_hash: graph.graph_hash.clone(),
            impact_report_hash,
            pruned_requirements_hash,
            prune_record_hash,
            patch_report_hash,
            computed_at: Utc::now(),
            artifact_paths: self.artifact_paths,
            stats,
        };

        Ok(ArtifactBundle {
            manifest,
            graph,
            impact,
            requirements: self.requirements,
            prune_record: self.prune_record,
            patch_report: self.patch_report,
        })
    }
}
