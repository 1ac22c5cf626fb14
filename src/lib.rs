//! # prune-kernel
//!
//! Static import-dependency graph builder and pruning engine for installed
//! Python package trees.
//!
//! The kernel answers one question:
//!
//! > Given an entry file, which files of the package tree can it possibly need?
//!
//! ## Core Contract
//!
//! 1. Build the import closure of one or more entry files over an immutable snapshot
//! 2. Tag every file reachable, ambiguous or unreachable; ambiguous files are always kept
//! 3. Delete only unreachable deletion units under an exclusive root lock, with an undo record
//! 4. Patch surviving `__init__.py` files so imports of deleted modules fail lazily
//!
//! ## Architecture
//!
//! ```text
//! PackageStore → PackageSnapshot → GraphBuilder ⇄ Resolver
//!                                       ↓
//!                       HintMerger → Tagger → Pruner → AggregatorPatcher
//!                                       ↓
//!                               GraphExport / ArtifactBundle
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same snapshot + same entries + same policy → byte-identical graph export
//! - Node handles are assigned in discovery order of a deterministic BFS
//! - Exported nodes and edges are sorted canonically

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod policy;
pub mod store;
pub mod canonical;
pub mod snapshot;
pub mod syntax;
pub mod resolver;
pub mod graph;
pub mod builder;
pub mod hints;
pub mod tagger;
pub mod root;
pub mod pruner;
pub mod patcher;
pub mod manifest;
pub mod emitter;
pub mod batch;
pub mod session;

// Re-exports
pub use types::{
    CanonicalPath, Confidence, EdgeTarget, ExportSurface, ImportEdge, ModuleNode, NodeHandle, NodeKind,
    ResolutionKind, RuntimeHint, Tag, TagEntry, TagReason, TagSet,
};
pub use types::incident::{Incident, IncidentKind, Severity};
pub use policy::{DeletionMode, PolicyError, PrunePolicy};
pub use store::{FsPackageStore, InMemoryPackageStore, PackageStore, StoreError};
pub use snapshot::{PackageSnapshot, SnapshotFingerprint};
pub use resolver::Resolver;
pub use graph::DependencyGraph;
pub use builder::{BuildError, BuildOutput, ClosureCheckpoint, EntryPoint, GraphBuilder};
pub use hints::{HintCollector, HintMerger, MergeReport, TraceStatus};
pub use tagger::Tagger;
pub use root::{LockError, LockedRoot};
pub use pruner::{ImpactReport, PruneError, PrunePlan, PruneRecord, Pruner, RestoreReport};
pub use patcher::{AggregatorPatcher, PatchError, PatchReport};
pub use manifest::{DistributionIndex, ManifestError, PrunedManifest, Requirement};
pub use emitter::{ArtifactBundle, ArtifactBundler, ArtifactManifest, EmitError, GraphExport};
pub use batch::{BatchAnalyzer, BatchError, BatchResult};
pub use session::{PruneSession, SessionError};
pub use canonical::{canonical_hash, canonical_hash_hex, to_canonical_bytes};

/// Schema version for all exported artifacts.
/// Increment on breaking changes to any schema type.
pub const PRUNE_KERNEL_SCHEMA_VERSION: &str = "1.0.0";

/// Default policy version identifier.
pub const DEFAULT_POLICY_VERSION: &str = "prune_policy_v1";
