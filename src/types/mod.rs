//! Core types for the prune kernel.

pub mod node;
pub mod edge;
pub mod tag;
pub mod hint;
pub mod incident;

pub use node::{CanonicalPath, ExportSurface, ModuleNode, NodeHandle, NodeKind, RUNTIME_ROOT_PATH};
pub use edge::{Confidence, EdgeTarget, ImportEdge, ResolutionKind};
pub use tag::{Tag, TagEntry, TagReason, TagSet};
pub use hint::{read_trace, RuntimeHint, TraceError};
pub use incident::{Incident, IncidentKind, Severity};
