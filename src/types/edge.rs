//! Import edges between module nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::node::NodeHandle;

/// How an import reference was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    /// Absolute import at module level.
    Direct,
    /// Relative (`from .x import y`) import at module level.
    Relative,
    /// Re-export-all (`from x import *`).
    Wildcard,
    /// Function-body, type-checking-only or string-keyed dynamic import.
    Deferred,
    /// Module-level import nested in `if`/`try`/`with`.
    Conditional,
    /// File referenced by a string literal.
    DataReference,
    /// Member of a compiled unit or bytecode cache of a source file.
    CoUnit,
    /// Observed by an instrumented run.
    Runtime,
}

impl ResolutionKind {
    /// Parse from the snake_case name used in exports.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "relative" => Some(Self::Relative),
            "wildcard" => Some(Self::Wildcard),
            "deferred" => Some(Self::Deferred),
            "conditional" => Some(Self::Conditional),
            "data_reference" => Some(Self::DataReference),
            "co_unit" => Some(Self::CoUnit),
            "runtime" => Some(Self::Runtime),
            _ => None,
        }
    }
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Direct => "direct",
            Self::Relative => "relative",
            Self::Wildcard => "wildcard",
            Self::Deferred => "deferred",
            Self::Conditional => "conditional",
            Self::DataReference => "data_reference",
            Self::CoUnit => "co_unit",
            Self::Runtime => "runtime",
        };
        f.write_str(s)
    }
}

/// Three-valued resolution confidence.
///
/// Ordered `Unknown < Probable < Certain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Cannot be proven either way statically.
    Unknown,
    /// Over-approximated (wildcards, compiled modules).
    Probable,
    /// Deterministic path lookup or observed at runtime.
    Certain,
}

impl Confidence {
    /// Whether an edge with this confidence carries reachability.
    pub fn propagates(self) -> bool {
        self != Self::Unknown
    }

    /// Cap at `ceiling`.
    pub fn at_most(self, ceiling: Confidence) -> Confidence {
        self.min(ceiling)
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Probable => write!(f, "probable"),
            Self::Certain => write!(f, "certain"),
        }
    }
}

/// Target of an edge: a node, or the unresolved sentinel carrying the
/// reference text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTarget {
    /// Resolved to an interned node.
    Node(NodeHandle),
    /// Could not be resolved inside the package root.
    Unresolved(String),
}

impl EdgeTarget {
    /// The node handle, if resolved.
    pub fn node(&self) -> Option<NodeHandle> {
        match self {
            Self::Node(h) => Some(*h),
            Self::Unresolved(_) => None,
        }
    }
}

/// Directed import relation.
///
/// Implements `Ord` for deterministic ordering:
/// (source, target, kind, confidence, line).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImportEdge {
    /// Importing node.
    pub source: NodeHandle,
    /// Imported node or unresolved sentinel.
    pub target: EdgeTarget,
    /// How the reference was resolved.
    pub kind: ResolutionKind,
    /// Resolution confidence.
    pub confidence: Confidence,
    /// 1-based source line of the reference (0 for synthetic edges).
    pub line: u32,
}

impl ImportEdge {
    /// Create a new edge.
    pub fn new(
        source: NodeHandle,
        target: EdgeTarget,
        kind: ResolutionKind,
        confidence: Confidence,
        line: u32,
    ) -> Self {
        Self {
            source,
            target,
            kind,
            confidence,
            line,
        }
    }

    /// Certain-confidence edge from the runtime root.
    pub fn runtime(runtime_root: NodeHandle, target: NodeHandle) -> Self {
        Self::new(
            runtime_root,
            EdgeTarget::Node(target),
            ResolutionKind::Runtime,
            Confidence::Certain,
            0,
        )
    }

    /// Whether this edge carries reachability to a node.
    pub fn propagates(&self) -> bool {
        self.confidence.propagates() && self.target.node().is_some()
    }
}
