//! Dependency graph with interned nodes and handle-indexed adjacency.
//!
//! Nodes are interned by canonical path: re-resolving a path always yields
//! the same [`NodeHandle`]. Edges live in one vector; per-node outgoing and
//! incoming index lists point into it. Exact duplicate edges are collapsed,
//! multiple edges with different kinds or lines between the same pair are
//! kept.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::types::{
    CanonicalPath, Confidence, EdgeTarget, ImportEdge, ModuleNode, NodeHandle, NodeKind,
};

/// Serializable form of a graph; indexes are rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphParts {
    /// Nodes in handle order.
    pub nodes: Vec<ModuleNode>,
    /// Edges in insertion order.
    pub edges: Vec<ImportEdge>,
    /// Entry nodes.
    pub roots: Vec<NodeHandle>,
    /// Expansion flags in handle order.
    pub expanded: Vec<bool>,
    /// Synthetic runtime root, once created.
    pub runtime_root: Option<NodeHandle>,
    /// Nodes confirmed by runtime hints.
    pub hinted: BTreeSet<NodeHandle>,
    /// Nodes promoted by the repair loop.
    pub promoted: BTreeSet<NodeHandle>,
}

/// Import dependency graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "GraphParts", into = "GraphParts")]
pub struct DependencyGraph {
    nodes: Vec<ModuleNode>,
    index: HashMap<CanonicalPath, NodeHandle>,
    edges: Vec<ImportEdge>,
    edge_set: HashSet<ImportEdge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    roots: Vec<NodeHandle>,
    expanded: Vec<bool>,
    runtime_root: Option<NodeHandle>,
    hinted: BTreeSet<NodeHandle>,
    promoted: BTreeSet<NodeHandle>,
}

impl From<GraphParts> for DependencyGraph {
    fn from(parts: GraphParts) -> Self {
        let mut graph = DependencyGraph::new();
        for node in parts.nodes {
            let (handle, _) = graph.intern(node.path.clone(), node.kind, node.size);
            graph.nodes[handle.index()] = node;
        }
        for edge in parts.edges {
            graph.add_edge(edge);
        }
        for (idx, flag) in parts.expanded.into_iter().enumerate() {
            if let Some(slot) = graph.expanded.get_mut(idx) {
                *slot = flag;
            }
        }
        graph.roots = parts.roots;
        graph.runtime_root = parts.runtime_root;
        graph.hinted = parts.hinted;
        graph.promoted = parts.promoted;
        graph
    }
}

impl From<DependencyGraph> for GraphParts {
    fn from(graph: DependencyGraph) -> Self {
        GraphParts {
            nodes: graph.nodes,
            edges: graph.edges,
            roots: graph.roots,
            expanded: graph.expanded,
            runtime_root: graph.runtime_root,
            hinted: graph.hinted,
            promoted: graph.promoted,
        }
    }
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Nodes
    // ─────────────────────────────────────────────────────────────────────────

    /// Intern a node. Returns its handle and whether it was newly created.
    pub fn intern(&mut self, path: CanonicalPath, kind: NodeKind, size: u64) -> (NodeHandle, bool) {
        if let Some(&handle) = self.index.get(&path) {
            return (handle, false);
        }
        let handle = NodeHandle::new(self.nodes.len() as u32);
        self.index.insert(path.clone(), handle);
        self.nodes.push(ModuleNode::new(path, kind, size));
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        self.expanded.push(false);
        (handle, true)
    }

    /// Handle for a path, if interned.
    pub fn handle(&self, path: &CanonicalPath) -> Option<NodeHandle> {
        self.index.get(path).copied()
    }

    /// Node by handle.
    pub fn node(&self, handle: NodeHandle) -> &ModuleNode {
        &self.nodes[handle.index()]
    }

    /// Mutable node by handle.
    pub fn node_mut(&mut self, handle: NodeHandle) -> &mut ModuleNode {
        &mut self.nodes[handle.index()]
    }

    /// Path of a node.
    pub fn path(&self, handle: NodeHandle) -> &CanonicalPath {
        &self.nodes[handle.index()].path
    }

    /// All nodes with their handles, in handle order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeHandle, &ModuleNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (NodeHandle::new(idx as u32), node))
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Edges
    // ─────────────────────────────────────────────────────────────────────────

    /// Add an edge. Returns `false` if an identical edge already exists.
    pub fn add_edge(&mut self, edge: ImportEdge) -> bool {
        if self.edge_set.contains(&edge) {
            return false;
        }
        let idx = self.edges.len();
        self.outgoing[edge.source.index()].push(idx);
        if let EdgeTarget::Node(target) = edge.target {
            self.incoming[target.index()].push(idx);
        }
        self.edge_set.insert(edge.clone());
        self.edges.push(edge);
        true
    }

    /// All edges in insertion order.
    pub fn edges(&self) -> &[ImportEdge] {
        &self.edges
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Outgoing edges of a node.
    pub fn outgoing(&self, handle: NodeHandle) -> impl Iterator<Item = &ImportEdge> {
        self.outgoing[handle.index()].iter().map(move |&i| &self.edges[i])
    }

    /// Incoming edges of a node.
    pub fn incoming(&self, handle: NodeHandle) -> impl Iterator<Item = &ImportEdge> {
        self.incoming[handle.index()].iter().map(move |&i| &self.edges[i])
    }

    /// Redirect every incoming edge of `handle` to the unresolved sentinel
    /// with `Unknown` confidence. Returns how many edges changed.
    pub fn downgrade_incoming(&mut self, handle: NodeHandle) -> usize {
        let text = self.path(handle).to_string();
        let indices = std::mem::take(&mut self.incoming[handle.index()]);
        for &idx in &indices {
            let old = self.edges[idx].clone();
            self.edge_set.remove(&old);
            let mut new = old;
            new.target = EdgeTarget::Unresolved(text.clone());
            new.confidence = Confidence::Unknown;
            self.edge_set.insert(new.clone());
            self.edges[idx] = new;
        }
        indices.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Roots and flags
    // ─────────────────────────────────────────────────────────────────────────

    /// Mark an entry node.
    pub fn add_root(&mut self, handle: NodeHandle) {
        if !self.roots.contains(&handle) {
            self.roots.push(handle);
        }
    }

    /// Entry nodes.
    pub fn roots(&self) -> &[NodeHandle] {
        &self.roots
    }

    /// Whether a node's imports have been expanded.
    pub fn is_expanded(&self, handle: NodeHandle) -> bool {
        self.expanded[handle.index()]
    }

    /// Mark a node expanded.
    pub fn set_expanded(&mut self, handle: NodeHandle) {
        self.expanded[handle.index()] = true;
    }

    /// Number of expanded nodes.
    pub fn expanded_count(&self) -> usize {
        self.expanded.iter().filter(|e| **e).count()
    }

    /// Get or create the synthetic runtime root.
    pub fn ensure_runtime_root(&mut self) -> NodeHandle {
        if let Some(root) = self.runtime_root {
            return root;
        }
        let (handle, _) = self.intern(CanonicalPath::runtime_root(), NodeKind::Source, 0);
        self.expanded[handle.index()] = true;
        self.runtime_root = Some(handle);
        handle
    }

    /// Synthetic runtime root, if any hint was merged.
    pub fn runtime_root(&self) -> Option<NodeHandle> {
        self.runtime_root
    }

    /// Record a node as confirmed by a runtime hint.
    pub fn mark_hinted(&mut self, handle: NodeHandle) -> bool {
        self.hinted.insert(handle)
    }

    /// Nodes confirmed by runtime hints.
    pub fn hinted(&self) -> &BTreeSet<NodeHandle> {
        &self.hinted
    }

    /// Promote a node to reachable regardless of edges.
    pub fn promote(&mut self, handle: NodeHandle) -> bool {
        self.promoted.insert(handle)
    }

    /// Promoted nodes.
    pub fn promoted(&self) -> &BTreeSet<NodeHandle> {
        &self.promoted
    }
}
