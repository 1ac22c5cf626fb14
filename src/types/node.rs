//! Module nodes: one physical file under the package root.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Path of the synthetic root that runtime hints hang off.
pub const RUNTIME_ROOT_PATH: &str = "<runtime>";

/// Small integer handle for an interned node.
///
/// Handles are assigned in insertion order, which is deterministic for a
/// given snapshot and entry set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(u32);

impl NodeHandle {
    /// Create a handle from a raw index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Index into the node table.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Canonical path of a file: package-root-relative and `/`-separated.
///
/// Entry scripts that live outside the package root keep their normalized
/// absolute path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalPath(String);

impl CanonicalPath {
    /// Normalize a path string: backslashes become `/`, `.` segments and
    /// duplicate separators are dropped, `..` pops a segment.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref().replace('\\', "/");
        let absolute = raw.starts_with('/');
        let mut parts: Vec<&str> = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                s => parts.push(s),
            }
        }
        let joined = parts.join("/");
        if absolute {
            Self(format!("/{joined}"))
        } else {
            Self(joined)
        }
    }

    /// The runtime root's path.
    pub fn runtime_root() -> Self {
        Self(RUNTIME_ROOT_PATH.to_string())
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this path lives outside the package root.
    pub fn is_external(&self) -> bool {
        self.0.starts_with('/') || self.0 == RUNTIME_ROOT_PATH
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Directory part (`""` for files at the root).
    pub fn parent(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    /// Module stem: the file name up to its first dot.
    ///
    /// `gamma.cpython-313-x86_64-linux-gnu.so` has stem `gamma`.
    pub fn stem(&self) -> &str {
        let name = self.file_name();
        match name.find('.') {
            Some(0) | None => name,
            Some(idx) => &name[..idx],
        }
    }

    /// Extension after the last dot, if any.
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(&name[idx + 1..]),
        }
    }

    /// First path component.
    pub fn top_level(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// Whether the path is inside directory `dir` (at any depth).
    pub fn is_under(&self, dir: &str) -> bool {
        if dir.is_empty() {
            return !self.is_external();
        }
        self.0.len() > dir.len() && self.0.starts_with(dir) && self.0.as_bytes()[dir.len()] == b'/'
    }

    /// Join a relative segment onto a directory path.
    pub fn join(dir: &str, rest: &str) -> Self {
        if dir.is_empty() {
            Self::new(rest)
        } else {
            Self::new(format!("{dir}/{rest}"))
        }
    }

    /// Every ancestor directory, innermost first (excluding the root).
    pub fn ancestors(&self) -> impl Iterator<Item = &str> {
        let s = self.0.as_str();
        s.char_indices()
            .filter(|(_, c)| *c == '/')
            .map(move |(idx, _)| &s[..idx])
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
    }

    /// Dotted module name for a Python file (`a/b/c.py` → `a.b.c`,
    /// `a/b/__init__.py` → `a.b`).
    pub fn module_name(&self) -> Option<String> {
        if self.is_external() {
            return None;
        }
        let name = self.file_name();
        if name == "__init__.py" {
            return Some(self.parent().replace('/', "."));
        }
        let stripped = self.0.strip_suffix(".py")?;
        Some(stripped.replace('/', "."))
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CanonicalPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What kind of file a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Python source module.
    Source,
    /// Native extension module (`.so`, `.pyd`, ...).
    CompiledExtension,
    /// Any non-code asset, stubs and bytecode included.
    Data,
    /// Package `__init__.py` re-exporting its directory.
    Aggregator,
}

impl NodeKind {
    /// Classify a file by its name.
    pub fn classify(path: &CanonicalPath) -> Self {
        if path.file_name() == "__init__.py" {
            return Self::Aggregator;
        }
        match path.extension() {
            Some("py") => Self::Source,
            Some("so") | Some("pyd") | Some("dylib") | Some("dll") => Self::CompiledExtension,
            _ => Self::Data,
        }
    }

    /// Whether the file holds Python source that can be scanned for imports.
    pub fn is_python_source(self) -> bool {
        matches!(self, Self::Source | Self::Aggregator)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::CompiledExtension => write!(f, "compiled_extension"),
            Self::Data => write!(f, "data"),
            Self::Aggregator => write!(f, "aggregator"),
        }
    }
}

/// Names a module claims to provide.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "surface", content = "names", rename_all = "snake_case")]
pub enum ExportSurface {
    /// Nothing known yet, or genuinely empty.
    #[default]
    Empty,
    /// Statically listed names (`__all__` or top-level bindings).
    Known(BTreeSet<String>),
    /// Computed at runtime or not introspectable (compiled modules).
    Dynamic,
}

impl ExportSurface {
    /// Number of statically known names.
    pub fn len(&self) -> usize {
        match self {
            Self::Known(names) => names.len(),
            _ => 0,
        }
    }

    /// Whether no names are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One physical file in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleNode {
    /// Canonical path (unique key).
    pub path: CanonicalPath,
    /// File kind.
    pub kind: NodeKind,
    /// Declared export surface.
    pub exports: ExportSurface,
    /// Size in bytes.
    pub size: u64,
}

impl ModuleNode {
    /// Create a node with an empty export surface.
    pub fn new(path: CanonicalPath, kind: NodeKind, size: u64) -> Self {
        let exports = if kind == NodeKind::CompiledExtension {
            ExportSurface::Dynamic
        } else {
            ExportSurface::Empty
        };
        Self {
            path,
            kind,
            exports,
            size,
        }
    }

    /// Whether this node heads a compiled unit (extension or stub-only module).
    pub fn is_unit_leader(&self) -> bool {
        self.kind == NodeKind::CompiledExtension || self.path.extension() == Some("pyi")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_normalization() {
        assert_eq!(CanonicalPath::new("./a//b/./c.py").as_str(), "a/b/c.py");
        assert_eq!(CanonicalPath::new("a\\b\\c.py").as_str(), "a/b/c.py");
        assert_eq!(CanonicalPath::new("a/b/../c.py").as_str(), "a/c.py");
        assert_eq!(CanonicalPath::new("/home/u/run.py").as_str(), "/home/u/run.py");
    }

    #[test]
    fn test_stem_and_extension() {
        let p = CanonicalPath::new("pkg/gamma.cpython-313-x86_64-linux-gnu.so");
        assert_eq!(p.stem(), "gamma");
        assert_eq!(p.extension(), Some("so"));
        assert_eq!(p.parent(), "pkg");
        assert_eq!(CanonicalPath::new(".hidden").extension(), None);
    }

    #[test]
    fn test_module_name() {
        assert_eq!(CanonicalPath::new("a/b/c.py").module_name().as_deref(), Some("a.b.c"));
        assert_eq!(CanonicalPath::new("a/b/__init__.py").module_name().as_deref(), Some("a.b"));
        assert_eq!(CanonicalPath::new("a/data.csv").module_name(), None);
    }

    #[test]
    fn test_ancestors_innermost_first() {
        let p = CanonicalPath::new("a/b/c/d.py");
        let ancestors: Vec<_> = p.ancestors().collect();
        assert_eq!(ancestors, vec!["a/b/c", "a/b", "a"]);
    }

    #[test]
    fn test_is_under() {
        let p = CanonicalPath::new("scipy/linalg/x.py");
        assert!(p.is_under("scipy"));
        assert!(p.is_under("scipy/linalg"));
        assert!(!p.is_under("scip"));
        assert!(p.is_under(""));
    }

    #[test]
    fn test_classify() {
        assert_eq!(NodeKind::classify(&"a/__init__.py".into()), NodeKind::Aggregator);
        assert_eq!(NodeKind::classify(&"a/m.py".into()), NodeKind::Source);
        assert_eq!(NodeKind::classify(&"a/m.cpython-313.so".into()), NodeKind::CompiledExtension);
        assert_eq!(NodeKind::classify(&"a/m.pyi".into()), NodeKind::Data);
        assert_eq!(NodeKind::classify(&"a/table.dat".into()), NodeKind::Data);
    }
}
