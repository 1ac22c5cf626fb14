//! Path & symbol resolver.
//!
//! Maps import references found by [`crate::syntax`] onto files of the
//! snapshot. Every answer carries a resolution kind and a confidence; a
//! reference that cannot be mapped inside the package root resolves to the
//! unresolved sentinel with `Unknown` confidence, never to an error.
//!
//! ## Module Lookup Order
//!
//! For `a.b`:
//! 1. package `a/b/__init__.py`
//! 2. module `a/b.py`
//! 3. compiled `a/b.*.so`, `a/b.so`, `a/b.*.pyd`, ...
//! 4. stub-only `a/b.pyi`
//! 5. namespace package directory `a/b/`

use lru::LruCache;
use parking_lot::Mutex;
use regex_lite::Regex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::snapshot::PackageSnapshot;
use crate::syntax::{DynamicImport, ImportForm, ImportScope, ImportStatement, StringLiteral};
use crate::types::{CanonicalPath, Confidence, NodeKind, ResolutionKind};

/// Extensions never followed through the name-index literal fallback.
const CODE_EXTENSIONS: &[&str] = &["py", "pyc", "pyi", "so", "pyd", "dylib", "dll"];

/// What a dotted module name's last component resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leaf {
    /// Regular package; holds its `__init__.py`.
    Package(CanonicalPath),
    /// Plain source module.
    Module(CanonicalPath),
    /// Compiled extension builds (one per ABI tag).
    Compiled(Vec<CanonicalPath>),
    /// Stub-only module.
    Stub(CanonicalPath),
    /// Namespace package directory (no file).
    Namespace(String),
    /// Not found in the snapshot.
    Missing,
}

impl Leaf {
    /// Whether the name exists as a module, package or namespace.
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }

    /// Files the leaf maps to.
    pub fn files(&self) -> Vec<&CanonicalPath> {
        match self {
            Self::Package(p) | Self::Module(p) | Self::Stub(p) => vec![p],
            Self::Compiled(paths) => paths.iter().collect(),
            Self::Namespace(_) | Self::Missing => Vec::new(),
        }
    }
}

/// Result of looking up a dotted module name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLookup {
    /// `__init__.py` files of every enclosing package, outermost first.
    pub inits: Vec<CanonicalPath>,
    /// The name itself.
    pub leaf: Leaf,
}

/// Target of a resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResolvedTarget {
    /// A file of the snapshot.
    File(CanonicalPath),
    /// Unresolved; carries the reference text.
    Unresolved(String),
}

/// One resolved reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Resolution {
    /// Target file or sentinel.
    pub target: ResolvedTarget,
    /// How it was resolved.
    pub kind: ResolutionKind,
    /// Confidence.
    pub confidence: Confidence,
    /// Source line.
    pub line: u32,
}

impl Resolution {
    fn file(path: CanonicalPath, kind: ResolutionKind, confidence: Confidence, line: u32) -> Self {
        Self {
            target: ResolvedTarget::File(path),
            kind,
            confidence,
            line,
        }
    }

    fn unresolved(text: impl Into<String>, kind: ResolutionKind, line: u32) -> Self {
        Self {
            target: ResolvedTarget::Unresolved(text.into()),
            kind,
            confidence: Confidence::Unknown,
            line,
        }
    }
}

/// Resolution statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    /// Cache hits.
    pub hits: u64,
    /// Cache misses.
    pub misses: u64,
}

/// Resolves module names and literals against an immutable snapshot.
///
/// Lookups are pure functions of the snapshot and are memoized in a bounded
/// LRU cache, so one resolver can be shared across builders.
pub struct Resolver {
    snapshot: Arc<PackageSnapshot>,
    cache: Mutex<LruCache<String, Arc<ModuleLookup>>>,
    stats: Mutex<ResolverStats>,
    file_literal: Regex,
    dir_literal: Regex,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("snapshot_id", &self.snapshot.snapshot_id())
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

impl Resolver {
    /// Create a resolver with the given cache capacity.
    pub fn new(snapshot: Arc<PackageSnapshot>, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            snapshot,
            cache: Mutex::new(LruCache::new(capacity)),
            stats: Mutex::new(ResolverStats::default()),
            file_literal: Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-/]*\.[A-Za-z0-9]{1,10}$")
                .expect("file literal pattern compiles"),
            dir_literal: Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-/]*$")
                .expect("dir literal pattern compiles"),
        }
    }

    /// Snapshot this resolver reads.
    pub fn snapshot(&self) -> &Arc<PackageSnapshot> {
        &self.snapshot
    }

    /// Cache statistics.
    pub fn stats(&self) -> ResolverStats {
        *self.stats.lock()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Module lookup
    // ─────────────────────────────────────────────────────────────────────────

    /// Look up a dotted module name.
    pub fn lookup(&self, dotted: &str) -> Arc<ModuleLookup> {
        if let Some(hit) = self.cache.lock().get(dotted) {
            self.stats.lock().hits += 1;
            return Arc::clone(hit);
        }
        self.stats.lock().misses += 1;
        let lookup = Arc::new(self.lookup_uncached(dotted));
        self.cache.lock().put(dotted.to_string(), Arc::clone(&lookup));
        lookup
    }

    fn lookup_uncached(&self, dotted: &str) -> ModuleLookup {
        let parts: Vec<&str> = dotted.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return ModuleLookup {
                inits: Vec::new(),
                leaf: Leaf::Missing,
            };
        }

        let mut inits = Vec::new();
        let mut dir = String::new();
        for part in &parts[..parts.len() - 1] {
            let sub = join_dir(&dir, part);
            let init = CanonicalPath::join(&sub, "__init__.py");
            if self.snapshot.contains(&init) {
                inits.push(init);
            } else if !self.snapshot.is_dir(&sub) {
                return ModuleLookup {
                    inits,
                    leaf: Leaf::Missing,
                };
            }
            dir = sub;
        }

        let name = parts[parts.len() - 1];
        ModuleLookup {
            inits,
            leaf: self.leaf_in(&dir, name),
        }
    }

    fn leaf_in(&self, dir: &str, name: &str) -> Leaf {
        let sub = join_dir(dir, name);
        let init = CanonicalPath::join(&sub, "__init__.py");
        if self.snapshot.contains(&init) {
            return Leaf::Package(init);
        }
        let module = CanonicalPath::join(dir, &format!("{name}.py"));
        if self.snapshot.contains(&module) {
            return Leaf::Module(module);
        }
        let compiled: Vec<CanonicalPath> = self
            .snapshot
            .files_in_dir(dir)
            .filter(|p| p.stem() == name)
            .filter(|p| self.snapshot.meta(p).map(|m| m.kind) == Some(NodeKind::CompiledExtension))
            .cloned()
            .collect();
        if !compiled.is_empty() {
            return Leaf::Compiled(compiled);
        }
        let stub = CanonicalPath::join(dir, &format!("{name}.pyi"));
        if self.snapshot.contains(&stub) {
            return Leaf::Stub(stub);
        }
        if self.snapshot.is_dir(&sub) && !sub.is_empty() {
            return Leaf::Namespace(sub);
        }
        Leaf::Missing
    }

    /// Dotted package an importer lives in (`None` outside the root).
    pub fn package_of(&self, importer: &CanonicalPath) -> Option<String> {
        if importer.is_external() {
            return None;
        }
        Some(importer.parent().replace('/', "."))
    }

    /// Turn a relative reference into an absolute dotted name.
    ///
    /// `level` counts leading dots; walking above the package root yields `None`.
    pub fn absolutize(&self, importer: &CanonicalPath, level: usize, module: Option<&str>) -> Option<String> {
        if level == 0 {
            return module.map(str::to_string);
        }
        let package = self.package_of(importer)?;
        let mut parts: Vec<&str> = if package.is_empty() {
            Vec::new()
        } else {
            package.split('.').collect()
        };
        for _ in 1..level {
            parts.pop()?;
        }
        if let Some(m) = module {
            parts.extend(m.split('.'));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("."))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reference resolution
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolve one import statement.
    pub fn resolve_import(&self, stmt: &ImportStatement, importer: &CanonicalPath) -> Vec<Resolution> {
        let mut out = Vec::new();
        match &stmt.form {
            ImportForm::Import { modules } => {
                let (kind, confidence) = classify(stmt.scope, ResolutionKind::Direct);
                for module in modules {
                    self.push_lookup(&mut out, &module.dotted, kind, confidence, stmt.line);
                }
            }
            ImportForm::From {
                module,
                level,
                names,
                wildcard,
            } => {
                let natural = if *wildcard {
                    ResolutionKind::Wildcard
                } else if *level > 0 {
                    ResolutionKind::Relative
                } else {
                    ResolutionKind::Direct
                };
                let (kind, confidence) = classify(stmt.scope, natural);

                let Some(base) = self.absolutize(importer, *level, module.as_deref()) else {
                    let text = format!("{}{}", ".".repeat(*level), module.as_deref().unwrap_or(""));
                    out.push(Resolution::unresolved(text, kind, stmt.line));
                    return out;
                };
                let found = self.push_lookup(&mut out, &base, kind, confidence, stmt.line);
                if found && !*wildcard {
                    for name in names {
                        let sub = format!("{base}.{}", name.name);
                        let lookup = self.lookup(&sub);
                        if lookup.leaf.exists() {
                            self.push_leaf(&mut out, &lookup.leaf, kind, confidence, stmt.line);
                        }
                    }
                }
            }
        }
        out
    }

    /// Resolve `importlib.import_module` / `__import__` with literal arguments.
    ///
    /// A relative name without a package argument is unresolved.
    pub fn resolve_dynamic(&self, dynamic: &DynamicImport) -> Vec<Resolution> {
        let kind = ResolutionKind::Deferred;
        let level = dynamic.module.chars().take_while(|c| *c == '.').count();
        let rest = &dynamic.module[level..];
        let base = if level == 0 {
            Some(dynamic.module.clone())
        } else {
            dynamic.package.as_ref().map(|pkg| {
                let mut parts: Vec<&str> = pkg.split('.').collect();
                for _ in 1..level {
                    parts.pop();
                }
                if !rest.is_empty() {
                    parts.push(rest);
                }
                parts.join(".")
            })
        };

        let mut out = Vec::new();
        match base {
            Some(base) if !base.is_empty() => {
                self.push_lookup(&mut out, &base, kind, Confidence::Unknown, dynamic.line);
            }
            _ => {
                out.push(Resolution::unresolved(dynamic.module.clone(), kind, dynamic.line));
            }
        }
        out
    }

    /// Resolve a string literal that may name a data file or directory.
    ///
    /// Unmatched literals produce nothing.
    pub fn resolve_literal(&self, literal: &StringLiteral, importer: &CanonicalPath) -> Vec<Resolution> {
        let value = literal.value.trim_start_matches("./");
        let kind = ResolutionKind::DataReference;
        let confidence = Confidence::Probable;
        if importer.is_external() || value.contains("..") {
            return Vec::new();
        }

        let dir = importer.parent();
        if self.file_literal.is_match(value) {
            let candidate = CanonicalPath::join(dir, value);
            if self.snapshot.contains(&candidate) && &candidate != importer {
                return vec![Resolution::file(candidate, kind, confidence, literal.line)];
            }
            let name = value.rsplit('/').next().unwrap_or(value);
            let ext = name.rsplit('.').next().unwrap_or("");
            if CODE_EXTENSIONS.contains(&ext) {
                return Vec::new();
            }
            let top = importer.top_level();
            return self
                .snapshot
                .files_named(name)
                .iter()
                .filter(|p| p.top_level() == top && p.as_str().ends_with(value))
                .map(|p| Resolution::file(p.clone(), kind, confidence, literal.line))
                .collect();
        }

        if self.dir_literal.is_match(value) {
            let sub = join_dir(dir, value.trim_end_matches('/'));
            if sub.is_empty() || !self.snapshot.is_dir(&sub) {
                return Vec::new();
            }
            let files: Vec<&CanonicalPath> = self.snapshot.files_under(&sub).collect();
            let holds_code = files.iter().any(|p| {
                self.snapshot
                    .meta(p)
                    .map(|m| m.kind != NodeKind::Data)
                    .unwrap_or(false)
            });
            if holds_code {
                return Vec::new();
            }
            return files
                .into_iter()
                .map(|p| Resolution::file(p.clone(), kind, confidence, literal.line))
                .collect();
        }
        Vec::new()
    }

    /// Push edges for a dotted lookup. Returns whether the name exists.
    fn push_lookup(
        &self,
        out: &mut Vec<Resolution>,
        dotted: &str,
        kind: ResolutionKind,
        confidence: Confidence,
        line: u32,
    ) -> bool {
        let lookup = self.lookup(dotted);
        for init in &lookup.inits {
            out.push(Resolution::file(init.clone(), kind, confidence, line));
        }
        if lookup.leaf.exists() {
            self.push_leaf(out, &lookup.leaf, kind, confidence, line);
            true
        } else {
            out.push(Resolution::unresolved(dotted, kind, line));
            false
        }
    }

    fn push_leaf(&self, out: &mut Vec<Resolution>, leaf: &Leaf, kind: ResolutionKind, confidence: Confidence, line: u32) {
        match leaf {
            Leaf::Package(p) | Leaf::Module(p) => {
                out.push(Resolution::file(p.clone(), kind, confidence, line));
            }
            Leaf::Compiled(paths) => {
                for p in paths {
                    out.push(Resolution::file(
                        p.clone(),
                        kind,
                        confidence.at_most(Confidence::Probable),
                        line,
                    ));
                }
            }
            Leaf::Stub(p) => {
                out.push(Resolution::file(
                    p.clone(),
                    kind,
                    confidence.at_most(Confidence::Probable),
                    line,
                ));
            }
            Leaf::Namespace(_) | Leaf::Missing => {}
        }
    }
}

/// Effective kind and confidence for a statement in `scope`.
fn classify(scope: ImportScope, natural: ResolutionKind) -> (ResolutionKind, Confidence) {
    match scope {
        ImportScope::Function | ImportScope::TypeChecking => (ResolutionKind::Deferred, Confidence::Unknown),
        ImportScope::Conditional if natural == ResolutionKind::Wildcard => {
            (ResolutionKind::Wildcard, Confidence::Probable)
        }
        ImportScope::Conditional => (ResolutionKind::Conditional, Confidence::Probable),
        ImportScope::Module if natural == ResolutionKind::Wildcard => {
            (ResolutionKind::Wildcard, Confidence::Probable)
        }
        ImportScope::Module => (natural, Confidence::Certain),
    }
}

fn join_dir(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}
