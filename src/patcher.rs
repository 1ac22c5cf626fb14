//! Aggregator patching after deletion.
//!
//! A surviving `__init__.py` may still import a module that was pruned. The
//! patcher replaces exactly those statements with inert stand-ins and
//! leaves every other byte of the file alone.
//!
//! ## Stand-ins
//!
//! - `from X import a, b as c` with `X` deleted: `a = _PrunedAway("a", "X")`,
//!   `c = _PrunedAway("b", "X")`
//! - `from X import a, b` with only submodule `X.b` deleted: `from X import a`
//!   plus a stand-in for `b`
//! - `from X import *` with `X` deleted: `pass`
//! - `import X.y as z` with `X.y` deleted: `z = _PrunedAway("X.y", "X.y")`
//! - `import X.y` with `X.y` deleted: `import X` if `X` survives, else
//!   `X = _PrunedAway("X", "X.y")`
//!
//! Each rewritten statement is preceded by a `# pruned-away:` comment at the
//! statement's indentation. The `_PrunedAway` class is injected once, after
//! the docstring and `__future__` imports. Using a stand-in raises
//! `ImportError("<name> was pruned away by prune-kernel (module X deleted)")`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

use crate::policy::PrunePolicy;
use crate::resolver::Resolver;
use crate::root::{LockError, LockedRoot};
use crate::snapshot::PackageSnapshot;
use crate::store::BACKUP_PREFIX;
use crate::syntax::{ImportForm, ImportStatement, PythonParser, SyntaxError, PRUNED_HELPER_CLASS};
use crate::types::{CanonicalPath, Incident, IncidentKind, NodeKind};

/// Comment marking a rewritten statement.
pub const PRUNED_MARKER: &str = "# pruned-away:";

const HELPER_SOURCE: &str = r#"class _PrunedAway:
    """Stand-in for a name whose module was pruned away by prune-kernel."""

    def __init__(self, name, module):
        self.__dict__["_pruned_name"] = name
        self.__dict__["_pruned_module"] = module

    def _pruned_fail(self):
        raise ImportError(
            f"{self._pruned_name} was pruned away by prune-kernel "
            f"(module {self._pruned_module} deleted)"
        )

    def __getattr__(self, attr):
        if attr.startswith("__") and attr.endswith("__"):
            raise AttributeError(attr)
        self._pruned_fail()

    def __call__(self, *args, **kwargs):
        self._pruned_fail()

    def __repr__(self):
        return f"<pruned-away {self._pruned_name}>"

"#;

const EMPTIED_PLACEHOLDER: &str =
    "# Every import of this package was pruned away by prune-kernel.\n";

/// Error type for patch operations.
#[derive(Debug, Error)]
pub enum PatchError {
    /// Root lock or file system failure.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Parser failure.
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),
}

/// Result of rewriting one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Nothing references a deleted module.
    Unchanged,
    /// Some statements were replaced.
    Patched {
        /// New file content.
        text: String,
        /// Names bound to stand-ins.
        stubbed: Vec<String>,
    },
    /// Nothing meaningful would remain and no name is bound to a stand-in;
    /// the file becomes a placeholder.
    Emptied {
        /// Placeholder content.
        text: String,
        /// Names that were stubbed before emptying.
        stubbed: Vec<String>,
    },
    /// The file could not be patched safely and was left as is.
    Failed {
        /// Why.
        reason: String,
    },
}

/// One rewritten aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchedFile {
    /// Aggregator path.
    pub path: CanonicalPath,
    /// Names bound to stand-ins.
    pub stubbed: Vec<String>,
    /// Whether the file was reduced to a placeholder.
    pub emptied: bool,
    /// Pre-patch backup, if one was written.
    pub backup: Option<CanonicalPath>,
}

/// Patcher output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchReport {
    /// Aggregators examined.
    pub examined: usize,
    /// Aggregators rewritten.
    pub patched: Vec<PatchedFile>,
    /// Files left untouched because patching was unsafe.
    pub failures: Vec<Incident>,
}

struct Edit {
    start: usize,
    end: usize,
    text: String,
}

/// Rewrites surviving aggregators that import deleted modules.
pub struct AggregatorPatcher {
    snapshot: Arc<PackageSnapshot>,
    resolver: Resolver,
    deleted: BTreeSet<CanonicalPath>,
    parser: PythonParser,
    policy: PrunePolicy,
    originals: BTreeMap<CanonicalPath, Vec<u8>>,
}

impl std::fmt::Debug for AggregatorPatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorPatcher")
            .field("deleted", &self.deleted.len())
            .finish_non_exhaustive()
    }
}

impl AggregatorPatcher {
    /// Create a patcher.
    ///
    /// `baseline` may be captured before or after deletion; deleted files
    /// are added back so imports of them still resolve.
    pub fn new(
        baseline: &PackageSnapshot,
        deleted: BTreeSet<CanonicalPath>,
        policy: PrunePolicy,
    ) -> Result<Self, PatchError> {
        let snapshot = Arc::new(baseline.with_extra_files(&deleted));
        let resolver = Resolver::new(Arc::clone(&snapshot), policy.resolver_cache_size);
        Ok(Self {
            snapshot,
            resolver,
            deleted,
            parser: PythonParser::new()?,
            policy,
            originals: BTreeMap::new(),
        })
    }

    /// Patch every surviving aggregator under the root lock.
    pub fn patch_all(&mut self, root: &LockedRoot) -> Result<PatchReport, PatchError> {
        let aggregators: Vec<CanonicalPath> = self
            .snapshot
            .files()
            .filter(|(p, m)| m.kind == NodeKind::Aggregator && !self.deleted.contains(*p))
            .map(|(p, _)| p.clone())
            .collect();

        let mut report = PatchReport::default();
        for path in aggregators {
            let Some(bytes) = root.read(&path)? else {
                continue;
            };
            report.examined += 1;
            let source = String::from_utf8_lossy(&bytes).into_owned();
            let (text, stubbed, emptied) = match self.rewrite(&path, &source) {
                PatchOutcome::Unchanged => continue,
                PatchOutcome::Failed { reason } => {
                    report.failures.push(Incident::record(
                        IncidentKind::PatchFailure {
                            path: path.to_string(),
                            reason,
                        },
                        "patcher",
                    ));
                    continue;
                }
                PatchOutcome::Patched { text, stubbed } => (text, stubbed, false),
                PatchOutcome::Emptied { text, stubbed } => (text, stubbed, true),
            };

            let backup = if self.policy.keep_backups {
                let backup = CanonicalPath::join(path.parent(), &format!("{BACKUP_PREFIX}{}", path.file_name()));
                if !root.exists(&backup) {
                    root.write_atomic(&backup, &bytes)?;
                }
                Some(backup)
            } else {
                None
            };
            root.write_atomic(&path, text.as_bytes())?;
            self.originals.entry(path.clone()).or_insert(bytes);
            tracing::info!(
                path = %path,
                stubbed = stubbed.len(),
                emptied,
                "Patched aggregator"
            );
            report.patched.push(PatchedFile {
                path,
                stubbed,
                emptied,
                backup,
            });
        }

        tracing::info!(
            examined = report.examined,
            patched = report.patched.len(),
            failures = report.failures.len(),
            "Aggregator patching complete"
        );
        Ok(report)
    }

    /// Pre-patch content of every aggregator this patcher rewrote.
    pub fn into_originals(self) -> BTreeMap<CanonicalPath, Vec<u8>> {
        self.originals
    }

    /// Compute the rewrite of one aggregator without touching the disk.
    pub fn rewrite(&mut self, path: &CanonicalPath, source: &str) -> PatchOutcome {
        let scan = match self.parser.scan(source) {
            Ok(scan) => scan,
            Err(e) => return PatchOutcome::Failed { reason: e.to_string() },
        };

        let mut edits: Vec<Edit> = Vec::new();
        let mut stubbed: Vec<String> = Vec::new();
        for stmt in &scan.imports {
            if let Some((lines, names)) = self.replacement(stmt, path) {
                edits.push(render(source, stmt, lines));
                stubbed.extend(names);
            }
        }
        if edits.is_empty() {
            return PatchOutcome::Unchanged;
        }
        if scan.has_syntax_errors {
            return PatchOutcome::Failed {
                reason: "original source does not parse".to_string(),
            };
        }

        let mut text = source.to_string();
        edits.sort_by(|a, b| b.start.cmp(&a.start));
        for edit in edits {
            text.replace_range(edit.start..edit.end, &edit.text);
        }
        if !stubbed.is_empty() && !scan.has_helper {
            let offset = scan.helper_offset.min(text.len());
            let mut helper = String::new();
            if offset > 0 && !text[..offset].ends_with('\n') {
                helper.push('\n');
            }
            helper.push_str(HELPER_SOURCE);
            text.insert_str(offset, &helper);
        }

        let rescan = match self.parser.scan(&text) {
            Ok(rescan) => rescan,
            Err(e) => return PatchOutcome::Failed { reason: e.to_string() },
        };
        if rescan.has_syntax_errors {
            return PatchOutcome::Failed {
                reason: "rewritten source does not parse".to_string(),
            };
        }
        if stubbed.is_empty() && rescan.substantive_statements == 0 {
            return PatchOutcome::Emptied {
                text: EMPTIED_PLACEHOLDER.to_string(),
                stubbed,
            };
        }
        PatchOutcome::Patched { text, stubbed }
    }

    /// Whether importing `dotted` would now fail.
    fn is_gone(&self, dotted: &str) -> bool {
        let lookup = self.resolver.lookup(dotted);
        if lookup.inits.iter().any(|init| self.deleted.contains(init)) {
            return true;
        }
        let files = lookup.leaf.files();
        !files.is_empty() && files.iter().all(|f| self.deleted.contains(*f))
    }

    /// Replacement statements for `stmt` and the names they stub, or `None`
    /// when the statement is unaffected.
    fn replacement(&self, stmt: &ImportStatement, importer: &CanonicalPath) -> Option<(Vec<String>, Vec<String>)> {
        match &stmt.form {
            ImportForm::Import { modules } => {
                if !modules.iter().any(|m| self.is_gone(&m.dotted)) {
                    return None;
                }
                let mut lines = Vec::new();
                let mut names = Vec::new();
                for module in modules {
                    if !self.is_gone(&module.dotted) {
                        lines.push(match &module.alias {
                            Some(alias) => format!("import {} as {alias}", module.dotted),
                            None => format!("import {}", module.dotted),
                        });
                        continue;
                    }
                    match &module.alias {
                        Some(alias) => {
                            lines.push(stand_in(alias, &module.dotted, &module.dotted));
                            names.push(alias.clone());
                        }
                        None => match self.surviving_prefix(&module.dotted) {
                            Some(prefix) => lines.push(format!("import {prefix}")),
                            None => {
                                let top = module.dotted.split('.').next().unwrap_or(&module.dotted);
                                lines.push(stand_in(top, top, &module.dotted));
                                if !names.iter().any(|n| n == top) {
                                    names.push(top.to_string());
                                }
                            }
                        },
                    }
                }
                Some((lines, names))
            }
            ImportForm::From {
                module,
                level,
                names,
                wildcard,
            } => {
                let base = self.resolver.absolutize(importer, *level, module.as_deref())?;
                let written = format!("{}{}", ".".repeat(*level), module.as_deref().unwrap_or(""));

                if self.is_gone(&base) {
                    if *wildcard {
                        return Some((vec!["pass".to_string()], Vec::new()));
                    }
                    let lines = names.iter().map(|n| stand_in(n.binding(), &n.name, &base)).collect();
                    let bound = names.iter().map(|n| n.binding().to_string()).collect();
                    return Some((lines, bound));
                }
                if *wildcard {
                    return None;
                }

                let gone: Vec<bool> = names
                    .iter()
                    .map(|n| {
                        let sub = format!("{base}.{}", n.name);
                        self.resolver.lookup(&sub).leaf.exists() && self.is_gone(&sub)
                    })
                    .collect();
                if !gone.iter().any(|g| *g) {
                    return None;
                }
                let kept: Vec<String> = names
                    .iter()
                    .zip(&gone)
                    .filter(|(_, g)| !**g)
                    .map(|(n, _)| match &n.alias {
                        Some(alias) => format!("{} as {alias}", n.name),
                        None => n.name.clone(),
                    })
                    .collect();
                let mut lines = Vec::new();
                if !kept.is_empty() {
                    lines.push(format!("from {written} import {}", kept.join(", ")));
                }
                let mut bound = Vec::new();
                for (name, _) in names.iter().zip(&gone).filter(|(_, g)| **g) {
                    let module = format!("{base}.{}", name.name);
                    lines.push(stand_in(name.binding(), &name.name, &module));
                    bound.push(name.binding().to_string());
                }
                Some((lines, bound))
            }
        }
    }

    /// Longest proper prefix of `dotted` that still imports.
    fn surviving_prefix(&self, dotted: &str) -> Option<String> {
        let parts: Vec<&str> = dotted.split('.').collect();
        (1..parts.len())
            .rev()
            .map(|n| parts[..n].join("."))
            .find(|prefix| self.resolver.lookup(prefix).leaf.exists() && !self.is_gone(prefix))
    }
}

fn render(source: &str, stmt: &ImportStatement, lines: Vec<String>) -> Edit {
    let line_start = source[..stmt.start_byte].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let prefix = &source[line_start..stmt.start_byte];
    let original = source[stmt.start_byte..stmt.end_byte]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let text = if prefix.chars().all(char::is_whitespace) {
        let mut out = format!("{PRUNED_MARKER} {original}");
        for line in &lines {
            out.push('\n');
            out.push_str(prefix);
            out.push_str(line);
        }
        out
    } else {
        lines.join("; ")
    };
    Edit {
        start: stmt.start_byte,
        end: stmt.end_byte,
        text,
    }
}

fn stand_in(binding: &str, name: &str, module: &str) -> String {
    format!("{binding} = {PRUNED_HELPER_CLASS}(\"{name}\", \"{module}\")")
}

/// Put every `__INITIAL_<name>` backup under the root back in place.
///
/// Returns the restored paths.
pub fn restore_backups(root: &LockedRoot, snapshot: &PackageSnapshot) -> Result<Vec<CanonicalPath>, PatchError> {
    let mut restored = Vec::new();
    for (path, _) in snapshot.files() {
        if path.file_name() != "__init__.py" {
            continue;
        }
        let backup = CanonicalPath::join(path.parent(), &format!("{BACKUP_PREFIX}{}", path.file_name()));
        let Some(bytes) = root.read(&backup)? else {
            continue;
        };
        root.write_atomic(path, &bytes)?;
        root.remove(&backup)?;
        restored.push(path.clone());
    }
    tracing::info!(restored = restored.len(), "Restored aggregators from backups");
    Ok(restored)
}

/// Write pre-patch aggregator content back and drop the matching
/// `__INITIAL_<name>` backups.
///
/// Returns the reverted paths.
pub fn revert_aggregators(
    root: &LockedRoot,
    originals: &BTreeMap<CanonicalPath, Vec<u8>>,
) -> Result<Vec<CanonicalPath>, PatchError> {
    let mut reverted = Vec::with_capacity(originals.len());
    for (path, bytes) in originals {
        root.write_atomic(path, bytes)?;
        let backup = CanonicalPath::join(path.parent(), &format!("{BACKUP_PREFIX}{}", path.file_name()));
        if root.exists(&backup) {
            root.remove(&backup)?;
        }
        reverted.push(path.clone());
    }
    tracing::info!(reverted = reverted.len(), "Reverted patched aggregators");
    Ok(reverted)
}
