//! Python source scanning with tree-sitter.
//!
//! Extracts everything the resolver and the patcher need from one file in
//! a single pass: import statements with their byte ranges and syntactic
//! scope, string-keyed dynamic imports, file-name-like string literals and
//! the module's export surface.

use std::collections::BTreeSet;
use thiserror::Error;
use tree_sitter::{Node, Parser};

use crate::types::ExportSurface;

/// Name of the stand-in class injected into patched aggregators.
pub const PRUNED_HELPER_CLASS: &str = "_PrunedAway";

/// Errors from the Python scanner.
#[derive(Debug, Error)]
pub enum SyntaxError {
    /// The grammar could not be loaded.
    #[error("failed to load Python grammar: {0}")]
    Language(String),

    /// tree-sitter gave up on the input.
    #[error("parser produced no tree")]
    ParseFailed,
}

/// Where an import statement sits syntactically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImportScope {
    /// Top level, executed unconditionally on import.
    Module,
    /// Top level but nested in `if`/`try`/`with`/loops.
    Conditional,
    /// Inside a function or lambda body.
    Function,
    /// Under `if TYPE_CHECKING:`; never executed at runtime.
    TypeChecking,
}

/// `import a.b.c [as x]` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedModule {
    /// Dotted module path.
    pub dotted: String,
    /// Alias, if any.
    pub alias: Option<String>,
}

/// `from m import name [as x]` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedName {
    /// Imported name.
    pub name: String,
    /// Alias, if any.
    pub alias: Option<String>,
}

impl ImportedName {
    /// Name bound in the importing module.
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Shape of an import statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportForm {
    /// `import a, b.c as d`
    Import {
        /// Imported modules.
        modules: Vec<ImportedModule>,
    },
    /// `from ..m import x, y` / `from m import *`
    From {
        /// Dotted module after the leading dots, if any.
        module: Option<String>,
        /// Number of leading dots.
        level: usize,
        /// Imported names (empty for wildcards).
        names: Vec<ImportedName>,
        /// `import *`.
        wildcard: bool,
    },
}

/// One import statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStatement {
    /// 1-based line.
    pub line: u32,
    /// Byte range start.
    pub start_byte: usize,
    /// Byte range end.
    pub end_byte: usize,
    /// Statement shape.
    pub form: ImportForm,
    /// Syntactic scope.
    pub scope: ImportScope,
}

/// `importlib.import_module("x", "pkg")` / `__import__("x")` with literal arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicImport {
    /// 1-based line.
    pub line: u32,
    /// Module argument.
    pub module: String,
    /// Package argument for relative names.
    pub package: Option<String>,
}

/// A plain (non-interpolated) string literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringLiteral {
    /// 1-based line.
    pub line: u32,
    /// Literal content without quotes or prefix.
    pub value: String,
}

/// Everything extracted from one source file.
#[derive(Debug, Clone, Default)]
pub struct SourceScan {
    /// Import statements in source order.
    pub imports: Vec<ImportStatement>,
    /// Literal dynamic imports.
    pub dynamic: Vec<DynamicImport>,
    /// String literals.
    pub literals: Vec<StringLiteral>,
    /// Declared export surface.
    pub exports: ExportSurface,
    /// Whether the tree contains error or missing nodes.
    pub has_syntax_errors: bool,
    /// Byte offset after the docstring, `__future__` imports and leading comments.
    pub helper_offset: usize,
    /// Whether the stand-in helper class is already defined.
    pub has_helper: bool,
    /// Top-level statements other than docstrings, comments, `pass`,
    /// `__future__` imports, `__all__` and stand-in bindings.
    pub substantive_statements: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Context {
    in_function: bool,
    in_type_checking: bool,
    in_conditional: bool,
}

impl Context {
    fn scope(self) -> ImportScope {
        if self.in_type_checking {
            ImportScope::TypeChecking
        } else if self.in_function {
            ImportScope::Function
        } else if self.in_conditional {
            ImportScope::Conditional
        } else {
            ImportScope::Module
        }
    }
}

/// Tree-sitter backed Python scanner. Not `Sync`; keep one per thread.
pub struct PythonParser {
    parser: Parser,
}

impl std::fmt::Debug for PythonParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PythonParser").finish_non_exhaustive()
    }
}

impl PythonParser {
    /// Create a parser with the Python grammar loaded.
    pub fn new() -> Result<Self, SyntaxError> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| SyntaxError::Language(e.to_string()))?;
        Ok(Self { parser })
    }

    /// Whether `source` parses without error nodes.
    pub fn is_valid(&mut self, source: &str) -> Result<bool, SyntaxError> {
        let tree = self.parser.parse(source, None).ok_or(SyntaxError::ParseFailed)?;
        Ok(!tree.root_node().has_error())
    }

    /// Scan one source file.
    pub fn scan(&mut self, source: &str) -> Result<SourceScan, SyntaxError> {
        let tree = self.parser.parse(source, None).ok_or(SyntaxError::ParseFailed)?;
        let root = tree.root_node();

        let mut scan = SourceScan {
            has_syntax_errors: root.has_error(),
            ..SourceScan::default()
        };
        let mut walker = Walker { src: source, scan: &mut scan };
        walker.visit(root, Context::default());

        let top: Vec<Node> = {
            let mut cursor = root.walk();
            root.named_children(&mut cursor).collect()
        };
        scan.helper_offset = helper_offset(&top, source);
        scan.exports = export_surface(&top, source);
        scan.has_helper = top.iter().any(|n| is_helper_class(*n, source));
        let docstring = first_statement(&top).filter(|n| is_docstring(*n));
        scan.substantive_statements = top
            .iter()
            .filter(|n| Some(**n) != docstring && !is_insubstantial(**n, source))
            .count();
        Ok(scan)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tree walk
// ─────────────────────────────────────────────────────────────────────────────

struct Walker<'a, 's> {
    src: &'s str,
    scan: &'a mut SourceScan,
}

impl<'a, 's> Walker<'a, 's> {
    fn visit(&mut self, node: Node, ctx: Context) {
        match node.kind() {
            "import_statement" => {
                let modules = self.imported_modules(node);
                if !modules.is_empty() {
                    self.push_import(node, ImportForm::Import { modules }, ctx);
                }
                return;
            }
            "import_from_statement" => {
                if let Some(form) = self.from_form(node) {
                    self.push_import(node, form, ctx);
                }
                return;
            }
            "future_import_statement" => return,
            "call" => self.dynamic_import(node),
            "string" => {
                self.string_literal(node);
                return;
            }
            _ => {}
        }

        let mut inner = ctx;
        match node.kind() {
            "function_definition" | "lambda" => inner.in_function = true,
            "try_statement" | "with_statement" | "for_statement" | "while_statement"
            | "match_statement" => inner.in_conditional = true,
            "if_statement" => {
                inner.in_conditional = true;
                let guarded = node
                    .child_by_field_name("condition")
                    .map(|c| text(c, self.src).contains("TYPE_CHECKING"))
                    .unwrap_or(false);
                if guarded {
                    let consequence = node.child_by_field_name("consequence");
                    for child in children(node) {
                        let mut child_ctx = inner;
                        if Some(child) == consequence {
                            child_ctx.in_type_checking = true;
                        }
                        self.visit(child, child_ctx);
                    }
                    return;
                }
            }
            _ => {}
        }

        for child in children(node) {
            self.visit(child, inner);
        }
    }

    fn push_import(&mut self, node: Node, form: ImportForm, ctx: Context) {
        self.scan.imports.push(ImportStatement {
            line: line_of(node),
            start_byte: node.start_byte(),
            end_byte: node.end_byte(),
            form,
            scope: ctx.scope(),
        });
    }

    fn imported_modules(&self, node: Node) -> Vec<ImportedModule> {
        let mut cursor = node.walk();
        node.children_by_field_name("name", &mut cursor)
            .filter_map(|n| self.module_or_alias(n))
            .map(|(dotted, alias)| ImportedModule { dotted, alias })
            .collect()
    }

    fn module_or_alias(&self, node: Node) -> Option<(String, Option<String>)> {
        match node.kind() {
            "dotted_name" => Some((dotted(node, self.src), None)),
            "aliased_import" => {
                let name = node.child_by_field_name("name")?;
                let alias = node.child_by_field_name("alias").map(|a| text(a, self.src).to_string());
                Some((dotted(name, self.src), alias))
            }
            _ => None,
        }
    }

    fn from_form(&self, node: Node) -> Option<ImportForm> {
        let module_node = node.child_by_field_name("module_name")?;
        let (module, level) = match module_node.kind() {
            "relative_import" => {
                let mut level = 0;
                let mut module = None;
                for child in children(module_node) {
                    match child.kind() {
                        "import_prefix" => level = text(child, self.src).matches('.').count(),
                        "dotted_name" => module = Some(dotted(child, self.src)),
                        _ => {}
                    }
                }
                (module, level)
            }
            _ => (Some(dotted(module_node, self.src)), 0),
        };

        let wildcard = children(node).iter().any(|c| c.kind() == "wildcard_import");
        let names = {
            let mut cursor = node.walk();
            node.children_by_field_name("name", &mut cursor)
                .filter_map(|n| self.module_or_alias(n))
                .map(|(name, alias)| ImportedName { name, alias })
                .collect()
        };
        Some(ImportForm::From {
            module,
            level,
            names,
            wildcard,
        })
    }

    fn dynamic_import(&mut self, node: Node) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let callee = text(function, self.src);
        let is_loader = matches!(
            callee,
            "importlib.import_module" | "import_module" | "__import__"
        );
        if !is_loader {
            return;
        }
        let Some(arguments) = node.child_by_field_name("arguments") else {
            return;
        };

        let mut positional = Vec::new();
        let mut package = None;
        for arg in children(arguments) {
            match arg.kind() {
                "string" => positional.push(string_value(arg, self.src)),
                "keyword_argument" => {
                    let key = arg.child_by_field_name("name").map(|n| text(n, self.src));
                    let value = arg.child_by_field_name("value");
                    if key == Some("package") {
                        if let Some(v) = value.filter(|v| v.kind() == "string") {
                            package = string_value(v, self.src);
                        }
                    }
                }
                "(" | ")" | "," | "comment" => {}
                _ => positional.push(None),
            }
        }

        let Some(Some(module)) = positional.first().cloned() else {
            return;
        };
        if callee != "__import__" && package.is_none() {
            package = positional.get(1).cloned().flatten();
        }
        self.scan.dynamic.push(DynamicImport {
            line: line_of(node),
            module,
            package,
        });
    }

    fn string_literal(&mut self, node: Node) {
        if let Some(value) = string_value(node, self.src) {
            self.scan.literals.push(StringLiteral {
                line: line_of(node),
                value,
            });
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn children(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

fn text<'s>(node: Node, src: &'s str) -> &'s str {
    src.get(node.start_byte()..node.end_byte()).unwrap_or("")
}

fn line_of(node: Node) -> u32 {
    node.start_position().row as u32 + 1
}

fn dotted(node: Node, src: &str) -> String {
    text(node, src)
        .split('.')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(".")
}

/// Content of a non-interpolated string literal.
fn string_value(node: Node, src: &str) -> Option<String> {
    let parts = children(node);
    let start = parts.iter().find(|c| c.kind() == "string_start")?;
    let end = parts.iter().rev().find(|c| c.kind() == "string_end")?;
    let prefix = text(*start, src).to_ascii_lowercase();
    if prefix.contains('f') || parts.iter().any(|c| c.kind() == "interpolation") {
        return None;
    }
    src.get(start.end_byte()..end.start_byte()).map(str::to_string)
}

fn is_docstring(node: Node) -> bool {
    node.kind() == "expression_statement"
        && node.named_child_count() == 1
        && node.named_child(0).map(|c| c.kind() == "string").unwrap_or(false)
}

fn first_statement<'t>(top: &[Node<'t>]) -> Option<Node<'t>> {
    top.iter().copied().find(|n| n.kind() != "comment")
}

fn helper_offset(top: &[Node], src: &str) -> usize {
    let docstring = first_statement(top).filter(|n| is_docstring(*n));
    let mut offset = 0;
    for node in top {
        let skippable = node.kind() == "comment"
            || node.kind() == "future_import_statement"
            || Some(*node) == docstring;
        if !skippable {
            break;
        }
        offset = line_end(src, node.end_byte());
    }
    offset
}

/// Offset just past the newline ending the line containing `pos`.
pub(crate) fn line_end(src: &str, pos: usize) -> usize {
    match src.get(pos..).and_then(|rest| rest.find('\n')) {
        Some(idx) => pos + idx + 1,
        None => src.len(),
    }
}

fn assignment_of(node: Node) -> Option<Node> {
    if node.kind() != "expression_statement" {
        return None;
    }
    node.named_child(0)
        .filter(|c| c.kind() == "assignment" || c.kind() == "augmented_assignment")
}

fn is_helper_class(node: Node, src: &str) -> bool {
    node.kind() == "class_definition"
        && node
            .child_by_field_name("name")
            .map(|n| text(n, src) == PRUNED_HELPER_CLASS)
            .unwrap_or(false)
}

fn is_insubstantial(node: Node, src: &str) -> bool {
    match node.kind() {
        "comment" | "pass_statement" | "future_import_statement" => true,
        _ if is_helper_class(node, src) => true,
        _ => {
            let Some(assign) = assignment_of(node) else {
                return false;
            };
            let left = assign.child_by_field_name("left").map(|l| text(l, src));
            if left == Some("__all__") {
                return true;
            }
            assign
                .child_by_field_name("right")
                .filter(|r| r.kind() == "call")
                .and_then(|r| r.child_by_field_name("function"))
                .map(|f| text(f, src) == PRUNED_HELPER_CLASS)
                .unwrap_or(false)
        }
    }
}

fn export_surface(top: &[Node], src: &str) -> ExportSurface {
    let mut declared: Option<BTreeSet<String>> = None;
    let mut dynamic = false;
    let mut bound = BTreeSet::new();

    for node in top {
        let node = if node.kind() == "decorated_definition" {
            match node.child_by_field_name("definition") {
                Some(def) => def,
                None => continue,
            }
        } else {
            *node
        };

        match node.kind() {
            "function_definition" | "class_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    bound.insert(text(name, src).to_string());
                }
            }
            "import_from_statement" => {
                let mut cursor = node.walk();
                for n in node.children_by_field_name("name", &mut cursor) {
                    let name = match n.kind() {
                        "aliased_import" => n.child_by_field_name("alias"),
                        _ => Some(n),
                    };
                    if let Some(name) = name {
                        bound.insert(text(name, src).to_string());
                    }
                }
            }
            _ => {
                let Some(assign) = assignment_of(node) else {
                    continue;
                };
                let Some(left) = assign.child_by_field_name("left") else {
                    continue;
                };
                let name = text(left, src);
                if name != "__all__" {
                    if left.kind() == "identifier" {
                        bound.insert(name.to_string());
                    }
                    continue;
                }
                if assign.kind() == "augmented_assignment" {
                    dynamic = true;
                    continue;
                }
                match assign.child_by_field_name("right").and_then(|r| literal_names(r, src)) {
                    Some(names) => declared = Some(names),
                    None => dynamic = true,
                }
            }
        }
    }

    if dynamic {
        return ExportSurface::Dynamic;
    }
    match declared {
        Some(names) => ExportSurface::Known(names),
        None => {
            let public: BTreeSet<String> = bound.into_iter().filter(|n| !n.starts_with('_')).collect();
            if public.is_empty() {
                ExportSurface::Empty
            } else {
                ExportSurface::Known(public)
            }
        }
    }
}

fn literal_names(node: Node, src: &str) -> Option<BTreeSet<String>> {
    if node.kind() != "list" && node.kind() != "tuple" {
        return None;
    }
    let mut names = BTreeSet::new();
    let mut cursor = node.walk();
    for item in node.named_children(&mut cursor) {
        match item.kind() {
            "string" => names.insert(string_value(item, src)?),
            "comment" => continue,
            _ => return None,
        };
    }
    Some(names)
}
