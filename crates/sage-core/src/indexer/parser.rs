//! Parser boundary: language front-ends turn raw file bytes into a
//! language-neutral syntax tree of definitions, call sites and imports.

use std::path::Path;
use std::sync::Arc;

use tree_sitter::Node;

use crate::models::ImportedName;

// ---------------------------------------------------------------------------
// Language-neutral syntax tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Class,
    Function,
}

/// A call expression as written at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCall {
    pub callee: String,
    /// 1-based line.
    pub line: i64,
    /// 0-based byte column.
    pub column: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImport {
    pub module: String,
    pub module_alias: Option<String>,
    /// Empty for whole-module imports.
    pub names: Vec<ImportedName>,
    pub line: i64,
}

/// A class or function definition with everything nested inside it.
#[derive(Debug, Clone)]
pub struct SyntaxNode {
    pub kind: DefinitionKind,
    pub name: String,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub start_line: i64,
    pub end_line: i64,
    pub start_byte: usize,
    pub end_byte: usize,
    /// Calls made directly in this definition's own scope.
    pub calls: Vec<RawCall>,
    pub children: Vec<SyntaxNode>,
}

#[derive(Debug, Clone, Default)]
pub struct SyntaxTree {
    pub module_docstring: Option<String>,
    pub definitions: Vec<SyntaxNode>,
    /// Calls made at module level.
    pub module_calls: Vec<RawCall>,
    pub imports: Vec<RawImport>,
}

/// Where a module named in an import statement could live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleCandidate {
    pub path: String,
    pub is_dir: bool,
}

/// Name-visibility rules the resolver applies for a language.
#[derive(Debug, Clone, Copy)]
pub struct ScopeRules {
    /// Whether bare names inside a method can see members of the enclosing
    /// class body.
    pub class_members_visible: bool,
    /// Receiver names that refer to the enclosing class instance.
    pub self_receivers: &'static [&'static str],
}

/// A language front-end.
pub trait SyntaxParser: Send + Sync {
    fn language(&self) -> &'static str;

    /// Lowercase file extensions handled, including the leading dot.
    fn extensions(&self) -> &'static [&'static str];

    fn handles(&self, path: &str) -> bool {
        let ext = match Path::new(path).extension() {
            Some(e) => format!(".{}", e.to_string_lossy().to_lowercase()),
            None => return false,
        };
        self.extensions().contains(&ext.as_str())
    }

    /// Parse raw bytes. A tree with syntax errors is an error.
    fn parse(&self, path: &str, source: &[u8]) -> Result<SyntaxTree, String>;

    /// Dotted module name of a repository-relative path.
    fn module_name(&self, path: &str) -> String;

    /// Repository-relative locations a module import may refer to, in
    /// preference order.
    fn module_candidates(&self, source_path: &str, module: &str) -> Vec<ModuleCandidate>;

    fn scope_rules(&self) -> ScopeRules;
}

/// Parsers available to an indexing pass, selected by file extension.
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn SyntaxParser>>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self {
            parsers: vec![Arc::new(PythonParser)],
        }
    }
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self { parsers: vec![] }
    }

    pub fn register(&mut self, parser: Arc<dyn SyntaxParser>) {
        self.parsers.push(parser);
    }

    pub fn for_path(&self, path: &str) -> Option<&Arc<dyn SyntaxParser>> {
        self.parsers.iter().find(|p| p.handles(path))
    }

    pub fn languages(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|p| p.language()).collect()
    }
}

/// Collapse `a/./b/../c` style paths into `a/c`.
pub fn normalize_posix_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

// ---------------------------------------------------------------------------
// Python
// ---------------------------------------------------------------------------

/// Python front-end backed by tree-sitter.
pub struct PythonParser;

const PYTHON_SCOPE_RULES: ScopeRules = ScopeRules {
    class_members_visible: false,
    self_receivers: &["self", "cls"],
};

impl SyntaxParser for PythonParser {
    fn language(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".py", ".pyi"]
    }

    fn parse(&self, path: &str, source: &[u8]) -> Result<SyntaxTree, String> {
        let text =
            std::str::from_utf8(source).map_err(|e| format!("{path} is not valid UTF-8: {e}"))?;

        let mut parser = tree_sitter::Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| format!("Failed to set language: {e}"))?;
        let tree = parser
            .parse(text, None)
            .ok_or_else(|| format!("Failed to parse {path}"))?;

        let root = tree.root_node();
        if root.has_error() {
            let at = first_error(root).unwrap_or(root).start_position();
            return Err(format!(
                "syntax error at line {}, column {}",
                at.row + 1,
                at.column + 1
            ));
        }

        let mut walker = PythonWalker {
            source: text.as_bytes(),
            imports: Vec::new(),
        };
        let mut definitions = Vec::new();
        let mut module_calls = Vec::new();
        walker.visit_children(root, &mut definitions, &mut module_calls);

        Ok(SyntaxTree {
            module_docstring: block_docstring(root, text.as_bytes()),
            definitions,
            module_calls,
            imports: walker.imports,
        })
    }

    fn module_name(&self, path: &str) -> String {
        let trimmed = path
            .strip_suffix(".py")
            .or_else(|| path.strip_suffix(".pyi"))
            .unwrap_or(path);
        let mut parts: Vec<&str> = trimmed
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        if parts.len() > 1 && parts.last() == Some(&"__init__") {
            parts.pop();
        }
        parts.join(".")
    }

    fn module_candidates(&self, source_path: &str, module: &str) -> Vec<ModuleCandidate> {
        if module.is_empty() {
            return vec![];
        }
        let bases: Vec<String> = if module.starts_with('.') {
            let levels = module.chars().take_while(|&c| c == '.').count();
            let suffix = &module[levels..];
            let mut base_dir = Path::new(source_path)
                .parent()
                .unwrap_or(Path::new(""))
                .to_path_buf();
            for _ in 0..levels.saturating_sub(1) {
                base_dir = base_dir.parent().unwrap_or(Path::new("")).to_path_buf();
            }
            let base_dir = base_dir.to_string_lossy().replace('\\', "/");
            vec![normalize_posix_path(&format!(
                "{base_dir}/{}",
                suffix.replace('.', "/")
            ))]
        } else {
            let rel = module.replace('.', "/");
            vec![rel.clone(), format!("src/{rel}")]
        };

        let mut candidates = Vec::new();
        for base in &bases {
            let prefix = if base.is_empty() {
                String::new()
            } else {
                format!("{base}/")
            };
            if !base.is_empty() {
                candidates.push(ModuleCandidate {
                    path: format!("{base}.py"),
                    is_dir: false,
                });
                candidates.push(ModuleCandidate {
                    path: format!("{base}.pyi"),
                    is_dir: false,
                });
            }
            candidates.push(ModuleCandidate {
                path: format!("{prefix}__init__.py"),
                is_dir: false,
            });
            candidates.push(ModuleCandidate {
                path: base.clone(),
                is_dir: true,
            });
        }
        candidates
    }

    fn scope_rules(&self) -> ScopeRules {
        PYTHON_SCOPE_RULES
    }
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .filter(|c| c.has_error())
        .find_map(first_error)
}

/// Docstring of a module or block: a leading string expression statement.
fn block_docstring(block: Node<'_>, source: &[u8]) -> Option<String> {
    let mut cursor = block.walk();
    let first = block.named_children(&mut cursor).next()?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let mut inner = first.walk();
    let expr = first.named_children(&mut inner).next()?;
    if expr.kind() != "string" {
        return None;
    }
    let raw = expr.utf8_text(source).ok()?;
    let cleaned = strip_string_literal(raw);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Contiguous `#` comment lines directly above a definition (and its
/// decorators). Trailing comments of a previous statement do not count.
fn leading_comment(span: Node<'_>, source: &[u8]) -> Option<String> {
    let mut lines = Vec::new();
    let mut next_row = span.start_position().row;
    let mut node = span.prev_sibling();
    while let Some(comment) = node.filter(|n| n.kind() == "comment") {
        if comment.end_position().row + 1 != next_row || !starts_line(comment, source) {
            break;
        }
        let text = comment.utf8_text(source).ok()?;
        lines.push(text.trim_start_matches('#').trim().to_string());
        next_row = comment.start_position().row;
        node = comment.prev_sibling();
    }
    lines.reverse();
    let joined = lines.join("\n").trim().to_string();
    (!joined.is_empty()).then_some(joined)
}

fn starts_line(node: Node<'_>, source: &[u8]) -> bool {
    source[..node.start_byte()]
        .iter()
        .rev()
        .take_while(|&&b| b != b'\n')
        .all(|b| b.is_ascii_whitespace())
}

fn strip_string_literal(raw: &str) -> String {
    let unprefixed = raw.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if let Some(inner) = unprefixed
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    unprefixed.trim().to_string()
}

/// `foo` or `a.b.c` callee text; anything else (subscripts, calls on call
/// results) has no static name.
fn dotted_name(node: Node<'_>, source: &[u8]) -> Option<String> {
    match node.kind() {
        "identifier" => node.utf8_text(source).ok().map(str::to_string),
        "attribute" => {
            let object = node.child_by_field_name("object")?;
            let attribute = node.child_by_field_name("attribute")?;
            Some(format!(
                "{}.{}",
                dotted_name(object, source)?,
                attribute.utf8_text(source).ok()?
            ))
        }
        _ => None,
    }
}

/// 1-based last line of a node, not counting a trailing line break.
fn last_line(node: Node<'_>) -> i64 {
    let start = node.start_position();
    let end = node.end_position();
    if end.column == 0 && end.row > start.row {
        end.row as i64
    } else {
        end.row as i64 + 1
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

struct PythonWalker<'s> {
    source: &'s [u8],
    imports: Vec<RawImport>,
}

impl<'s> PythonWalker<'s> {
    fn visit_children(
        &mut self,
        node: Node<'_>,
        definitions: &mut Vec<SyntaxNode>,
        calls: &mut Vec<RawCall>,
    ) {
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
        for child in children {
            self.visit(child, definitions, calls);
        }
    }

    fn visit(&mut self, node: Node<'_>, definitions: &mut Vec<SyntaxNode>, calls: &mut Vec<RawCall>) {
        match node.kind() {
            "function_definition" | "class_definition" => {
                if let Some(def) = self.definition(node, node, calls) {
                    definitions.push(def);
                }
                return;
            }
            "decorated_definition" => {
                let mut cursor = node.walk();
                let decorators: Vec<Node<'_>> = node
                    .named_children(&mut cursor)
                    .filter(|c| c.kind() == "decorator")
                    .collect();
                for decorator in decorators {
                    self.visit_children(decorator, definitions, calls);
                }
                if let Some(inner) = node.child_by_field_name("definition") {
                    if let Some(def) = self.definition(inner, node, calls) {
                        definitions.push(def);
                    }
                }
                return;
            }
            "call" => {
                if let Some(function) = node.child_by_field_name("function") {
                    if let Some(callee) = dotted_name(function, self.source) {
                        let at = node.start_position();
                        calls.push(RawCall {
                            callee,
                            line: at.row as i64 + 1,
                            column: at.column as i64,
                        });
                    }
                }
            }
            "import_statement" => {
                self.import_statement(node);
                return;
            }
            "import_from_statement" => {
                self.import_from_statement(node);
                return;
            }
            _ => {}
        }
        self.visit_children(node, definitions, calls);
    }

    /// `node` is the class/function itself; `span` also covers decorators.
    /// Header expressions (defaults, bases, annotations) belong to the
    /// enclosing scope and land in `outer_calls`.
    fn definition(
        &mut self,
        node: Node<'_>,
        span: Node<'_>,
        outer_calls: &mut Vec<RawCall>,
    ) -> Option<SyntaxNode> {
        let kind = match node.kind() {
            "class_definition" => DefinitionKind::Class,
            "function_definition" => DefinitionKind::Function,
            _ => return None,
        };
        let name = node
            .child_by_field_name("name")?
            .utf8_text(self.source)
            .ok()?
            .to_string();
        let body = node.child_by_field_name("body");

        let header_end = body.map(|b| b.start_byte()).unwrap_or(node.end_byte());
        let signature = std::str::from_utf8(&self.source[node.start_byte()..header_end])
            .ok()
            .map(|h| collapse_whitespace(h.trim().trim_end_matches(':')))
            .filter(|s| !s.is_empty());

        let mut header_definitions = Vec::new();
        for field in ["parameters", "superclasses", "return_type"] {
            if let Some(header) = node.child_by_field_name(field) {
                self.visit_children(header, &mut header_definitions, outer_calls);
            }
        }

        let mut children = Vec::new();
        let mut calls = Vec::new();
        let docstring = body
            .and_then(|b| block_docstring(b, self.source))
            .or_else(|| leading_comment(span, self.source));
        if let Some(b) = body {
            self.visit_children(b, &mut children, &mut calls);
        }

        Some(SyntaxNode {
            kind,
            name,
            signature,
            docstring,
            start_line: span.start_position().row as i64 + 1,
            end_line: last_line(span),
            start_byte: span.start_byte(),
            end_byte: span.end_byte(),
            calls,
            children,
        })
    }

    fn import_statement(&mut self, node: Node<'_>) {
        let line = node.start_position().row as i64 + 1;
        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        for name in names {
            let (module, alias) = match name.kind() {
                "aliased_import" => (
                    name.child_by_field_name("name")
                        .and_then(|n| n.utf8_text(self.source).ok()),
                    name.child_by_field_name("alias")
                        .and_then(|n| n.utf8_text(self.source).ok()),
                ),
                _ => (name.utf8_text(self.source).ok(), None),
            };
            if let Some(module) = module {
                self.imports.push(RawImport {
                    module: module.to_string(),
                    module_alias: alias.map(str::to_string),
                    names: vec![],
                    line,
                });
            }
        }
    }

    fn import_from_statement(&mut self, node: Node<'_>) {
        let line = node.start_position().row as i64 + 1;
        let module = match node
            .child_by_field_name("module_name")
            .and_then(|n| n.utf8_text(self.source).ok())
        {
            Some(m) => m.to_string(),
            None => return,
        };

        let mut imported = Vec::new();
        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        for name in names {
            match name.kind() {
                "aliased_import" => {
                    let original = name
                        .child_by_field_name("name")
                        .and_then(|n| n.utf8_text(self.source).ok());
                    let alias = name
                        .child_by_field_name("alias")
                        .and_then(|n| n.utf8_text(self.source).ok());
                    if let Some(original) = original {
                        imported.push(ImportedName::new(original, alias));
                    }
                }
                _ => {
                    if let Ok(text) = name.utf8_text(self.source) {
                        imported.push(ImportedName::new(text, None));
                    }
                }
            }
        }
        let mut cursor = node.walk();
        let wildcard = node
            .named_children(&mut cursor)
            .any(|c| c.kind() == "wildcard_import");
        if wildcard {
            imported.push(ImportedName::new("*", None));
        }

        self.imports.push(RawImport {
            module,
            module_alias: None,
            names: imported,
            line,
        });
    }
}
