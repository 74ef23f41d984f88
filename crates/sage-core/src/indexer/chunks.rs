//! Chunk extraction: flattens a file's syntax tree into an ordered list of
//! module/class/function/method chunks with local parent references.

use serde::{Deserialize, Serialize};

use crate::config::IndexConfig;
use crate::indexer::parser::{DefinitionKind, RawCall, RawImport, SyntaxNode, SyntaxTree};
use crate::models::ChunkKind;

const QUALIFIED_SEPARATOR: &str = ".";
const CHARS_PER_TOKEN: f64 = 3.5;

/// A chunk ready to be committed. `parent` is an index into the same
/// sequence and always points at an earlier element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkCandidate {
    pub kind: ChunkKind,
    pub name: String,
    pub qualified_name: String,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub content: String,
    pub start_line: i64,
    pub end_line: i64,
    pub start_byte: i64,
    pub end_byte: i64,
    pub token_count: i64,
    pub parent: Option<usize>,
    pub enhanced_text: Option<String>,
}

/// A call site attributed to the innermost chunk containing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCall {
    pub chunk: usize,
    pub call: RawCall,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedFile {
    pub chunks: Vec<ChunkCandidate>,
    pub calls: Vec<ChunkCall>,
    pub imports: Vec<RawImport>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("chunk '{child}' is not nested inside its parent '{parent}'")]
    NotNested { child: String, parent: String },

    #[error("chunk '{child}' references parent #{parent} that does not precede it")]
    ParentOrder { child: String, parent: usize },

    #[error("chunk '{name}' has an invalid byte span {start}..{end}")]
    InvalidSpan { name: String, start: usize, end: usize },
}

/// Rough token estimate shared by chunk sizing and enhanced-text budgets.
pub fn estimate_tokens(text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    (text.len() as f64 / CHARS_PER_TOKEN).max(1.0) as i64
}

pub fn join_qualified(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}{QUALIFIED_SEPARATOR}{name}")
    }
}

/// Flatten `tree` into chunks. The first chunk is always the module itself,
/// qualified by `module_name`; nested definitions follow in pre-order, so a
/// parent always precedes its children.
pub fn extract_chunks(
    path: &str,
    source: &str,
    module_name: &str,
    tree: &SyntaxTree,
    config: &IndexConfig,
) -> Result<ExtractedFile, ExtractError> {
    let mut out = ExtractedFile {
        imports: tree.imports.clone(),
        ..ExtractedFile::default()
    };

    let short_name = module_name
        .rsplit(QUALIFIED_SEPARATOR)
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(path);
    let line_count = source.lines().count().max(1) as i64;
    out.chunks.push(ChunkCandidate {
        kind: ChunkKind::Module,
        name: short_name.to_string(),
        qualified_name: module_name.to_string(),
        signature: None,
        docstring: tree.module_docstring.clone(),
        content: source.to_string(),
        start_line: 1,
        end_line: line_count,
        start_byte: 0,
        end_byte: source.len() as i64,
        token_count: estimate_tokens(source),
        parent: None,
        enhanced_text: None,
    });
    out.calls.extend(tree.module_calls.iter().map(|call| ChunkCall {
        chunk: 0,
        call: call.clone(),
    }));

    for definition in &tree.definitions {
        push_definition(&mut out, source, definition, 0)?;
    }

    validate_nesting(&out.chunks)?;

    for chunk in &mut out.chunks {
        chunk.enhanced_text = Some(render_enhanced_text(chunk, config.max_tokens_per_chunk));
    }
    Ok(out)
}

fn push_definition(
    out: &mut ExtractedFile,
    source: &str,
    node: &SyntaxNode,
    parent: usize,
) -> Result<(), ExtractError> {
    let parent_chunk = &out.chunks[parent];
    let kind = match (node.kind, parent_chunk.kind) {
        (DefinitionKind::Class, _) => ChunkKind::Class,
        (DefinitionKind::Function, ChunkKind::Class) => ChunkKind::Method,
        (DefinitionKind::Function, _) => ChunkKind::Function,
    };
    let qualified_name = join_qualified(&parent_chunk.qualified_name, &node.name);

    let content = source
        .get(node.start_byte..node.end_byte)
        .ok_or_else(|| ExtractError::InvalidSpan {
            name: qualified_name.clone(),
            start: node.start_byte,
            end: node.end_byte,
        })?
        .to_string();

    let index = out.chunks.len();
    out.chunks.push(ChunkCandidate {
        kind,
        name: node.name.clone(),
        qualified_name,
        signature: node.signature.clone(),
        docstring: node.docstring.clone(),
        token_count: estimate_tokens(&content),
        content,
        start_line: node.start_line,
        end_line: node.end_line,
        start_byte: node.start_byte as i64,
        end_byte: node.end_byte as i64,
        parent: Some(parent),
        enhanced_text: None,
    });
    out.calls.extend(node.calls.iter().map(|call| ChunkCall {
        chunk: index,
        call: call.clone(),
    }));

    for child in &node.children {
        push_definition(out, source, child, index)?;
    }
    Ok(())
}

/// Every parent must precede its child and contain its line and byte span.
pub fn validate_nesting(chunks: &[ChunkCandidate]) -> Result<(), ExtractError> {
    for (index, chunk) in chunks.iter().enumerate() {
        let Some(p) = chunk.parent else { continue };
        if p >= index {
            return Err(ExtractError::ParentOrder {
                child: chunk.qualified_name.clone(),
                parent: p,
            });
        }
        let parent = &chunks[p];
        let contained = chunk.start_line >= parent.start_line
            && chunk.end_line <= parent.end_line
            && chunk.start_byte >= parent.start_byte
            && chunk.end_byte <= parent.end_byte;
        if !contained {
            return Err(ExtractError::NotNested {
                child: chunk.qualified_name.clone(),
                parent: parent.qualified_name.clone(),
            });
        }
    }
    Ok(())
}

/// Deterministic embedding input: qualified name, signature, docstring and
/// as much of the body as fits the token budget.
pub fn render_enhanced_text(chunk: &ChunkCandidate, max_tokens: usize) -> String {
    let mut sections: Vec<&str> = vec![chunk.qualified_name.as_str()];
    if let Some(signature) = chunk.signature.as_deref() {
        sections.push(signature);
    }
    if let Some(docstring) = chunk.docstring.as_deref() {
        sections.push(docstring);
    }
    let header = sections.join("\n");
    let remaining = (max_tokens as i64 - estimate_tokens(&header)).max(0) as usize;
    let excerpt = body_excerpt(&chunk.content, remaining);
    if excerpt.is_empty() {
        header
    } else {
        format!("{header}\n\n{excerpt}")
    }
}

/// Longest prefix of `body` within `budget_tokens`, cut at a line break when
/// one is available.
fn body_excerpt(body: &str, budget_tokens: usize) -> &str {
    let max_bytes = (budget_tokens as f64 * CHARS_PER_TOKEN) as usize;
    if body.len() <= max_bytes {
        return body.trim_end();
    }
    let mut cut = max_bytes;
    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    let prefix = &body[..cut];
    match prefix.rfind('\n') {
        Some(newline) if newline > 0 => prefix[..newline].trim_end(),
        _ => prefix.trim_end(),
    }
}
