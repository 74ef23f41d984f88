//! Call resolution against a repository-wide symbol snapshot.
//!
//! The snapshot mixes chunks already persisted for untouched files with the
//! extracted but uncommitted chunks of files re-parsed in the current pass,
//! so a file can resolve calls into a sibling that has not been written yet.
//!
//! Resolution is cascading: enclosing scopes of the same file, then names
//! bound by the file's imports, then a repository-wide simple name that is
//! unique. Anything else stays unresolved; nothing is guessed.

use std::collections::HashMap;

use crate::indexer::chunks::{join_qualified, ChunkCandidate};
use crate::indexer::imports::ImportBindings;
use crate::indexer::parser::ScopeRules;
use crate::models::ChunkKind;
use crate::store::database::SymbolRow;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Identity of a chunk inside the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkRef {
    /// A persisted chunk id.
    Stored(i64),
    /// Chunk `index` of changed file `file` in the current pass.
    Pending { file: usize, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ChunkRef),
    /// Bound by an import of a module outside the repository.
    External,
    Unresolved,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub target: ChunkRef,
    pub path: String,
    pub kind: ChunkKind,
    pub name: String,
    pub qualified_name: String,
}

/// Where a call is made from.
#[derive(Debug, Clone, Copy)]
pub struct CallerScope<'a> {
    pub path: &'a str,
    /// Dotted module name of `path`.
    pub module: &'a str,
    /// Qualified name of the calling chunk.
    pub qualified_name: &'a str,
}

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_qualified: HashMap<String, Vec<usize>>,
    by_simple: HashMap<String, Vec<usize>>,
}

fn is_callable(kind: ChunkKind) -> bool {
    !matches!(kind, ChunkKind::Module)
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: &[SymbolRow]) -> Self {
        let mut table = Self::new();
        for row in rows {
            table.insert(Symbol {
                target: ChunkRef::Stored(row.chunk_id),
                path: row.relative_path.clone(),
                kind: row.kind,
                name: row.name.clone(),
                qualified_name: row.qualified_name.clone(),
            });
        }
        table
    }

    /// Add the extracted chunks of changed file number `file`.
    pub fn add_pending(&mut self, file: usize, path: &str, chunks: &[ChunkCandidate]) {
        for (index, chunk) in chunks.iter().enumerate() {
            self.insert(Symbol {
                target: ChunkRef::Pending { file, index },
                path: path.to_string(),
                kind: chunk.kind,
                name: chunk.name.clone(),
                qualified_name: chunk.qualified_name.clone(),
            });
        }
    }

    pub fn insert(&mut self, symbol: Symbol) {
        let idx = self.symbols.len();
        self.by_qualified
            .entry(symbol.qualified_name.clone())
            .or_default()
            .push(idx);
        if is_callable(symbol.kind) {
            self.by_simple.entry(symbol.name.clone()).or_default().push(idx);
        }
        self.symbols.push(symbol);
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    fn qualified(&self, qualified_name: &str) -> impl Iterator<Item = &Symbol> {
        self.by_qualified
            .get(qualified_name)
            .into_iter()
            .flatten()
            .map(|&i| &self.symbols[i])
    }

    fn kind_in_file(&self, path: &str, qualified_name: &str) -> Option<ChunkKind> {
        self.qualified(qualified_name)
            .find(|s| s.path == path)
            .map(|s| s.kind)
    }

    /// The single callable symbol named `qualified_name`, optionally limited
    /// to one file. Ambiguity yields `Err(())`.
    fn unique(&self, qualified_name: &str, path: Option<&str>) -> Result<Option<ChunkRef>, ()> {
        let mut found = self
            .qualified(qualified_name)
            .filter(|s| is_callable(s.kind))
            .filter(|s| path.map_or(true, |p| s.path == p));
        match (found.next(), found.next()) {
            (None, _) => Ok(None),
            (Some(s), None) => Ok(Some(s.target)),
            (Some(_), Some(_)) => Err(()),
        }
    }

    fn unique_simple(&self, name: &str) -> Option<ChunkRef> {
        match self.by_simple.get(name).map(Vec::as_slice) {
            Some([only]) => Some(self.symbols[*only].target),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Enclosing scopes of `caller`, innermost first, ending with its module.
fn scope_chain<'a>(caller: &CallerScope<'a>) -> Vec<&'a str> {
    let mut chain = Vec::new();
    let mut current = caller.qualified_name;
    while current.len() > caller.module.len() && current.starts_with(caller.module) {
        chain.push(current);
        match current.rfind('.') {
            Some(dot) => current = &current[..dot],
            None => break,
        }
    }
    chain.push(caller.module);
    chain
}

pub struct CallResolver<'a> {
    table: &'a SymbolTable,
    rules: ScopeRules,
}

impl<'a> CallResolver<'a> {
    pub fn new(table: &'a SymbolTable, rules: ScopeRules) -> Self {
        Self { table, rules }
    }

    pub fn resolve(
        &self,
        caller: &CallerScope<'_>,
        bindings: &ImportBindings,
        callee: &str,
    ) -> Resolution {
        let callee = callee.trim();
        if callee.is_empty() {
            return Resolution::Unresolved;
        }
        let (head, rest) = match callee.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (callee, None),
        };

        if let Some(rest) = rest {
            if self.rules.self_receivers.contains(&head) {
                return self.resolve_receiver(caller, rest);
            }
        }

        // (a) enclosing scopes of the same file
        for scope in scope_chain(caller) {
            if !self.rules.class_members_visible
                && scope != caller.qualified_name
                && self.table.kind_in_file(caller.path, scope) == Some(ChunkKind::Class)
            {
                continue;
            }
            match self.table.unique(&join_qualified(scope, callee), Some(caller.path)) {
                Ok(Some(target)) => return Resolution::Resolved(target),
                Ok(None) => {}
                Err(()) => return Resolution::Unresolved,
            }
        }

        // (b) names bound by imports
        if let Some((binding, remainder)) = bindings.lookup(callee) {
            if !binding.is_local {
                return Resolution::External;
            }
            if let Some(qualified_name) = binding.target(remainder) {
                match self.table.unique(&qualified_name, None) {
                    Ok(Some(target)) => return Resolution::Resolved(target),
                    Ok(None) => {}
                    Err(()) => return Resolution::Unresolved,
                }
            }
        }
        if rest.is_none() {
            for module in bindings.wildcard_modules() {
                if let Ok(Some(target)) = self.table.unique(&join_qualified(module, callee), None) {
                    return Resolution::Resolved(target);
                }
            }
        }

        // (c) unambiguous simple name
        if rest.is_none() {
            if let Some(target) = self.table.unique_simple(callee) {
                return Resolution::Resolved(target);
            }
        }

        Resolution::Unresolved
    }

    /// `self.m()` / `cls.m()`: a member of the nearest enclosing class.
    fn resolve_receiver(&self, caller: &CallerScope<'_>, member: &str) -> Resolution {
        let class = scope_chain(caller)
            .into_iter()
            .find(|scope| self.table.kind_in_file(caller.path, scope) == Some(ChunkKind::Class));
        let Some(class) = class else {
            return Resolution::Unresolved;
        };
        match self.table.unique(&join_qualified(class, member), Some(caller.path)) {
            Ok(Some(target)) => Resolution::Resolved(target),
            _ => Resolution::Unresolved,
        }
    }
}
