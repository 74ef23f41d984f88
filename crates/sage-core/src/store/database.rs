//! SQLite storage layer for Sage.
//!
//! A `Store` owns one connection behind a mutex. Writers serialise on that
//! lock, and every file-level write runs inside a single transaction so a
//! reader never observes a half-replaced file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::errors::{SageError, SageResult};
use crate::indexer::chunks::ChunkCandidate;
use crate::models::{
    CallRecord, ChunkKind, ChunkRecord, ConfigEntry, FileRecord, ImportRecord, ImportedName,
    ParseStatus, Repository,
};
use crate::store::schema;

const NOW_SQL: &str = "strftime('%Y-%m-%d %H:%M:%f', 'now')";

// ---------------------------------------------------------------------------
// Write-side records
// ---------------------------------------------------------------------------

/// File row contents written by a commit unit.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub relative_path: String,
    pub file_hash: String,
    pub size_bytes: i64,
    pub modified_at: Option<i64>,
    pub parse_status: ParseStatus,
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewImport {
    pub module_name: String,
    pub module_alias: Option<String>,
    pub imported_names: Vec<ImportedName>,
    pub is_local: bool,
    pub line: i64,
}

/// Callee of a call edge being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalleeTarget {
    Unresolved,
    /// An already persisted chunk.
    Stored(i64),
    /// A chunk of the same commit unit, by local index.
    Local(usize),
}

#[derive(Debug, Clone)]
pub struct NewCall {
    /// Local index of the calling chunk within the unit.
    pub caller: usize,
    pub callee_name: String,
    pub callee: CalleeTarget,
    pub line: i64,
    pub column: i64,
    pub is_external: bool,
}

/// Everything that replaces one file's indexed state.
#[derive(Debug, Clone)]
pub struct FileUnit {
    pub file: NewFile,
    pub chunks: Vec<ChunkCandidate>,
    pub imports: Vec<NewImport>,
    pub calls: Vec<NewCall>,
    /// `(local chunk index, priority)` pairs to enqueue for embedding.
    pub queue: Vec<(usize, f64)>,
}

/// Identities assigned by a committed unit.
#[derive(Debug, Clone, Default)]
pub struct CommittedUnit {
    pub file_id: i64,
    pub chunk_ids: Vec<i64>,
    /// Row ids of the unit's calls, parallel to `FileUnit::calls`.
    pub call_ids: Vec<i64>,
}

// ---------------------------------------------------------------------------
// Read-side projections used by resolution
// ---------------------------------------------------------------------------

/// A persisted chunk as seen by the resolver.
#[derive(Debug, Clone)]
pub struct SymbolRow {
    pub chunk_id: i64,
    pub file_id: i64,
    pub relative_path: String,
    pub kind: ChunkKind,
    pub name: String,
    pub qualified_name: String,
}

/// A persisted call edge without a callee chunk.
#[derive(Debug, Clone)]
pub struct UnresolvedCall {
    pub call_id: i64,
    pub callee_name: String,
    pub caller_chunk_id: i64,
    pub caller_qualified_name: String,
    pub file_id: i64,
    pub relative_path: String,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const REPO_COLUMNS: &str = "id, name, path, url, last_parsed_at, last_commit, file_count, \
                            chunk_count, created_at";
const FILE_COLUMNS: &str = "id, repo_id, relative_path, file_hash, size_bytes, modified_at, \
                            parse_status, parse_error, last_parsed_at";
const CHUNK_COLUMNS: &str = "id, file_id, parent_chunk_id, kind, name, qualified_name, signature, \
                             docstring, content, start_line, end_line, start_byte, end_byte, \
                             token_count, embedding_id, enhanced_text";
const CALL_COLUMNS: &str =
    "id, caller_chunk_id, callee_name, callee_chunk_id, line, col, is_external";

fn repo_from_row(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        url: row.get(3)?,
        last_parsed_at: row.get(4)?,
        last_commit: row.get(5)?,
        file_count: row.get(6)?,
        chunk_count: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        relative_path: row.get(2)?,
        file_hash: row.get(3)?,
        size_bytes: row.get(4)?,
        modified_at: row.get(5)?,
        parse_status: row.get(6)?,
        parse_error: row.get(7)?,
        last_parsed_at: row.get(8)?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        id: row.get(0)?,
        file_id: row.get(1)?,
        parent_chunk_id: row.get(2)?,
        kind: row.get(3)?,
        name: row.get(4)?,
        qualified_name: row.get(5)?,
        signature: row.get(6)?,
        docstring: row.get(7)?,
        content: row.get(8)?,
        start_line: row.get(9)?,
        end_line: row.get(10)?,
        start_byte: row.get(11)?,
        end_byte: row.get(12)?,
        token_count: row.get(13)?,
        embedding_id: row.get(14)?,
        enhanced_text: row.get(15)?,
    })
}

fn call_from_row(row: &Row<'_>) -> rusqlite::Result<CallRecord> {
    Ok(CallRecord {
        id: row.get(0)?,
        caller_chunk_id: row.get(1)?,
        callee_name: row.get(2)?,
        callee_chunk_id: row.get(3)?,
        line: row.get(4)?,
        column: row.get(5)?,
        is_external: row.get(6)?,
    })
}

fn import_from_row(row: &Row<'_>) -> rusqlite::Result<ImportRecord> {
    let raw: String = row.get(4)?;
    let imported_names: Vec<ImportedName> = serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ImportRecord {
        id: row.get(0)?,
        file_id: row.get(1)?,
        module_name: row.get(2)?,
        module_alias: row.get(3)?,
        imported_names,
        is_local: row.get(5)?,
        line: row.get(6)?,
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// SQLite-backed chunk/call/import graph.
pub struct Store {
    db_path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply pending
    /// migrations.
    pub fn open(path: impl AsRef<Path>) -> SageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn, Some(path))
    }

    pub fn open_in_memory() -> SageResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, db_path: Option<PathBuf>) -> SageResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let applied = schema::run_migrations(&conn)?;
        if applied > 0 {
            let version = schema::current_version(&conn)?;
            debug!(applied, version, "database schema migrated");
        }
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Lock the shared connection for raw SQL access.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    // -- configuration -------------------------------------------------------

    pub fn get_config(&self, key: &str) -> SageResult<Option<ConfigEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT key, value, updated_at FROM config WHERE key = ?1;",
                params![key],
                |row| {
                    Ok(ConfigEntry {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn set_config(&self, key: &str, value: &str) -> SageResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO config(key, value, updated_at) VALUES (?1, ?2, {NOW_SQL}) \
                 ON CONFLICT(key) DO UPDATE SET \
                     value = excluded.value, updated_at = excluded.updated_at;"
            ),
            params![key, value],
        )?;
        Ok(())
    }

    pub fn list_config(&self) -> SageResult<Vec<ConfigEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value, updated_at FROM config ORDER BY key;")?;
        let entries = stmt
            .query_map([], |row| {
                Ok(ConfigEntry {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- repositories --------------------------------------------------------

    /// Register a repository, or return the existing one with the same name
    /// (its path and url are refreshed).
    pub fn register_repo(&self, name: &str, path: &str, url: Option<&str>) -> SageResult<Repository> {
        if name.trim().is_empty() {
            return Err(SageError::Index("repository name must not be empty".to_string()));
        }
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO repos(name, path, url) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(name) DO UPDATE SET \
                     path = excluded.path, url = COALESCE(excluded.url, repos.url);",
                params![name, path, url],
            )?;
        }
        self.get_repo_by_name(name)?
            .ok_or_else(|| SageError::Database(format!("repository '{name}' vanished after insert")))
    }

    pub fn get_repo(&self, repo_id: i64) -> SageResult<Option<Repository>> {
        let conn = self.conn.lock();
        let repo = conn
            .query_row(
                &format!("SELECT {REPO_COLUMNS} FROM repos WHERE id = ?1;"),
                params![repo_id],
                repo_from_row,
            )
            .optional()?;
        Ok(repo)
    }

    pub fn get_repo_by_name(&self, name: &str) -> SageResult<Option<Repository>> {
        let conn = self.conn.lock();
        let repo = conn
            .query_row(
                &format!("SELECT {REPO_COLUMNS} FROM repos WHERE name = ?1;"),
                params![name],
                repo_from_row,
            )
            .optional()?;
        Ok(repo)
    }

    pub fn list_repos(&self) -> SageResult<Vec<Repository>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {REPO_COLUMNS} FROM repos ORDER BY name;"))?;
        let repos = stmt
            .query_map([], repo_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(repos)
    }

    /// Delete a repository and everything it owns.
    pub fn delete_repo(&self, repo_id: i64) -> SageResult<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM repos WHERE id = ?1;", params![repo_id])?;
        Ok(deleted > 0)
    }

    /// Recount files and chunks and stamp the pass completion marker.
    pub fn update_repo_aggregates(
        &self,
        repo_id: i64,
        last_commit: Option<&str>,
    ) -> SageResult<Repository> {
        {
            let conn = self.conn.lock();
            conn.execute(
                &format!(
                    "UPDATE repos SET \
                         file_count = (SELECT COUNT(*) FROM files WHERE repo_id = ?1), \
                         chunk_count = (SELECT COUNT(*) FROM chunks c \
                                        JOIN files f ON f.id = c.file_id \
                                        WHERE f.repo_id = ?1), \
                         last_parsed_at = {NOW_SQL}, \
                         last_commit = COALESCE(?2, last_commit) \
                     WHERE id = ?1;"
                ),
                params![repo_id, last_commit],
            )?;
        }
        self.get_repo(repo_id)?
            .ok_or_else(|| SageError::Database(format!("repository {repo_id} not found")))
    }

    // -- files ---------------------------------------------------------------

    pub fn list_files(&self, repo_id: i64) -> SageResult<Vec<FileRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE repo_id = ?1 ORDER BY relative_path;"
        ))?;
        let files = stmt
            .query_map(params![repo_id], file_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    pub fn get_file(&self, repo_id: i64, relative_path: &str) -> SageResult<Option<FileRecord>> {
        let conn = self.conn.lock();
        let file = conn
            .query_row(
                &format!(
                    "SELECT {FILE_COLUMNS} FROM files WHERE repo_id = ?1 AND relative_path = ?2;"
                ),
                params![repo_id, relative_path],
                file_from_row,
            )
            .optional()?;
        Ok(file)
    }

    /// Remove a file row in its own transaction; chunks, calls, imports and
    /// queue entries cascade, and incoming edges from other files lose their
    /// callee id.
    pub fn remove_file(&self, repo_id: i64, relative_path: &str) -> SageResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM files WHERE repo_id = ?1 AND relative_path = ?2;",
            params![repo_id, relative_path],
        )?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Replace one file's indexed state as a single transaction.
    pub fn commit_file_unit(&self, repo_id: i64, unit: &FileUnit) -> SageResult<CommittedUnit> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let f = &unit.file;
        tx.execute(
            &format!(
                "INSERT INTO files (repo_id, relative_path, file_hash, size_bytes, modified_at, \
                                    parse_status, parse_error, last_parsed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, {NOW_SQL}) \
                 ON CONFLICT(repo_id, relative_path) DO UPDATE SET \
                     file_hash = excluded.file_hash, \
                     size_bytes = excluded.size_bytes, \
                     modified_at = excluded.modified_at, \
                     parse_status = excluded.parse_status, \
                     parse_error = excluded.parse_error, \
                     last_parsed_at = excluded.last_parsed_at;"
            ),
            params![
                repo_id,
                f.relative_path,
                f.file_hash,
                f.size_bytes,
                f.modified_at,
                f.parse_status,
                f.parse_error,
            ],
        )?;
        let file_id: i64 = tx.query_row(
            "SELECT id FROM files WHERE repo_id = ?1 AND relative_path = ?2;",
            params![repo_id, f.relative_path],
            |row| row.get(0),
        )?;

        // Invalidate everything the previous parse produced.
        tx.execute("DELETE FROM chunks WHERE file_id = ?1;", params![file_id])?;
        tx.execute("DELETE FROM imports WHERE file_id = ?1;", params![file_id])?;

        let mut chunk_ids: Vec<i64> = Vec::with_capacity(unit.chunks.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks ( \
                     file_id, parent_chunk_id, kind, name, qualified_name, signature, docstring, \
                     content, start_line, end_line, start_byte, end_byte, token_count, \
                     enhanced_text \
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14);",
            )?;
            for (index, chunk) in unit.chunks.iter().enumerate() {
                let parent_id = match chunk.parent {
                    Some(p) if p < index => Some(chunk_ids[p]),
                    Some(p) => {
                        return Err(SageError::Database(format!(
                            "chunk {index} of {} references parent {p} not yet written",
                            f.relative_path
                        )))
                    }
                    None => None,
                };
                stmt.execute(params![
                    file_id,
                    parent_id,
                    chunk.kind,
                    chunk.name,
                    chunk.qualified_name,
                    chunk.signature,
                    chunk.docstring,
                    chunk.content,
                    chunk.start_line,
                    chunk.end_line,
                    chunk.start_byte,
                    chunk.end_byte,
                    chunk.token_count,
                    chunk.enhanced_text,
                ])?;
                chunk_ids.push(tx.last_insert_rowid());
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO imports (file_id, module_name, module_alias, imported_names, \
                                      is_local, line) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            )?;
            for import in &unit.imports {
                let names = serde_json::to_string(&import.imported_names)?;
                stmt.execute(params![
                    file_id,
                    import.module_name,
                    import.module_alias,
                    names,
                    import.is_local,
                    import.line,
                ])?;
            }
        }

        let mut call_ids: Vec<i64> = Vec::with_capacity(unit.calls.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO function_calls (caller_chunk_id, callee_name, callee_chunk_id, \
                                             line, col, is_external) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            )?;
            for call in &unit.calls {
                let caller_id = *chunk_ids.get(call.caller).ok_or_else(|| {
                    SageError::Database(format!(
                        "call to '{}' references missing caller chunk {}",
                        call.callee_name, call.caller
                    ))
                })?;
                let callee_id = match call.callee {
                    CalleeTarget::Unresolved => None,
                    CalleeTarget::Stored(id) => Some(id),
                    CalleeTarget::Local(index) => chunk_ids.get(index).copied(),
                };
                let callee_id = if call.is_external { None } else { callee_id };
                stmt.execute(params![
                    caller_id,
                    call.callee_name,
                    callee_id,
                    call.line,
                    call.column,
                    call.is_external,
                ])?;
                call_ids.push(tx.last_insert_rowid());
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO embedding_queue (chunk_id, priority) VALUES (?1, ?2);",
            )?;
            for (index, priority) in &unit.queue {
                if let Some(chunk_id) = chunk_ids.get(*index) {
                    stmt.execute(params![chunk_id, priority])?;
                }
            }
        }

        tx.commit()?;
        debug!(
            path = %f.relative_path,
            chunks = chunk_ids.len(),
            calls = call_ids.len(),
            "committed file unit"
        );
        Ok(CommittedUnit {
            file_id,
            chunk_ids,
            call_ids,
        })
    }

    // -- chunks, calls, imports ----------------------------------------------

    pub fn get_chunk(&self, chunk_id: i64) -> SageResult<Option<ChunkRecord>> {
        let conn = self.conn.lock();
        let chunk = conn
            .query_row(
                &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1;"),
                params![chunk_id],
                chunk_from_row,
            )
            .optional()?;
        Ok(chunk)
    }

    pub fn chunks_for_file(&self, file_id: i64) -> SageResult<Vec<ChunkRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE file_id = ?1 ORDER BY id;"
        ))?;
        let chunks = stmt
            .query_map(params![file_id], chunk_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    pub fn calls_from_chunk(&self, chunk_id: i64) -> SageResult<Vec<CallRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CALL_COLUMNS} FROM function_calls WHERE caller_chunk_id = ?1 ORDER BY id;"
        ))?;
        let calls = stmt
            .query_map(params![chunk_id], call_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(calls)
    }

    pub fn calls_for_repo(&self, repo_id: i64) -> SageResult<Vec<CallRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT fc.id, fc.caller_chunk_id, fc.callee_name, fc.callee_chunk_id, \
                    fc.line, fc.col, fc.is_external \
             FROM function_calls fc \
             JOIN chunks c ON c.id = fc.caller_chunk_id \
             JOIN files f ON f.id = c.file_id \
             WHERE f.repo_id = ?1 \
             ORDER BY fc.id;",
        )?;
        let calls = stmt
            .query_map(params![repo_id], call_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(calls)
    }

    pub fn imports_for_file(&self, file_id: i64) -> SageResult<Vec<ImportRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, file_id, module_name, module_alias, imported_names, is_local, line \
             FROM imports WHERE file_id = ?1 ORDER BY id;",
        )?;
        let imports = stmt
            .query_map(params![file_id], import_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(imports)
    }

    /// Every persisted chunk of a repository except those in `skip_files`.
    pub fn symbol_rows(&self, repo_id: i64, skip_files: &HashSet<i64>) -> SageResult<Vec<SymbolRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.file_id, f.relative_path, c.kind, c.name, c.qualified_name \
             FROM chunks c JOIN files f ON f.id = c.file_id \
             WHERE f.repo_id = ?1 \
             ORDER BY c.id;",
        )?;
        let rows = stmt
            .query_map(params![repo_id], |row| {
                Ok(SymbolRow {
                    chunk_id: row.get(0)?,
                    file_id: row.get(1)?,
                    relative_path: row.get(2)?,
                    kind: row.get(3)?,
                    name: row.get(4)?,
                    qualified_name: row.get(5)?,
                })
            })?
            .filter(|r| match r {
                Ok(sym) => !skip_files.contains(&sym.file_id),
                Err(_) => true,
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Call edges of a repository with a null callee that are not external.
    pub fn unresolved_internal_calls(&self, repo_id: i64) -> SageResult<Vec<UnresolvedCall>> {
        self.calls_without_callee(repo_id, false)
    }

    /// External call edges of a repository.
    pub fn external_calls(&self, repo_id: i64) -> SageResult<Vec<UnresolvedCall>> {
        self.calls_without_callee(repo_id, true)
    }

    fn calls_without_callee(&self, repo_id: i64, external: bool) -> SageResult<Vec<UnresolvedCall>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT fc.id, fc.callee_name, c.id, c.qualified_name, f.id, f.relative_path \
             FROM function_calls fc \
             JOIN chunks c ON c.id = fc.caller_chunk_id \
             JOIN files f ON f.id = c.file_id \
             WHERE f.repo_id = ?1 AND fc.callee_chunk_id IS NULL AND fc.is_external = ?2 \
             ORDER BY fc.id;",
        )?;
        let rows = stmt
            .query_map(params![repo_id, external], |row| {
                Ok(UnresolvedCall {
                    call_id: row.get(0)?,
                    callee_name: row.get(1)?,
                    caller_chunk_id: row.get(2)?,
                    caller_qualified_name: row.get(3)?,
                    file_id: row.get(4)?,
                    relative_path: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Files written since the repository's last completed pass, including
    /// those committed by a pass that was interrupted.
    pub fn files_since_last_pass(&self, repo_id: i64) -> SageResult<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT f.id FROM files f JOIN repos r ON r.id = f.repo_id \
             WHERE f.repo_id = ?1 \
               AND (r.last_parsed_at IS NULL OR f.last_parsed_at >= r.last_parsed_at) \
             ORDER BY f.id;",
        )?;
        let ids = stmt
            .query_map(params![repo_id], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Distinct names of the non-module chunks of `file_ids`.
    pub fn chunk_names(&self, file_ids: &[i64]) -> SageResult<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT name FROM chunks WHERE file_id = ?1 AND kind != 'module';",
        )?;
        let mut names = HashSet::new();
        for file_id in file_ids {
            for name in stmt.query_map(params![file_id], |row| row.get::<_, String>(0))? {
                names.insert(name?);
            }
        }
        Ok(names)
    }

    /// Imports of a repository classified as external, with their file's
    /// relative path.
    pub fn external_imports(&self, repo_id: i64) -> SageResult<Vec<(String, ImportRecord)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT i.id, i.file_id, i.module_name, i.module_alias, i.imported_names, \
                    i.is_local, i.line, f.relative_path \
             FROM imports i JOIN files f ON f.id = i.file_id \
             WHERE f.repo_id = ?1 AND i.is_local = 0 \
             ORDER BY i.id;",
        )?;
        let imports = stmt
            .query_map(params![repo_id], |row| Ok((row.get(7)?, import_from_row(row)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(imports)
    }

    /// Reclassify imports as local in one transaction.
    pub fn mark_imports_local(&self, import_ids: &[i64]) -> SageResult<usize> {
        if import_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut updated = 0usize;
        {
            let mut stmt = tx.prepare("UPDATE imports SET is_local = 1 WHERE id = ?1;")?;
            for id in import_ids {
                updated += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Turn external call edges into internal ones, linking each to its
    /// callee when that chunk exists. Returns the number of edges updated.
    pub fn internalize_calls(&self, calls: &[(i64, Option<i64>)]) -> SageResult<usize> {
        if calls.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut updated = 0usize;
        {
            let mut stmt = tx.prepare(
                "UPDATE function_calls \
                 SET is_external = 0, callee_chunk_id = (SELECT id FROM chunks WHERE id = ?2) \
                 WHERE id = ?1 AND is_external = 1;",
            )?;
            for (call_id, chunk_id) in calls {
                updated += stmt.execute(params![call_id, chunk_id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Point call edges at resolved callees in one transaction. External
    /// edges are never linked. Returns the number of edges updated.
    pub fn link_calls(&self, links: &[(i64, i64)]) -> SageResult<usize> {
        if links.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut updated = 0usize;
        {
            let mut stmt = tx.prepare(
                "UPDATE function_calls SET callee_chunk_id = ?2 \
                 WHERE id = ?1 AND is_external = 0 \
                   AND EXISTS (SELECT 1 FROM chunks WHERE id = ?2);",
            )?;
            for (call_id, chunk_id) in links {
                updated += stmt.execute(params![call_id, chunk_id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(
        kind: ChunkKind,
        name: &str,
        qualified_name: &str,
        parent: Option<usize>,
        lines: (i64, i64),
    ) -> ChunkCandidate {
        ChunkCandidate {
            kind,
            name: name.to_string(),
            qualified_name: qualified_name.to_string(),
            signature: None,
            docstring: None,
            content: format!("body of {name}"),
            start_line: lines.0,
            end_line: lines.1,
            start_byte: 0,
            end_byte: 10,
            token_count: 3,
            parent,
            enhanced_text: Some(qualified_name.to_string()),
        }
    }

    fn unit(path: &str, module: &str, function: &str) -> FileUnit {
        FileUnit {
            file: NewFile {
                relative_path: path.to_string(),
                file_hash: format!("hash-{path}"),
                size_bytes: 10,
                modified_at: Some(1),
                parse_status: ParseStatus::Parsed,
                parse_error: None,
            },
            chunks: vec![
                chunk(ChunkKind::Module, module, module, None, (1, 10)),
                chunk(
                    ChunkKind::Function,
                    function,
                    &format!("{module}.{function}"),
                    Some(0),
                    (2, 4),
                ),
            ],
            imports: vec![],
            calls: vec![],
            queue: vec![(0, 0.0), (1, 0.0)],
        }
    }

    fn setup() -> (Store, Repository) {
        let store = Store::open_in_memory().unwrap();
        let repo = store.register_repo("demo", "/tmp/demo", None).unwrap();
        (store, repo)
    }

    #[test]
    fn test_register_repo_is_idempotent() {
        let (store, repo) = setup();
        let again = store
            .register_repo("demo", "/tmp/demo2", Some("git@example.com:demo.git"))
            .unwrap();
        assert_eq!(repo.id, again.id);
        assert_eq!(again.path, "/tmp/demo2");
        assert_eq!(again.url.as_deref(), Some("git@example.com:demo.git"));
        assert_eq!(store.list_repos().unwrap().len(), 1);
    }

    #[test]
    fn test_register_repo_rejects_empty_name() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.register_repo("  ", "/tmp", None).is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.set_config("auto_embed", "false").unwrap();
        let entry = store.get_config("auto_embed").unwrap().unwrap();
        assert_eq!(entry.value, "false");
        assert!(store.get_config("missing").unwrap().is_none());
        assert!(store.list_config().unwrap().len() >= 3);
    }

    #[test]
    fn test_commit_file_unit_writes_parent_before_child() {
        let (store, repo) = setup();
        let committed = store.commit_file_unit(repo.id, &unit("a.py", "a", "f")).unwrap();
        assert_eq!(committed.chunk_ids.len(), 2);

        let chunks = store.chunks_for_file(committed.file_id).unwrap();
        assert_eq!(chunks[1].parent_chunk_id, Some(chunks[0].id));
        assert_eq!(chunks[1].kind, ChunkKind::Function);

        let queued: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM embedding_queue;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(queued, 2);
    }

    #[test]
    fn test_commit_file_unit_replaces_previous_state() {
        let (store, repo) = setup();
        let first = store.commit_file_unit(repo.id, &unit("a.py", "a", "f")).unwrap();
        let second = store.commit_file_unit(repo.id, &unit("a.py", "a", "g")).unwrap();
        assert_eq!(first.file_id, second.file_id);

        let chunks = store.chunks_for_file(second.file_id).unwrap();
        let names: Vec<&str> = chunks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "g"]);
        assert!(store.get_chunk(first.chunk_ids[1]).unwrap().is_none());
    }

    #[test]
    fn test_commit_rejects_forward_parent_reference() {
        let (store, repo) = setup();
        let mut bad = unit("a.py", "a", "f");
        bad.chunks[0].parent = Some(1);
        assert!(store.commit_file_unit(repo.id, &bad).is_err());
        assert!(store.get_file(repo.id, "a.py").unwrap().is_none());
    }

    #[test]
    fn test_remove_file_nulls_incoming_edges() {
        let (store, repo) = setup();
        let target = store.commit_file_unit(repo.id, &unit("a.py", "a", "f")).unwrap();
        let mut caller = unit("b.py", "b", "g");
        caller.calls.push(NewCall {
            caller: 1,
            callee_name: "f".to_string(),
            callee: CalleeTarget::Stored(target.chunk_ids[1]),
            line: 3,
            column: 4,
            is_external: false,
        });
        let committed = store.commit_file_unit(repo.id, &caller).unwrap();

        assert!(store.remove_file(repo.id, "a.py").unwrap());
        let calls = store.calls_from_chunk(committed.chunk_ids[1]).unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].callee_chunk_id.is_none());
        assert!(!calls[0].is_external);

        let unresolved = store.unresolved_internal_calls(repo.id).unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].caller_qualified_name, "b.g");
    }

    #[test]
    fn test_external_calls_never_carry_callee() {
        let (store, repo) = setup();
        let mut u = unit("a.py", "a", "f");
        u.calls.push(NewCall {
            caller: 1,
            callee_name: "os.path.join".to_string(),
            callee: CalleeTarget::Local(0),
            line: 3,
            column: 0,
            is_external: true,
        });
        let committed = store.commit_file_unit(repo.id, &u).unwrap();
        assert_eq!(store.link_calls(&[(committed.call_ids[0], committed.chunk_ids[0])]).unwrap(), 0);
        let calls = store.calls_from_chunk(committed.chunk_ids[1]).unwrap();
        assert!(calls[0].is_external);
        assert!(calls[0].callee_chunk_id.is_none());
    }

    #[test]
    fn test_imports_round_trip_names() {
        let (store, repo) = setup();
        let mut u = unit("a.py", "a", "f");
        u.imports.push(NewImport {
            module_name: "b".to_string(),
            module_alias: None,
            imported_names: vec![ImportedName::new("g", Some("h"))],
            is_local: true,
            line: 1,
        });
        let committed = store.commit_file_unit(repo.id, &u).unwrap();
        let imports = store.imports_for_file(committed.file_id).unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].imported_names[0].bound_name(), "h");
        assert!(imports[0].is_local);
    }

    #[test]
    fn test_delete_repo_cascades() {
        let (store, repo) = setup();
        store.commit_file_unit(repo.id, &unit("a.py", "a", "f")).unwrap();
        assert!(store.delete_repo(repo.id).unwrap());
        let chunks: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM chunks;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(chunks, 0);
    }

    #[test]
    fn test_update_repo_aggregates_counts() {
        let (store, repo) = setup();
        store.commit_file_unit(repo.id, &unit("a.py", "a", "f")).unwrap();
        store.commit_file_unit(repo.id, &unit("b.py", "b", "g")).unwrap();
        let updated = store.update_repo_aggregates(repo.id, Some("abc123")).unwrap();
        assert_eq!(updated.file_count, 2);
        assert_eq!(updated.chunk_count, 4);
        assert_eq!(updated.last_commit.as_deref(), Some("abc123"));
        assert!(updated.last_parsed_at.is_some());

        let kept = store.update_repo_aggregates(repo.id, None).unwrap();
        assert_eq!(kept.last_commit.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_symbol_rows_skip_files() {
        let (store, repo) = setup();
        let a = store.commit_file_unit(repo.id, &unit("a.py", "a", "f")).unwrap();
        store.commit_file_unit(repo.id, &unit("b.py", "b", "g")).unwrap();
        let skip: HashSet<i64> = [a.file_id].into_iter().collect();
        let rows = store.symbol_rows(repo.id, &skip).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.relative_path == "b.py"));
    }

    #[test]
    fn test_files_since_last_pass_and_names() {
        let (store, repo) = setup();
        let a = store.commit_file_unit(repo.id, &unit("a.py", "a", "f")).unwrap();
        assert_eq!(store.files_since_last_pass(repo.id).unwrap(), vec![a.file_id]);

        store.update_repo_aggregates(repo.id, None).unwrap();
        let b = store.commit_file_unit(repo.id, &unit("b.py", "b", "g")).unwrap();
        let since = store.files_since_last_pass(repo.id).unwrap();
        assert!(since.contains(&b.file_id));

        let names = store.chunk_names(&[a.file_id, b.file_id]).unwrap();
        let expected: HashSet<String> = ["f", "g"].iter().map(|s| s.to_string()).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_reclassify_external_import_and_call() {
        let (store, repo) = setup();
        let target = store.commit_file_unit(repo.id, &unit("a.py", "a", "f")).unwrap();
        let mut caller = unit("b.py", "b", "g");
        caller.imports.push(NewImport {
            module_name: "a".to_string(),
            module_alias: None,
            imported_names: vec![ImportedName::new("f", None)],
            is_local: false,
            line: 1,
        });
        caller.calls.push(NewCall {
            caller: 1,
            callee_name: "f".to_string(),
            callee: CalleeTarget::Unresolved,
            line: 3,
            column: 4,
            is_external: true,
        });
        let committed = store.commit_file_unit(repo.id, &caller).unwrap();

        let external = store.external_imports(repo.id).unwrap();
        assert_eq!(external.len(), 1);
        assert_eq!(external[0].0, "b.py");
        assert_eq!(store.mark_imports_local(&[external[0].1.id]).unwrap(), 1);
        assert!(store.external_imports(repo.id).unwrap().is_empty());

        let calls = store.external_calls(repo.id).unwrap();
        assert_eq!(calls.len(), 1);
        let updated = store
            .internalize_calls(&[(calls[0].call_id, Some(target.chunk_ids[1]))])
            .unwrap();
        assert_eq!(updated, 1);
        let call = &store.calls_from_chunk(committed.chunk_ids[1]).unwrap()[0];
        assert!(!call.is_external);
        assert_eq!(call.callee_chunk_id, Some(target.chunk_ids[1]));
        assert!(store.external_calls(repo.id).unwrap().is_empty());
    }

    #[test]
    fn test_open_on_disk_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sage.db");
        let store = Store::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.db_path(), Some(path.as_path()));
    }
}
