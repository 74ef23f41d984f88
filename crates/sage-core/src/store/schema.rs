//! SQLite schema DDL and migration framework.
//!
//! Migrations are compiled in and applied in version order. Each step runs
//! inside a SAVEPOINT so a failure rolls back only that step, and every
//! applied step is recorded in `_migrations`.

use std::sync::LazyLock;

use regex::Regex;
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::errors::{SageError, SageResult};

/// A single compiled-in schema migration.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

impl Migration {
    /// Description stored alongside the version, derived from the name.
    pub fn description(&self) -> String {
        let trimmed = MIGRATION_NAME_RE.replace(self.name, "");
        trimmed.replace('_', " ")
    }
}

/// Applied/pending state of one known migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStatus {
    pub version: i64,
    pub name: &'static str,
    pub applied_at: Option<String>,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

static MIGRATION_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)_").expect("static migration name pattern"));

const MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);";

const INITIAL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS repos (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        path TEXT NOT NULL,
        url TEXT,
        last_parsed_at TEXT,
        last_commit TEXT,
        file_count INTEGER NOT NULL DEFAULT 0,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
        relative_path TEXT NOT NULL,
        file_hash TEXT NOT NULL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        modified_at INTEGER,
        parse_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (parse_status IN ('pending', 'parsed', 'failed')),
        parse_error TEXT,
        last_parsed_at TEXT,
        UNIQUE(repo_id, relative_path)
    );",
    "CREATE TABLE IF NOT EXISTS chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        parent_chunk_id INTEGER REFERENCES chunks(id) ON DELETE CASCADE,
        kind TEXT NOT NULL CHECK (kind IN ('module', 'class', 'function', 'method')),
        name TEXT NOT NULL,
        qualified_name TEXT NOT NULL,
        signature TEXT,
        docstring TEXT,
        content TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        start_byte INTEGER NOT NULL,
        end_byte INTEGER NOT NULL,
        token_count INTEGER NOT NULL DEFAULT 0,
        embedding_id TEXT,
        enhanced_text TEXT
    );",
    "CREATE TABLE IF NOT EXISTS function_calls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        caller_chunk_id INTEGER NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
        callee_name TEXT NOT NULL,
        callee_chunk_id INTEGER REFERENCES chunks(id) ON DELETE SET NULL,
        line INTEGER NOT NULL,
        col INTEGER NOT NULL DEFAULT 0,
        is_external INTEGER NOT NULL DEFAULT 0,
        CHECK (NOT (is_external = 1 AND callee_chunk_id IS NOT NULL))
    );",
    "CREATE TABLE IF NOT EXISTS imports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        module_name TEXT NOT NULL,
        module_alias TEXT,
        imported_names TEXT NOT NULL DEFAULT '[]',
        is_local INTEGER NOT NULL DEFAULT 0,
        line INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS embedding_queue (
        chunk_id INTEGER PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
        priority REAL NOT NULL DEFAULT 0.0,
        enqueued_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    );",
];

const LOOKUP_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_files_repo ON files(repo_id);",
    "CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id);",
    "CREATE INDEX IF NOT EXISTS idx_chunks_parent ON chunks(parent_chunk_id);",
    "CREATE INDEX IF NOT EXISTS idx_chunks_qualified ON chunks(qualified_name);",
    "CREATE INDEX IF NOT EXISTS idx_chunks_name ON chunks(name);",
    "CREATE INDEX IF NOT EXISTS idx_calls_caller ON function_calls(caller_chunk_id);",
    "CREATE INDEX IF NOT EXISTS idx_calls_callee ON function_calls(callee_chunk_id);",
    "CREATE INDEX IF NOT EXISTS idx_imports_file ON imports(file_id);",
    "CREATE INDEX IF NOT EXISTS idx_queue_drain ON embedding_queue(priority DESC, enqueued_at ASC);",
];

const DEFAULT_CONFIG: &[&str] = &[
    "INSERT OR IGNORE INTO config(key, value) VALUES ('auto_embed', 'true');",
    "INSERT OR IGNORE INTO config(key, value) VALUES ('max_tokens_per_chunk', '512');",
    "INSERT OR IGNORE INTO config(key, value) VALUES ('embedding_model', 'text-embedding-3-small');",
];

/// Every migration known to this build, in version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "001_initial_schema",
        statements: INITIAL_SCHEMA,
    },
    Migration {
        version: 2,
        name: "002_lookup_indexes",
        statements: LOOKUP_INDEXES,
    },
    Migration {
        version: 3,
        name: "003_default_config",
        statements: DEFAULT_CONFIG,
    },
];

/// Extract the numeric version prefix from a migration name such as
/// `001_initial_schema.sql`.
pub fn parse_migration_version(name: &str) -> Option<i64> {
    MIGRATION_NAME_RE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

/// Apply every pending migration. Returns how many steps were applied.
pub fn run_migrations(conn: &Connection) -> SageResult<usize> {
    conn.execute_batch(MIGRATIONS_TABLE)?;
    let applied = applied_versions(conn)?;
    let mut count = 0usize;

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        if parse_migration_version(migration.name) != Some(migration.version) {
            return Err(SageError::Database(format!(
                "migration {} does not carry version {}",
                migration.name, migration.version
            )));
        }
        conn.execute_batch("SAVEPOINT sage_migrate_step;")?;

        let step_result = (|| -> SageResult<()> {
            for stmt in migration.statements {
                if let Err(e) = conn.execute_batch(stmt) {
                    if e.to_string().contains("already exists") {
                        warn!(migration = migration.name, "object already exists, continuing");
                        continue;
                    }
                    return Err(e.into());
                }
            }
            conn.execute(
                "INSERT INTO _migrations(version, description) VALUES (?1, ?2);",
                params![format!("{:03}", migration.version), migration.description()],
            )?;
            conn.execute_batch("RELEASE SAVEPOINT sage_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                debug!(migration = migration.name, "applied migration");
                count += 1;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT sage_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT sage_migrate_step;");
                return Err(SageError::Database(format!(
                    "migration {} failed: {e}",
                    migration.name
                )));
            }
        }
    }

    Ok(count)
}

/// Highest applied migration version, or 0 on a fresh database.
pub fn current_version(conn: &Connection) -> SageResult<i64> {
    conn.execute_batch(MIGRATIONS_TABLE)?;
    Ok(applied_versions(conn)?.into_iter().max().unwrap_or(0))
}

/// Known migrations with their applied timestamps.
pub fn migration_status(conn: &Connection) -> SageResult<Vec<MigrationStatus>> {
    conn.execute_batch(MIGRATIONS_TABLE)?;
    let mut stmt = conn.prepare("SELECT version, applied_at FROM _migrations;")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(MIGRATIONS
        .iter()
        .map(|m| MigrationStatus {
            version: m.version,
            name: m.name,
            applied_at: rows
                .iter()
                .find(|(v, _)| v.parse::<i64>().ok() == Some(m.version))
                .map(|(_, at)| at.clone()),
        })
        .collect())
}

fn applied_versions(conn: &Connection) -> SageResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT version FROM _migrations;")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .filter_map(|v| v.parse::<i64>().ok())
        .collect();
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn test_parse_migration_version() {
        assert_eq!(parse_migration_version("001_initial.sql"), Some(1));
        assert_eq!(parse_migration_version("042_add_things"), Some(42));
        assert_eq!(parse_migration_version("initial.sql"), None);
    }

    #[test]
    fn test_migration_description_strips_prefix() {
        assert_eq!(MIGRATIONS[0].description(), "initial schema");
    }

    #[test]
    fn migrate_fresh_database() {
        let conn = fresh();
        let applied = run_migrations(&conn).unwrap();
        assert_eq!(applied, MIGRATIONS.len());
        assert_eq!(current_version(&conn).unwrap(), 3);

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name;")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        for expected in [
            "config",
            "repos",
            "files",
            "chunks",
            "function_calls",
            "imports",
            "embedding_queue",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn migrate_idempotent() {
        let conn = fresh();
        run_migrations(&conn).unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 0);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM _migrations;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn migrate_tolerates_preexisting_objects() {
        let conn = fresh();
        conn.execute_batch(INITIAL_SCHEMA[1]).unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), MIGRATIONS.len());
    }

    #[test]
    fn test_migration_status_reports_applied() {
        let conn = fresh();
        let before = migration_status(&conn).unwrap();
        assert!(before.iter().all(|s| !s.is_applied()));
        run_migrations(&conn).unwrap();
        let after = migration_status(&conn).unwrap();
        assert!(after.iter().all(|s| s.is_applied()));
    }

    #[test]
    fn test_default_config_seeded() {
        let conn = fresh();
        run_migrations(&conn).unwrap();
        let value: String = conn
            .query_row(
                "SELECT value FROM config WHERE key = 'max_tokens_per_chunk';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, "512");
    }
}
