//! Shared typed models used across indexing, storage, and queue layers.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::errors::SageError;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Kind of a chunk. Storage and resolution treat every kind uniformly;
/// only qualified-name construction differs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Module,
    Class,
    Function,
    Method,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Module => "module",
            ChunkKind::Class => "class",
            ChunkKind::Function => "function",
            ChunkKind::Method => "method",
        }
    }
}

impl FromStr for ChunkKind {
    type Err = SageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "module" => Ok(ChunkKind::Module),
            "class" => Ok(ChunkKind::Class),
            "function" => Ok(ChunkKind::Function),
            "method" => Ok(ChunkKind::Method),
            other => Err(SageError::Database(format!("unknown chunk kind: {other}"))),
        }
    }
}

/// Parse state of a file row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseStatus {
    Pending,
    Parsed,
    Failed,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStatus::Pending => "pending",
            ParseStatus::Parsed => "parsed",
            ParseStatus::Failed => "failed",
        }
    }
}

impl FromStr for ParseStatus {
    type Err = SageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ParseStatus::Pending),
            "parsed" => Ok(ParseStatus::Parsed),
            "failed" => Ok(ParseStatus::Failed),
            other => Err(SageError::Database(format!("unknown parse status: {other}"))),
        }
    }
}

macro_rules! text_column {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse::<$ty>()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_column!(ChunkKind);
text_column!(ParseStatus);

/// Steps of a repository indexing pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassPhase {
    Scanning,
    Extracting,
    Resolving,
    Queueing,
    Committed,
    Failed,
}

impl fmt::Display for PassPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PassPhase::Scanning => "scanning",
            PassPhase::Extracting => "extracting",
            PassPhase::Resolving => "resolving",
            PassPhase::Queueing => "queueing",
            PassPhase::Committed => "committed",
            PassPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// A registered source tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub url: Option<String>,
    pub last_parsed_at: Option<String>,
    pub last_commit: Option<String>,
    pub file_count: i64,
    pub chunk_count: i64,
    pub created_at: String,
}

/// One source file within a repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub repo_id: i64,
    pub relative_path: String,
    pub file_hash: String,
    pub size_bytes: i64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_at: Option<i64>,
    pub parse_status: ParseStatus,
    pub parse_error: Option<String>,
    pub last_parsed_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: i64,
    pub file_id: i64,
    pub parent_chunk_id: Option<i64>,
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
    pub embedding_id: Option<String>,
    pub enhanced_text: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: i64,
    pub caller_chunk_id: i64,
    pub callee_name: String,
    pub callee_chunk_id: Option<i64>,
    pub line: i64,
    pub column: i64,
    pub is_external: bool,
}

/// A single name bound by an import statement.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImportedName {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl ImportedName {
    pub fn new(name: &str, alias: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            alias: alias.map(str::to_string),
        }
    }

    /// The name this import binds in the importing file's namespace.
    pub fn bound_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub id: i64,
    pub file_id: i64,
    pub module_name: String,
    pub module_alias: Option<String>,
    pub imported_names: Vec<ImportedName>,
    pub is_local: bool,
    pub line: i64,
}

/// A chunk waiting for an embedding, as handed to the embedding consumer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub chunk_id: i64,
    pub priority: f64,
    pub enqueued_at: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// Enhanced text of the chunk, or its raw content when none was rendered.
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_kind_round_trips_through_text() {
        for kind in [
            ChunkKind::Module,
            ChunkKind::Class,
            ChunkKind::Function,
            ChunkKind::Method,
        ] {
            assert_eq!(kind.as_str().parse::<ChunkKind>().unwrap(), kind);
        }
        assert!("lambda".parse::<ChunkKind>().is_err());
    }

    #[test]
    fn test_imported_name_bound_name_prefers_alias() {
        assert_eq!(ImportedName::new("f", Some("g")).bound_name(), "g");
        assert_eq!(ImportedName::new("f", None).bound_name(), "f");
    }

    #[test]
    fn test_imported_name_json_omits_missing_alias() {
        let json = serde_json::to_string(&vec![ImportedName::new("f", None)]).unwrap();
        assert_eq!(json, r#"[{"name":"f"}]"#);
        let back: Vec<ImportedName> = serde_json::from_str(r#"[{"name":"f","alias":"g"}]"#).unwrap();
        assert_eq!(back[0].alias.as_deref(), Some("g"));
    }

    #[test]
    fn test_pass_phase_display() {
        assert_eq!(PassPhase::Queueing.to_string(), "queueing");
        assert_eq!(PassPhase::Committed.to_string(), "committed");
    }
}
