//! Index configuration: persisted settings plus per-pass options.
//!
//! Persisted settings live in the `config` table and are read once at the
//! start of a pass. The resulting [`IndexConfig`] is passed explicitly to
//! every component, so concurrent passes can run with different settings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{SageError, SageResult};
use crate::store::database::Store;

pub const KEY_AUTO_EMBED: &str = "auto_embed";
pub const KEY_MAX_TOKENS_PER_CHUNK: &str = "max_tokens_per_chunk";
pub const KEY_EMBEDDING_MODEL: &str = "embedding_model";

/// Environment variable that toggles exclusion of likely-secret files.
pub const EXCLUDE_SENSITIVE_ENV: &str = "SAGE_EXCLUDE_SENSITIVE";

const DEFAULT_MAX_TOKENS: usize = 512;
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Settings read from the `config` table at pass start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub auto_embed: bool,
    pub max_tokens_per_chunk: usize,
    pub embedding_model: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            auto_embed: true,
            max_tokens_per_chunk: DEFAULT_MAX_TOKENS,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }
}

impl IndexConfig {
    /// Build from raw key/value text. Unknown keys are ignored; invalid
    /// values fall back to their defaults.
    pub fn from_entries(entries: &HashMap<String, String>) -> Self {
        let mut config = IndexConfig::default();

        if let Some(raw) = entries.get(KEY_AUTO_EMBED) {
            match parse_bool(raw) {
                Some(v) => config.auto_embed = v,
                None => warn!(key = KEY_AUTO_EMBED, value = %raw, "invalid boolean, using default"),
            }
        }
        if let Some(raw) = entries.get(KEY_MAX_TOKENS_PER_CHUNK) {
            match raw.trim().parse::<usize>() {
                Ok(v) if v > 0 => config.max_tokens_per_chunk = v,
                _ => warn!(
                    key = KEY_MAX_TOKENS_PER_CHUNK,
                    value = %raw,
                    "invalid token budget, using default"
                ),
            }
        }
        if let Some(raw) = entries.get(KEY_EMBEDDING_MODEL) {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                warn!(key = KEY_EMBEDDING_MODEL, "empty model name, using default");
            } else {
                config.embedding_model = trimmed.to_string();
            }
        }
        config
    }

    /// Snapshot the persisted configuration.
    pub fn load(store: &Store) -> SageResult<Self> {
        let entries: HashMap<String, String> = store
            .list_config()?
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect();
        Ok(Self::from_entries(&entries))
    }

    /// Validate and persist one known setting.
    pub fn store_value(store: &Store, key: &str, value: &str) -> SageResult<()> {
        let valid = match key {
            KEY_AUTO_EMBED => parse_bool(value).is_some(),
            KEY_MAX_TOKENS_PER_CHUNK => value.trim().parse::<usize>().map(|v| v > 0).unwrap_or(false),
            KEY_EMBEDDING_MODEL => !value.trim().is_empty(),
            other => return Err(SageError::Config(format!("unknown setting: {other}"))),
        };
        if !valid {
            return Err(SageError::Config(format!("invalid value for {key}: {value:?}")));
        }
        store.set_config(key, value.trim())
    }
}

/// Lenient boolean parsing for text settings and environment variables.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Knobs for a single indexing invocation.
#[derive(Clone, Debug)]
pub struct PassOptions {
    pub workers: usize,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub exclude_sensitive: bool,
    /// Skip hashing files whose size and mtime match the stored row.
    pub trust_mtime: bool,
    /// Commit hash to record; read from the repository HEAD when absent.
    pub commit: Option<String>,
}

impl Default for PassOptions {
    fn default() -> Self {
        let exclude_sensitive = std::env::var(EXCLUDE_SENSITIVE_ENV)
            .ok()
            .and_then(|v| parse_bool(&v))
            .unwrap_or(true);
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            exclude_sensitive,
            trust_mtime: false,
            commit: None,
        }
    }
}
