//! Error types for the Sage core library.

use crate::models::PassPhase;

/// Top-level error enum for the Sage core library.
///
/// Per-file problems (unreadable source, parser errors) are not represented
/// here: they are recorded on the file row and in the pass report.
#[derive(Debug, thiserror::Error)]
pub enum SageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Indexing pass for '{repo}' was cancelled")]
    Cancelled { repo: String },

    #[error("Indexing pass for '{repo}' failed during {phase}: {message}")]
    Pass {
        repo: String,
        phase: PassPhase,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SageError {
    /// Wrap an error raised inside an indexing pass with the repository and
    /// the phase it happened in.
    pub fn in_pass(self, repo: &str, phase: PassPhase) -> SageError {
        match self {
            SageError::Pass { .. } | SageError::Cancelled { .. } => self,
            other => SageError::Pass {
                repo: repo.to_string(),
                phase,
                message: other.to_string(),
            },
        }
    }

    /// The phase a pass-level error surfaced in, if any.
    pub fn phase(&self) -> Option<PassPhase> {
        match self {
            SageError::Pass { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

pub type SageResult<T> = Result<T, SageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_pass_wraps_with_context() {
        let err = SageError::Database("locked".to_string()).in_pass("demo", PassPhase::Resolving);
        assert_eq!(err.phase(), Some(PassPhase::Resolving));
        let text = err.to_string();
        assert!(text.contains("demo"));
        assert!(text.contains("resolving"));
        assert!(text.contains("locked"));
    }

    #[test]
    fn test_in_pass_keeps_existing_context() {
        let err = SageError::Cancelled {
            repo: "demo".to_string(),
        }
        .in_pass("demo", PassPhase::Extracting);
        assert!(matches!(err, SageError::Cancelled { .. }));
        assert!(err.phase().is_none());
    }
}
