//! Filesystem scanning helpers for indexing passes.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::PassOptions;
use crate::errors::{SageError, SageResult};
use crate::indexer::parser::ParserRegistry;

const DEFAULT_SENSITIVE_EXCLUDE_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "*.p12",
    "*secret*",
    "*secrets*",
    "*credential*",
    "id_rsa",
    "id_dsa",
];

const IMPLICIT_IGNORED_DIRS: &[&str] = &[".git", ".sage", "__pycache__"];

/// Per-repository ignore file, read alongside `.gitignore`.
pub const IGNORE_FILE_NAME: &str = ".sageignore";

/// A file found by the scan that some parser can handle.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size_bytes: i64,
    /// Milliseconds since the Unix epoch.
    pub modified_at: Option<i64>,
}

/// A per-file problem that excluded the file from the pass.
///
/// For walk errors `relative_path` may name a directory; an empty path means
/// the failing location is unknown.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileIssue {
    pub relative_path: String,
    pub message: String,
}

impl FileIssue {
    /// Whether `path` lies at or below the location of this issue.
    pub fn covers(&self, path: &str) -> bool {
        let prefix = self.relative_path.trim_end_matches('/');
        prefix.is_empty()
            || path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepoScan {
    pub files: Vec<ScannedFile>,
    pub errors: Vec<FileIssue>,
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Location carried by a walker error, looking through depth and line
/// wrappers.
fn error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.as_path()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        ignore::Error::Loop { child, .. } => Some(child.as_path()),
        ignore::Error::Partial(errs) => errs.iter().find_map(error_path),
        _ => None,
    }
}

fn walk_issue(root: &Path, err: &ignore::Error) -> FileIssue {
    FileIssue {
        relative_path: error_path(err)
            .map(|p| relative_path(root, p))
            .unwrap_or_default(),
        message: err.to_string(),
    }
}

/// Walk `root` honouring `.gitignore`, [`IGNORE_FILE_NAME`], the pass
/// include/exclude patterns and (optionally) sensitive-file patterns.
///
/// A missing or unreadable root is an error; problems with individual
/// entries are collected in [`RepoScan::errors`].
pub fn scan_repository(
    root: &Path,
    registry: &ParserRegistry,
    options: &PassOptions,
) -> SageResult<RepoScan> {
    std::fs::read_dir(root).map_err(|e| {
        SageError::Index(format!("repository root {} is unreadable: {e}", root.display()))
    })?;

    let mut overrides = OverrideBuilder::new(root);
    let glob_error = |e: ignore::Error| SageError::Config(format!("invalid path pattern: {e}"));
    for pattern in options.include_patterns.iter().map(|p| p.trim()) {
        if !pattern.is_empty() {
            overrides.add(pattern).map_err(glob_error)?;
        }
    }
    let mut excludes: Vec<String> = options
        .exclude_patterns
        .iter()
        .map(|p| p.trim().trim_start_matches("./").to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if options.exclude_sensitive {
        excludes.extend(DEFAULT_SENSITIVE_EXCLUDE_PATTERNS.iter().map(|p| p.to_string()));
    }
    for pattern in &excludes {
        overrides.add(&format!("!{pattern}")).map_err(glob_error)?;
    }
    let overrides = overrides.build().map_err(glob_error)?;

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .git_global(false)
        .require_git(false)
        .add_custom_ignore_filename(IGNORE_FILE_NAME)
        .overrides(overrides)
        .filter_entry(|entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy();
            !(is_dir && IMPLICIT_IGNORED_DIRS.iter().any(|d| name == *d))
        })
        .sort_by_file_path(|a, b| a.cmp(b))
        .build();

    let mut scan = RepoScan::default();
    for result in walker {
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                let issue = walk_issue(root, &e);
                warn!(path = %issue.relative_path, error = %e, "skipping unreadable entry");
                scan.errors.push(issue);
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let rel = relative_path(root, entry.path());
        if registry.for_path(&rel).is_none() {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => {
                let modified_at = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64);
                scan.files.push(ScannedFile {
                    relative_path: rel,
                    absolute_path: entry.path().to_path_buf(),
                    size_bytes: meta.len() as i64,
                    modified_at,
                });
            }
            Err(e) => {
                warn!(path = %rel, error = %e, "cannot stat file");
                scan.errors.push(FileIssue {
                    relative_path: rel,
                    message: e.to_string(),
                });
            }
        }
    }
    debug!(files = scan.files.len(), errors = scan.errors.len(), "repository scanned");
    Ok(scan)
}

/// SHA-256 of raw bytes as lowercase hex.
pub fn compute_content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Commit id of the repository HEAD, if `root` lies inside a git checkout
/// with at least one commit.
pub fn head_commit(root: &Path) -> Option<String> {
    let repo = git2::Repository::discover(root).ok()?;
    let head = repo.head().ok()?;
    let commit = head.peel_to_commit().ok()?;
    Some(commit.id().to_string())
}

/// Map `f` over `items` on a pool of `workers` threads, falling back to
/// sequential execution when the pool cannot be built.
pub fn parallel_map<T, R, F>(items: &[T], workers: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    if items.is_empty() {
        return vec![];
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build();
    match pool {
        Ok(pool) => pool.install(|| items.par_iter().map(&f).collect()),
        Err(e) => {
            warn!(error = %e, "thread pool unavailable, running sequentially");
            items.iter().map(&f).collect()
        }
    }
}
