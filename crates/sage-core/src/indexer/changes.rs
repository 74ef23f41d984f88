//! Change detection: classify a scan against the stored file rows.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::indexer::filesystem::{compute_content_hash, parallel_map, FileIssue, RepoScan, ScannedFile};
use crate::models::FileRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
}

/// A file whose content must be (re-)extracted, with the bytes that were
/// fingerprinted.
#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub kind: ChangeKind,
    pub scanned: ScannedFile,
    pub file_hash: String,
    pub bytes: Vec<u8>,
    /// Stored row id for modified files.
    pub previous_id: Option<i64>,
}

/// Partitioned result of comparing a scan with the stored state.
#[derive(Debug, Clone, Default)]
pub struct ChangePlan {
    pub unchanged: Vec<String>,
    pub modified: Vec<ChangedFile>,
    pub added: Vec<ChangedFile>,
    /// Stored paths absent from the scan.
    pub removed: Vec<String>,
    /// Files or directories that could not be read; nothing below them is
    /// in any other partition.
    pub errors: Vec<FileIssue>,
}

impl ChangePlan {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// Added and modified files, in path order.
    pub fn changed(&self) -> Vec<&ChangedFile> {
        let mut all: Vec<&ChangedFile> = self.added.iter().chain(self.modified.iter()).collect();
        all.sort_by(|a, b| a.scanned.relative_path.cmp(&b.scanned.relative_path));
        all
    }
}

enum HashCheck {
    Unchanged,
    Changed { hash: String, bytes: Vec<u8> },
    Failed(String),
}

/// Classify every scanned file as unchanged, modified or added, and every
/// stored file missing from the scan as removed.
///
/// With `trust_mtime`, a stored row whose size and modification time match
/// the scan is taken as unchanged without reading the file.
pub fn plan_changes(
    scan: RepoScan,
    known: &[FileRecord],
    trust_mtime: bool,
    workers: usize,
) -> ChangePlan {
    let known_by_path: HashMap<&str, &FileRecord> =
        known.iter().map(|f| (f.relative_path.as_str(), f)).collect();

    let checks = parallel_map(&scan.files, workers, |file| {
        let previous = known_by_path.get(file.relative_path.as_str()).copied();
        if let Some(prev) = previous {
            if trust_mtime
                && prev.size_bytes == file.size_bytes
                && prev.modified_at.is_some()
                && prev.modified_at == file.modified_at
            {
                return HashCheck::Unchanged;
            }
        }
        match std::fs::read(&file.absolute_path) {
            Ok(bytes) => {
                let hash = compute_content_hash(&bytes);
                match previous {
                    Some(prev) if prev.file_hash == hash => HashCheck::Unchanged,
                    _ => HashCheck::Changed { hash, bytes },
                }
            }
            Err(e) => HashCheck::Failed(e.to_string()),
        }
    });

    let mut plan = ChangePlan {
        errors: scan.errors,
        ..ChangePlan::default()
    };
    let mut seen: HashSet<String> = HashSet::new();
    for (file, check) in scan.files.into_iter().zip(checks) {
        seen.insert(file.relative_path.clone());
        let previous = known_by_path.get(file.relative_path.as_str()).copied();
        match check {
            HashCheck::Unchanged => plan.unchanged.push(file.relative_path),
            HashCheck::Changed { hash, bytes } => {
                let changed = ChangedFile {
                    kind: if previous.is_some() {
                        ChangeKind::Modified
                    } else {
                        ChangeKind::Added
                    },
                    previous_id: previous.map(|p| p.id),
                    scanned: file,
                    file_hash: hash,
                    bytes,
                };
                debug!(path = %changed.scanned.relative_path, kind = ?changed.kind, "file changed");
                match changed.kind {
                    ChangeKind::Added => plan.added.push(changed),
                    ChangeKind::Modified => plan.modified.push(changed),
                }
            }
            HashCheck::Failed(message) => {
                warn!(path = %file.relative_path, error = %message, "cannot read file");
                plan.errors.push(FileIssue {
                    relative_path: file.relative_path,
                    message,
                });
            }
        }
    }

    let mut removed: Vec<String> = known
        .iter()
        .map(|f| f.relative_path.as_str())
        .filter(|p| !seen.contains(*p) && !plan.errors.iter().any(|e| e.covers(p)))
        .map(str::to_string)
        .collect();
    removed.sort();
    plan.removed = removed;
    plan
}
