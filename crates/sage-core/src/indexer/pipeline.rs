//! Incremental indexing pass: scan, extract in parallel, resolve against a
//! snapshot, then commit one file at a time.
//!
//! The resolver sees the persisted chunks of untouched files together with
//! the freshly extracted chunks of every re-parsed file. Calls into a file
//! committed later in the same pass are written unlinked and patched once
//! all units are in.
//!
//! Untouched files are reconciled afterwards. External imports that now
//! name a repository module become local and their calls are resolved again.
//! Unresolved calls are retried when their callee names a chunk written
//! since the last completed pass, which also covers files committed by an
//! interrupted one.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{IndexConfig, PassOptions};
use crate::embedding::priority::{NeutralPriority, PriorityContext, PriorityPolicy};
use crate::errors::{SageError, SageResult};
use crate::indexer::callgraph::{CallResolver, CallerScope, ChunkRef, Resolution, SymbolTable};
use crate::indexer::changes::{plan_changes, ChangedFile};
use crate::indexer::chunks::{extract_chunks, ExtractedFile};
use crate::indexer::filesystem::{head_commit, parallel_map, scan_repository, FileIssue};
use crate::indexer::imports::{classify_imports, classify_stored, ImportBindings, ModuleIndex};
use crate::indexer::parser::ParserRegistry;
use crate::models::{ParseStatus, PassPhase, Repository};
use crate::store::database::{
    CalleeTarget, CommittedUnit, FileUnit, NewCall, NewFile, Store, UnresolvedCall,
};

/// Outcome of one indexing pass.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub repo: String,
    pub phase: PassPhase,
    pub files_scanned: usize,
    pub files_unchanged: usize,
    pub files_added: usize,
    pub files_modified: usize,
    pub files_removed: usize,
    /// Scanned files per language.
    pub languages: IndexMap<String, usize>,
    pub parse_failures: Vec<FileIssue>,
    pub read_errors: Vec<FileIssue>,
    pub chunks_written: usize,
    pub calls_written: usize,
    pub imports_written: usize,
    pub calls_resolved: usize,
    pub calls_external: usize,
    pub calls_unresolved: usize,
    /// Calls of untouched files linked after the commits.
    pub calls_relinked: usize,
    /// Imports of untouched files that now resolve to a repository module.
    pub imports_reclassified: usize,
    /// External calls of untouched files turned internal by those imports.
    pub calls_reclassified: usize,
    pub queued: usize,
    pub elapsed_ms: u64,
}

impl IndexReport {
    fn new(repo: &str) -> Self {
        Self {
            repo: repo.to_string(),
            phase: PassPhase::Scanning,
            files_scanned: 0,
            files_unchanged: 0,
            files_added: 0,
            files_modified: 0,
            files_removed: 0,
            languages: IndexMap::new(),
            parse_failures: Vec::new(),
            read_errors: Vec::new(),
            chunks_written: 0,
            calls_written: 0,
            imports_written: 0,
            calls_resolved: 0,
            calls_external: 0,
            calls_unresolved: 0,
            calls_relinked: 0,
            imports_reclassified: 0,
            calls_reclassified: 0,
            queued: 0,
            elapsed_ms: 0,
        }
    }
}

/// A call whose callee belongs to another file of the same pass.
#[derive(Debug, Clone, Copy)]
struct DeferredLink {
    call: usize,
    file: usize,
    chunk: usize,
}

struct Extraction {
    module: String,
    outcome: Result<ExtractedFile, String>,
}

struct PendingUnit {
    unit: FileUnit,
    deferred: Vec<DeferredLink>,
}

/// Resolves persisted calls of untouched files against every stored chunk.
/// Each file's bindings are rebuilt from its import rows on first use.
struct StoredCalls<'s> {
    store: &'s Store,
    registry: &'s ParserRegistry,
    modules: &'s ModuleIndex,
    repo_id: i64,
    table: Option<SymbolTable>,
    bindings: HashMap<i64, ImportBindings>,
}

impl<'s> StoredCalls<'s> {
    fn new(
        store: &'s Store,
        registry: &'s ParserRegistry,
        modules: &'s ModuleIndex,
        repo_id: i64,
    ) -> Self {
        Self {
            store,
            registry,
            modules,
            repo_id,
            table: None,
            bindings: HashMap::new(),
        }
    }

    fn resolve(&mut self, call: &UnresolvedCall) -> SageResult<Option<Resolution>> {
        let (registry, modules) = (self.registry, self.modules);
        let Some(parser) = registry.for_path(&call.relative_path) else {
            return Ok(None);
        };
        if self.table.is_none() {
            let rows = self.store.symbol_rows(self.repo_id, &HashSet::new())?;
            self.table = Some(SymbolTable::from_rows(&rows));
        }
        if !self.bindings.contains_key(&call.file_id) {
            let classified: Vec<_> = self
                .store
                .imports_for_file(call.file_id)?
                .iter()
                .map(|r| classify_stored(parser.as_ref(), &call.relative_path, r, modules))
                .collect();
            self.bindings.insert(call.file_id, ImportBindings::build(&classified));
        }
        let (Some(table), Some(bindings)) = (self.table.as_ref(), self.bindings.get(&call.file_id))
        else {
            return Ok(None);
        };
        let module = parser.module_name(&call.relative_path);
        let caller = CallerScope {
            path: &call.relative_path,
            module: &module,
            qualified_name: &call.caller_qualified_name,
        };
        let resolver = CallResolver::new(table, parser.scope_rules());
        Ok(Some(resolver.resolve(&caller, bindings, &call.callee_name)))
    }
}

/// Drives indexing passes for repositories stored in one [`Store`].
pub struct Indexer<'a> {
    store: &'a Store,
    registry: ParserRegistry,
    policy: Box<dyn PriorityPolicy>,
    options: PassOptions,
}

impl<'a> Indexer<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            registry: ParserRegistry::default(),
            policy: Box::new(NeutralPriority),
            options: PassOptions::default(),
        }
    }

    pub fn with_registry(mut self, registry: ParserRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_policy(mut self, policy: impl PriorityPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_options(mut self, options: PassOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &PassOptions {
        &self.options
    }

    pub fn index_repository(&self, repo: &Repository) -> SageResult<IndexReport> {
        self.index_repository_cancellable(repo, &AtomicBool::new(false))
    }

    /// Run a pass that stops between file commits once `cancel` is set.
    /// A cancelled pass keeps what it committed but leaves the repository
    /// counters and timestamps untouched.
    pub fn index_repository_cancellable(
        &self,
        repo: &Repository,
        cancel: &AtomicBool,
    ) -> SageResult<IndexReport> {
        let started = Instant::now();
        info!(repo = %repo.name, path = %repo.path, "indexing pass started");
        match self.run_pass(repo, cancel, started) {
            Ok(report) => {
                info!(
                    repo = %repo.name,
                    added = report.files_added,
                    modified = report.files_modified,
                    removed = report.files_removed,
                    chunks = report.chunks_written,
                    calls = report.calls_written,
                    relinked = report.calls_relinked,
                    elapsed_ms = report.elapsed_ms,
                    "indexing pass committed"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(repo = %repo.name, phase = %PassPhase::Failed, error = %e, "indexing pass stopped");
                Err(e)
            }
        }
    }

    fn run_pass(
        &self,
        repo: &Repository,
        cancel: &AtomicBool,
        started: Instant,
    ) -> SageResult<IndexReport> {
        let mut report = IndexReport::new(&repo.name);
        let fail = |phase: PassPhase| move |e: SageError| e.in_pass(&repo.name, phase);
        let cancelled = || cancel.load(Ordering::Relaxed);
        let root = Path::new(&repo.path);

        // -- scanning ------------------------------------------------------
        report.phase = PassPhase::Scanning;
        debug!(languages = ?self.registry.languages(), "parsers registered");
        let config = IndexConfig::load(self.store).map_err(fail(PassPhase::Scanning))?;
        let scan = scan_repository(root, &self.registry, &self.options)
            .map_err(fail(PassPhase::Scanning))?;
        let known = self
            .store
            .list_files(repo.id)
            .map_err(fail(PassPhase::Scanning))?;

        report.files_scanned = scan.files.len();
        for file in &scan.files {
            if let Some(parser) = self.registry.for_path(&file.relative_path) {
                *report.languages.entry(parser.language().to_string()).or_insert(0) += 1;
            }
        }
        let mut modules = ModuleIndex::default();
        for file in &scan.files {
            modules.insert(file.relative_path.clone());
        }

        let plan = plan_changes(scan, &known, self.options.trust_mtime, self.options.workers);
        report.files_unchanged = plan.unchanged.len();
        report.files_added = plan.added.len();
        report.files_modified = plan.modified.len();
        report.files_removed = plan.removed.len();
        report.read_errors = plan.errors.clone();

        let known_ids: HashMap<&str, i64> = known
            .iter()
            .map(|f| (f.relative_path.as_str(), f.id))
            .collect();
        let mut touched: HashSet<i64> = plan.modified.iter().filter_map(|f| f.previous_id).collect();
        touched.extend(plan.removed.iter().filter_map(|p| known_ids.get(p.as_str()).copied()));

        // -- extracting ----------------------------------------------------
        report.phase = PassPhase::Extracting;
        let changed: Vec<&ChangedFile> = plan.changed();
        let extractions = parallel_map(&changed, self.options.workers, |file| {
            self.extract(file, &config)
        });
        for (file, extraction) in changed.iter().zip(&extractions) {
            if let Err(message) = &extraction.outcome {
                warn!(path = %file.scanned.relative_path, error = %message, "parse failed");
                report.parse_failures.push(FileIssue {
                    relative_path: file.scanned.relative_path.clone(),
                    message: message.clone(),
                });
            }
        }

        // -- resolving -----------------------------------------------------
        report.phase = PassPhase::Resolving;
        let rows = self
            .store
            .symbol_rows(repo.id, &touched)
            .map_err(fail(PassPhase::Resolving))?;
        let mut table = SymbolTable::from_rows(&rows);
        for (i, (file, extraction)) in changed.iter().zip(&extractions).enumerate() {
            if let Ok(extracted) = &extraction.outcome {
                table.add_pending(i, &file.scanned.relative_path, &extracted.chunks);
            }
        }
        debug!(symbols = table.len(), "resolution snapshot built");

        let mut pending: Vec<PendingUnit> = Vec::with_capacity(changed.len());
        for (i, (file, extraction)) in changed.iter().zip(extractions).enumerate() {
            pending.push(self.resolve_unit(i, file, extraction, &table, &modules, &mut report));
        }

        // -- queueing ------------------------------------------------------
        report.phase = PassPhase::Queueing;
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        if config.auto_embed {
            for (file, pending_unit) in changed.iter().zip(pending.iter_mut()) {
                let unit = &mut pending_unit.unit;
                unit.queue = unit
                    .chunks
                    .iter()
                    .enumerate()
                    .map(|(index, chunk)| {
                        let ctx = PriorityContext {
                            relative_path: &file.scanned.relative_path,
                            kind: chunk.kind,
                            qualified_name: &chunk.qualified_name,
                            modified_at: file.scanned.modified_at,
                            now_ms,
                        };
                        (index, self.policy.priority(&ctx))
                    })
                    .collect();
            }
        }

        for path in &plan.removed {
            if cancelled() {
                return Err(SageError::Cancelled {
                    repo: repo.name.clone(),
                });
            }
            self.store
                .remove_file(repo.id, path)
                .map_err(fail(PassPhase::Queueing))?;
            debug!(path = %path, "removed file");
        }

        let mut committed: Vec<Option<CommittedUnit>> = vec![None; pending.len()];
        let mut late_links: Vec<(usize, DeferredLink)> = Vec::new();
        let mut was_cancelled = false;
        for i in 0..pending.len() {
            if cancelled() {
                was_cancelled = true;
                break;
            }
            let PendingUnit { unit, deferred } = &mut pending[i];
            for link in deferred.iter() {
                match &committed[link.file] {
                    Some(target) => {
                        unit.calls[link.call].callee = CalleeTarget::Stored(target.chunk_ids[link.chunk]);
                    }
                    None => late_links.push((i, *link)),
                }
            }
            let result = self
                .store
                .commit_file_unit(repo.id, unit)
                .map_err(fail(PassPhase::Queueing))?;
            report.chunks_written += unit.chunks.len();
            report.calls_written += unit.calls.len();
            report.imports_written += unit.imports.len();
            report.queued += unit.queue.len();
            committed[i] = Some(result);
        }

        let links: Vec<(i64, i64)> = late_links
            .iter()
            .filter_map(|(i, link)| {
                let caller = committed[*i].as_ref()?;
                let target = committed[link.file].as_ref()?;
                Some((caller.call_ids[link.call], target.chunk_ids[link.chunk]))
            })
            .collect();
        let linked = self
            .store
            .link_calls(&links)
            .map_err(fail(PassPhase::Queueing))?;
        debug!(linked, "linked calls across files of the pass");

        if was_cancelled {
            info!(repo = %repo.name, "indexing pass cancelled between file commits");
            return Err(SageError::Cancelled {
                repo: repo.name.clone(),
            });
        }

        // -- reconcile untouched files -------------------------------------
        let rewritten: HashSet<i64> = committed.iter().flatten().map(|c| c.file_id).collect();
        let since = self
            .store
            .files_since_last_pass(repo.id)
            .map_err(fail(PassPhase::Resolving))?;
        if !since.is_empty() {
            let mut stored = StoredCalls::new(self.store, &self.registry, &modules, repo.id);
            self.refresh_imports(repo, &mut stored, &rewritten, &modules, &mut report)
                .map_err(fail(PassPhase::Resolving))?;
            let new_names = self
                .store
                .chunk_names(&since)
                .map_err(fail(PassPhase::Resolving))?;
            report.calls_relinked += self
                .retry_unresolved(repo, &mut stored, &new_names, &rewritten)
                .map_err(fail(PassPhase::Resolving))?;
        }

        // -- committed -----------------------------------------------------
        let commit = self.options.commit.clone().or_else(|| head_commit(root));
        self.store
            .update_repo_aggregates(repo.id, commit.as_deref())
            .map_err(fail(PassPhase::Committed))?;
        report.phase = PassPhase::Committed;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    fn extract(&self, file: &ChangedFile, config: &IndexConfig) -> Extraction {
        let path = file.scanned.relative_path.as_str();
        let Some(parser) = self.registry.for_path(path) else {
            return Extraction {
                module: String::new(),
                outcome: Err(format!("no parser handles {path}")),
            };
        };
        let module = parser.module_name(path);
        let outcome = parser.parse(path, &file.bytes).and_then(|tree| {
            let source = std::str::from_utf8(&file.bytes).map_err(|e| e.to_string())?;
            extract_chunks(path, source, &module, &tree, config).map_err(|e| e.to_string())
        });
        if let Ok(extracted) = &outcome {
            debug!(path, chunks = extracted.chunks.len(), calls = extracted.calls.len(), "extracted");
        }
        Extraction { module, outcome }
    }

    /// Resolve one file's calls and assemble its commit unit.
    fn resolve_unit(
        &self,
        file_index: usize,
        file: &ChangedFile,
        extraction: Extraction,
        table: &SymbolTable,
        modules: &ModuleIndex,
        report: &mut IndexReport,
    ) -> PendingUnit {
        let path = file.scanned.relative_path.as_str();
        let mut unit = FileUnit {
            file: NewFile {
                relative_path: path.to_string(),
                file_hash: file.file_hash.clone(),
                size_bytes: file.scanned.size_bytes,
                modified_at: file.scanned.modified_at,
                parse_status: ParseStatus::Parsed,
                parse_error: None,
            },
            chunks: Vec::new(),
            imports: Vec::new(),
            calls: Vec::new(),
            queue: Vec::new(),
        };
        let mut deferred = Vec::new();

        let (extracted, parser) = match (extraction.outcome, self.registry.for_path(path)) {
            (Ok(extracted), Some(parser)) => (extracted, parser),
            (Err(message), _) => {
                unit.file.parse_status = ParseStatus::Failed;
                unit.file.parse_error = Some(message);
                return PendingUnit { unit, deferred };
            }
            (Ok(_), None) => {
                unit.file.parse_status = ParseStatus::Failed;
                unit.file.parse_error = Some(format!("no parser handles {path}"));
                return PendingUnit { unit, deferred };
            }
        };

        let classified = classify_imports(parser.as_ref(), path, &extracted.imports, modules);
        let bindings = ImportBindings::build(&classified);
        let resolver = CallResolver::new(table, parser.scope_rules());

        for chunk_call in &extracted.calls {
            let caller = CallerScope {
                path,
                module: &extraction.module,
                qualified_name: &extracted.chunks[chunk_call.chunk].qualified_name,
            };
            let resolution = resolver.resolve(&caller, &bindings, &chunk_call.call.callee);
            let (callee, is_external) = match resolution {
                Resolution::Resolved(ChunkRef::Stored(id)) => {
                    report.calls_resolved += 1;
                    (CalleeTarget::Stored(id), false)
                }
                Resolution::Resolved(ChunkRef::Pending { file, index }) if file == file_index => {
                    report.calls_resolved += 1;
                    (CalleeTarget::Local(index), false)
                }
                Resolution::Resolved(ChunkRef::Pending { file, index }) => {
                    report.calls_resolved += 1;
                    deferred.push(DeferredLink {
                        call: unit.calls.len(),
                        file,
                        chunk: index,
                    });
                    (CalleeTarget::Unresolved, false)
                }
                Resolution::External => {
                    report.calls_external += 1;
                    (CalleeTarget::Unresolved, true)
                }
                Resolution::Unresolved => {
                    report.calls_unresolved += 1;
                    (CalleeTarget::Unresolved, false)
                }
            };
            unit.calls.push(NewCall {
                caller: chunk_call.chunk,
                callee_name: chunk_call.call.callee.clone(),
                callee,
                line: chunk_call.call.line,
                column: chunk_call.call.column,
                is_external,
            });
        }

        unit.imports = classified.into_iter().map(|c| c.record).collect();
        unit.chunks = extracted.chunks;
        PendingUnit { unit, deferred }
    }

    /// Mark external imports of files outside `rewritten` local when their
    /// module now exists in the repository, then resolve the external calls
    /// of those files again. Calls still bound to an external import keep
    /// their classification.
    fn refresh_imports(
        &self,
        repo: &Repository,
        stored: &mut StoredCalls<'_>,
        rewritten: &HashSet<i64>,
        modules: &ModuleIndex,
        report: &mut IndexReport,
    ) -> SageResult<()> {
        let now_local: Vec<(i64, i64)> = self
            .store
            .external_imports(repo.id)?
            .into_iter()
            .filter(|(_, import)| !rewritten.contains(&import.file_id))
            .filter(|(path, import)| {
                self.registry
                    .for_path(path)
                    .and_then(|parser| modules.resolve(parser.as_ref(), path, &import.module_name))
                    .is_some()
            })
            .map(|(_, import)| (import.id, import.file_id))
            .collect();
        if now_local.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = now_local.iter().map(|(id, _)| *id).collect();
        report.imports_reclassified = self.store.mark_imports_local(&ids)?;
        let files: HashSet<i64> = now_local.iter().map(|(_, file)| *file).collect();
        debug!(imports = ids.len(), files = files.len(), "imports became local");

        let mut updates = Vec::new();
        for call in self.store.external_calls(repo.id)? {
            if !files.contains(&call.file_id) {
                continue;
            }
            match stored.resolve(&call)? {
                None | Some(Resolution::External) => {}
                Some(Resolution::Resolved(ChunkRef::Stored(id))) => {
                    updates.push((call.call_id, Some(id)));
                }
                Some(_) => updates.push((call.call_id, None)),
            }
        }
        report.calls_reclassified = self.store.internalize_calls(&updates)?;
        report.calls_relinked += updates.iter().filter(|(_, id)| id.is_some()).count();
        Ok(())
    }

    /// Link unresolved, non-external calls of files outside `rewritten`
    /// whose callee's last segment is in `new_names`. Returns the number of
    /// calls linked.
    fn retry_unresolved(
        &self,
        repo: &Repository,
        stored: &mut StoredCalls<'_>,
        new_names: &HashSet<String>,
        rewritten: &HashSet<i64>,
    ) -> SageResult<usize> {
        if new_names.is_empty() {
            return Ok(0);
        }
        let candidates: Vec<UnresolvedCall> = self
            .store
            .unresolved_internal_calls(repo.id)?
            .into_iter()
            .filter(|c| !rewritten.contains(&c.file_id))
            .filter(|c| {
                let last = c.callee_name.rsplit('.').next().unwrap_or(&c.callee_name);
                new_names.contains(last)
            })
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut links = Vec::new();
        for call in &candidates {
            if let Some(Resolution::Resolved(ChunkRef::Stored(id))) = stored.resolve(call)? {
                links.push((call.call_id, id));
            }
        }
        let linked = self.store.link_calls(&links)?;
        debug!(candidates = candidates.len(), linked, "retried unresolved calls");
        Ok(linked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::priority::RecentEditBoost;
    use crate::embedding::queue::EmbeddingQueue;
    use crate::models::{CallRecord, ChunkKind, ChunkRecord};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Store,
        repo: Repository,
    }

    impl Fixture {
        fn new(files: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            for (path, content) in files {
                write(&dir, path, content);
            }
            let store = Store::open_in_memory().unwrap();
            let repo = store
                .register_repo("demo", &dir.path().to_string_lossy(), None)
                .unwrap();
            Self { dir, store, repo }
        }

        fn indexer(&self) -> Indexer<'_> {
            Indexer::new(&self.store).with_options(PassOptions {
                workers: 2,
                exclude_sensitive: true,
                commit: Some("abc123".to_string()),
                ..PassOptions::default()
            })
        }

        fn index(&self) -> IndexReport {
            self.indexer().index_repository(&self.repo).unwrap()
        }

        fn chunks(&self, path: &str) -> Vec<ChunkRecord> {
            let file = self.store.get_file(self.repo.id, path).unwrap().unwrap();
            self.store.chunks_for_file(file.id).unwrap()
        }

        fn chunk(&self, path: &str, qualified_name: &str) -> ChunkRecord {
            self.chunks(path)
                .into_iter()
                .find(|c| c.qualified_name == qualified_name)
                .unwrap()
        }

        fn calls_named(&self, callee: &str) -> Vec<CallRecord> {
            self.store
                .calls_for_repo(self.repo.id)
                .unwrap()
                .into_iter()
                .filter(|c| c.callee_name == callee)
                .collect()
        }

        /// Commit one changed file on its own and stop, leaving the pass
        /// unfinished the way a cancelled one does.
        fn commit_alone(&self, path: &str) {
            let indexer = self.indexer();
            let scan =
                scan_repository(self.dir.path(), &indexer.registry, &indexer.options).unwrap();
            let modules = ModuleIndex::new(scan.files.iter().map(|f| f.relative_path.clone()));
            let known = self.store.list_files(self.repo.id).unwrap();
            let plan = plan_changes(scan, &known, false, 1);
            let file = plan
                .changed()
                .into_iter()
                .find(|f| f.scanned.relative_path == path)
                .unwrap();
            let extraction = indexer.extract(file, &IndexConfig::default());
            let mut report = IndexReport::new(&self.repo.name);
            let pending =
                indexer.resolve_unit(0, file, extraction, &SymbolTable::new(), &modules, &mut report);
            self.store.commit_file_unit(self.repo.id, &pending.unit).unwrap();
        }

        fn count(&self, sql: &str) -> i64 {
            self.store
                .connection()
                .query_row(sql, [], |row| row.get(0))
                .unwrap()
        }
    }

    fn write(dir: &TempDir, path: &str, content: &str) {
        let full = dir.path().join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    const A_PY: &str = "def f():\n    return 1\n";
    const B_PY: &str = "from a import f\n\n\ndef g():\n    return f()\n";

    #[test]
    fn test_from_import_resolves_across_files() {
        let fx = Fixture::new(&[("a.py", A_PY), ("b.py", B_PY)]);
        let report = fx.index();
        assert_eq!(report.phase, PassPhase::Committed);
        assert_eq!(report.files_added, 2);
        assert_eq!(report.languages.get("python"), Some(&2));

        let f = fx.chunk("a.py", "a.f");
        let calls = fx.calls_named("f");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].callee_chunk_id, Some(f.id));
        assert!(!calls[0].is_external);
        assert_eq!(calls[0].caller_chunk_id, fx.chunk("b.py", "b.g").id);

        let b = fx.store.get_file(fx.repo.id, "b.py").unwrap().unwrap();
        let imports = fx.store.imports_for_file(b.id).unwrap();
        assert!(imports[0].is_local);
        assert_eq!(imports[0].imported_names[0].name, "f");
    }

    #[test]
    fn test_call_into_later_file_is_linked_after_commit() {
        // `a.py` commits before `b.py`, so its call is patched afterwards.
        let fx = Fixture::new(&[
            ("a.py", "from b import g\n\n\ndef f():\n    return g()\n"),
            ("b.py", "def g():\n    return 2\n"),
        ]);
        fx.index();
        let calls = fx.calls_named("g");
        assert_eq!(calls[0].callee_chunk_id, Some(fx.chunk("b.py", "b.g").id));
    }

    #[test]
    fn test_unknown_name_stays_internal_and_unresolved() {
        let fx = Fixture::new(&[("a.py", "import os\n\n\ndef f():\n    ghost()\n    os.getcwd()\n")]);
        let report = fx.index();
        let ghost = fx.calls_named("ghost");
        assert_eq!(ghost[0].callee_chunk_id, None);
        assert!(!ghost[0].is_external);

        let os = fx.calls_named("os.getcwd");
        assert_eq!(os[0].callee_chunk_id, None);
        assert!(os[0].is_external);
        assert_eq!(report.calls_external, 1);
        assert_eq!(report.calls_unresolved, 1);
    }

    #[test]
    fn test_external_calls_never_carry_callee() {
        let fx = Fixture::new(&[
            ("a.py", "import numpy as np\n\n\ndef array():\n    return np.array([1])\n"),
        ]);
        fx.index();
        assert_eq!(
            fx.count("SELECT COUNT(*) FROM function_calls WHERE is_external = 1 AND callee_chunk_id IS NOT NULL;"),
            0
        );
        assert_eq!(fx.count("SELECT COUNT(*) FROM function_calls WHERE is_external = 1;"), 1);
    }

    #[test]
    fn test_recursion_and_methods() {
        let fx = Fixture::new(&[(
            "shapes.py",
            "class Square:\n    def side(self):\n        return 2\n\n    def area(self):\n        return self.side() * self.side()\n\n\ndef fact(n):\n    return n * fact(n - 1)\n",
        )]);
        fx.index();
        let fact = fx.chunk("shapes.py", "shapes.fact");
        assert_eq!(fx.calls_named("fact")[0].callee_chunk_id, Some(fact.id));
        let side = fx.chunk("shapes.py", "shapes.Square.side");
        let self_calls = fx.calls_named("self.side");
        assert_eq!(self_calls.len(), 2);
        assert!(self_calls.iter().all(|c| c.callee_chunk_id == Some(side.id)));
    }

    #[test]
    fn test_child_spans_nest_in_parents() {
        let fx = Fixture::new(&[(
            "m.py",
            "\"\"\"Module.\"\"\"\n\n\nclass A:\n    \"\"\"Doc.\"\"\"\n\n    @staticmethod\n    def b():\n        def c():\n            pass\n        return c\n",
        )]);
        fx.index();
        let chunks = fx.chunks("m.py");
        assert_eq!(chunks.len(), 4);
        let by_id: HashMap<i64, &ChunkRecord> = chunks.iter().map(|c| (c.id, c)).collect();
        for chunk in &chunks {
            if let Some(parent) = chunk.parent_chunk_id.and_then(|p| by_id.get(&p)) {
                assert!(chunk.start_line >= parent.start_line);
                assert!(chunk.end_line <= parent.end_line);
            }
        }
        assert_eq!(fx.chunk("m.py", "m.A.b").kind, ChunkKind::Method);
        assert_eq!(fx.chunk("m.py", "m.A").docstring.as_deref(), Some("Doc."));
    }

    #[test]
    fn test_second_pass_without_changes_is_idempotent() {
        let fx = Fixture::new(&[("a.py", A_PY), ("b.py", B_PY), ("pkg/c.py", "def h():\n    f()\n")]);
        fx.index();
        let snapshot = |fx: &Fixture| {
            let files = fx.store.list_files(fx.repo.id).unwrap();
            let chunks: Vec<Vec<ChunkRecord>> =
                files.iter().map(|f| fx.store.chunks_for_file(f.id).unwrap()).collect();
            let hashes: Vec<String> = files.iter().map(|f| f.file_hash.clone()).collect();
            (hashes, chunks, fx.store.calls_for_repo(fx.repo.id).unwrap())
        };
        let before = snapshot(&fx);
        let report = fx.index();
        assert_eq!(report.files_unchanged, 3);
        assert_eq!(report.files_added + report.files_modified + report.files_removed, 0);
        assert_eq!(report.chunks_written, 0);
        assert_eq!(before, snapshot(&fx));
    }

    #[test]
    fn test_every_chunk_is_queued_exactly_once() {
        let fx = Fixture::new(&[("a.py", A_PY), ("b.py", B_PY)]);
        let report = fx.index();
        let chunks = fx.count("SELECT COUNT(*) FROM chunks;");
        assert_eq!(report.queued as i64, chunks);
        assert_eq!(
            fx.count(
                "SELECT COUNT(*) FROM chunks c \
                 WHERE (c.embedding_id IS NULL) = \
                       (NOT EXISTS (SELECT 1 FROM embedding_queue q WHERE q.chunk_id = c.id));"
            ),
            0
        );

        let queue = EmbeddingQueue::new(&fx.store);
        let first = queue.drain(1).unwrap().remove(0);
        queue.complete(first.chunk_id, "vec").unwrap();
        assert_eq!(queue.pending_count().unwrap(), chunks - 1);
    }

    #[test]
    fn test_auto_embed_off_queues_nothing() {
        let fx = Fixture::new(&[("a.py", A_PY)]);
        fx.store.set_config("auto_embed", "false").unwrap();
        let report = fx.index();
        assert_eq!(report.queued, 0);
        assert_eq!(fx.count("SELECT COUNT(*) FROM embedding_queue;"), 0);
    }

    #[test]
    fn test_priority_policy_is_applied() {
        let fx = Fixture::new(&[("a.py", A_PY)]);
        Indexer::new(&fx.store)
            .with_policy(RecentEditBoost {
                window_ms: i64::MAX,
                boost: 3.0,
            })
            .index_repository(&fx.repo)
            .unwrap();
        let queue = EmbeddingQueue::new(&fx.store);
        let entries = queue.drain(10).unwrap();
        assert_eq!(entries[0].priority, 3.0);
        assert_eq!(entries.last().unwrap().priority, 1.5);
    }

    #[test]
    fn test_deleted_file_cascades_and_clears_incoming_edges() {
        let fx = Fixture::new(&[("a.py", A_PY), ("b.py", B_PY)]);
        fx.index();
        fs::remove_file(fx.dir.path().join("a.py")).unwrap();
        let report = fx.index();
        assert_eq!(report.files_removed, 1);
        assert!(fx.store.get_file(fx.repo.id, "a.py").unwrap().is_none());

        let calls = fx.calls_named("f");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].callee_chunk_id, None);
        assert!(!calls[0].is_external);
        assert_eq!(fx.count("SELECT COUNT(*) FROM chunks WHERE qualified_name LIKE 'a%';"), 0);
        assert_eq!(
            fx.count("SELECT COUNT(*) FROM embedding_queue;"),
            fx.count("SELECT COUNT(*) FROM chunks;")
        );
        let repo = fx.store.get_repo(fx.repo.id).unwrap().unwrap();
        assert_eq!(repo.file_count, 1);
    }

    #[test]
    fn test_modified_callee_file_relinks_untouched_callers() {
        let fx = Fixture::new(&[("a.py", A_PY), ("b.py", B_PY)]);
        fx.index();
        write(&fx.dir, "a.py", "# moved\n\n\ndef f():\n    return 2\n");
        let report = fx.index();
        assert_eq!(report.files_modified, 1);
        assert_eq!(report.calls_relinked, 1);
        let f = fx.chunk("a.py", "a.f");
        assert_eq!(fx.calls_named("f")[0].callee_chunk_id, Some(f.id));
    }

    #[test]
    fn test_new_definition_satisfies_earlier_unresolved_call() {
        let fx = Fixture::new(&[("b.py", "def g():\n    return later()\n")]);
        fx.index();
        assert_eq!(fx.calls_named("later")[0].callee_chunk_id, None);

        write(&fx.dir, "c.py", "def later():\n    return 3\n");
        let report = fx.index();
        assert_eq!(report.files_added, 1);
        assert_eq!(report.calls_relinked, 1);
        let later = fx.chunk("c.py", "c.later");
        assert_eq!(fx.calls_named("later")[0].callee_chunk_id, Some(later.id));
    }

    #[test]
    fn test_next_pass_relinks_calls_broken_by_interrupted_pass() {
        let fx = Fixture::new(&[("a.py", A_PY), ("b.py", B_PY)]);
        fx.index();
        write(&fx.dir, "a.py", "# moved\n\n\ndef f():\n    return 2\n");
        fx.commit_alone("a.py");
        assert_eq!(fx.calls_named("f")[0].callee_chunk_id, None);

        let report = fx.index();
        assert_eq!(report.files_modified + report.files_added, 0);
        assert_eq!(report.calls_relinked, 1);
        let f = fx.chunk("a.py", "a.f");
        assert_eq!(fx.calls_named("f")[0].callee_chunk_id, Some(f.id));

        let again = fx.index();
        assert_eq!(again.calls_relinked, 0);
    }

    #[test]
    fn test_module_added_later_turns_external_import_local() {
        let fx = Fixture::new(&[(
            "b.py",
            "from a import f, gone\n\n\ndef g():\n    gone()\n    return f()\n",
        )]);
        let report = fx.index();
        assert_eq!(report.calls_external, 2);

        write(&fx.dir, "a.py", A_PY);
        let report = fx.index();
        assert_eq!(report.files_added, 1);
        assert_eq!(report.imports_reclassified, 1);
        assert_eq!(report.calls_reclassified, 2);
        assert_eq!(report.calls_relinked, 1);

        let f = &fx.calls_named("f")[0];
        assert!(!f.is_external);
        assert_eq!(f.callee_chunk_id, Some(fx.chunk("a.py", "a.f").id));
        let gone = &fx.calls_named("gone")[0];
        assert!(!gone.is_external);
        assert_eq!(gone.callee_chunk_id, None);

        let b = fx.store.get_file(fx.repo.id, "b.py").unwrap().unwrap();
        assert!(fx.store.imports_for_file(b.id).unwrap()[0].is_local);
        assert_eq!(fx.count("SELECT COUNT(*) FROM function_calls WHERE is_external = 1;"), 0);
    }

    #[test]
    fn test_parse_failure_invalidates_previous_chunks() {
        let fx = Fixture::new(&[("a.py", A_PY), ("b.py", B_PY)]);
        fx.index();
        write(&fx.dir, "a.py", "def f(:\n    return\n");
        let report = fx.index();
        assert_eq!(report.phase, PassPhase::Committed);
        assert_eq!(report.parse_failures.len(), 1);
        assert_eq!(report.parse_failures[0].relative_path, "a.py");

        let file = fx.store.get_file(fx.repo.id, "a.py").unwrap().unwrap();
        assert_eq!(file.parse_status, ParseStatus::Failed);
        assert!(file.parse_error.unwrap().contains("syntax error"));
        assert!(fx.chunks("a.py").is_empty());
        assert_eq!(fx.calls_named("f")[0].callee_chunk_id, None);
        // The other file is untouched.
        assert!(!fx.chunks("b.py").is_empty());
    }

    #[test]
    fn test_cancelled_pass_keeps_counters() {
        let fx = Fixture::new(&[("a.py", A_PY), ("b.py", B_PY)]);
        let cancel = AtomicBool::new(true);
        let err = fx
            .indexer()
            .index_repository_cancellable(&fx.repo, &cancel)
            .unwrap_err();
        assert!(matches!(err, SageError::Cancelled { .. }));
        let repo = fx.store.get_repo(fx.repo.id).unwrap().unwrap();
        assert!(repo.last_parsed_at.is_none());
        assert_eq!(repo.file_count, 0);

        let report = fx.index();
        assert_eq!(report.files_added, 2);
        let repo = fx.store.get_repo(fx.repo.id).unwrap().unwrap();
        assert_eq!(repo.file_count, 2);
        assert_eq!(repo.chunk_count, 4);
        assert_eq!(repo.last_commit.as_deref(), Some("abc123"));
        assert!(repo.last_parsed_at.is_some());
    }

    #[test]
    fn test_missing_root_fails_in_scanning() {
        let fx = Fixture::new(&[]);
        let missing = fx.store.register_repo("gone", "/nonexistent/sage/root", None).unwrap();
        let err = fx.indexer().index_repository(&missing).unwrap_err();
        assert_eq!(err.phase(), Some(PassPhase::Scanning));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_report_serializes() {
        let fx = Fixture::new(&[("a.py", A_PY)]);
        let report = fx.index();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["phase"], "committed");
        assert_eq!(json["languages"]["python"], 1);
    }
}
