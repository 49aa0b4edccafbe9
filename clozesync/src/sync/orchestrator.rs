use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clozesync_core::NoteId;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::claims::IdClaims;
use super::file_job::{ConfirmedEntry, FileJob, FileOutcome, FileStatus, WorkerContext, process_file};
use super::fingerprint::Fingerprint;
use super::orphan::{OrphanCandidate, filter_moves};
use super::paths::{discover_markdown, path_for_key, vault_key};
use super::queue::RemoteQueue;
use super::report::{IssueKind, RunIssue, RunReport};
use super::store::{FingerprintStore, StoreError};
use crate::deck::DeckRouter;
use crate::extract::{ContentExtractor, SourceFile};
use crate::render::{LimitedRenderer, RenderService};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("cache error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to scan {root}: {source}")]
    Discover { root: PathBuf, source: io::Error },
    #[error("cache belongs to vault {cached}, not {root}; pass the same root or use another cache file")]
    RootMismatch { cached: PathBuf, root: PathBuf },
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Never skip a file because its hash matches the cache.
    pub cache_disabled: bool,
    /// Re-extract unchanged files so their cached cards are re-checked.
    pub track_seen_forced: bool,
    pub target_deck_override: Option<String>,
    pub track_deletions: bool,
    pub checkpoint_per_file: bool,
    pub workers: usize,
    pub render_concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cache_disabled: false,
            track_seen_forced: false,
            target_deck_override: None,
            track_deletions: true,
            checkpoint_per_file: false,
            workers: 4,
            render_concurrency: 2,
        }
    }
}

/// Drives one sync run over a vault. The orchestrator is the only writer of
/// the [`FingerprintStore`]: workers report confirmed remote results over a
/// channel and the orchestrator commits them as they arrive.
pub struct Orchestrator {
    root: PathBuf,
    store: FingerprintStore,
    remote: Arc<RemoteQueue>,
    extractor: Arc<dyn ContentExtractor>,
    renderer: Arc<dyn RenderService>,
    router: Arc<DeckRouter>,
    options: RunOptions,
    ignore: Vec<PathBuf>,
    cancel: CancellationToken,
    pending: Vec<OrphanCandidate>,
}

impl Orchestrator {
    pub fn new(
        root: impl Into<PathBuf>,
        store: FingerprintStore,
        remote: Arc<RemoteQueue>,
        extractor: Arc<dyn ContentExtractor>,
        renderer: Arc<dyn RenderService>,
        router: DeckRouter,
        options: RunOptions,
    ) -> Self {
        let router = router.with_override(options.target_deck_override.clone());
        Self {
            root: root.into(),
            store,
            remote,
            extractor,
            renderer,
            router: Arc::new(router),
            options,
            ignore: Vec::new(),
            cancel: CancellationToken::new(),
            pending: Vec::new(),
        }
    }

    pub fn with_ignore(mut self, ignore: Vec<PathBuf>) -> Self {
        self.ignore = ignore
            .into_iter()
            .map(|entry| {
                if entry.is_absolute() {
                    entry
                } else {
                    self.root.join(entry)
                }
            })
            .collect();
        self
    }

    /// Cancelling the token stops workers; confirmed results are kept.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &FingerprintStore {
        &self.store
    }

    pub fn into_store(self) -> FingerprintStore {
        self.store
    }

    /// Candidates awaiting a delete/keep decision after [`Orchestrator::run`].
    pub fn orphan_candidates(&self) -> &[OrphanCandidate] {
        &self.pending
    }

    pub async fn run(&mut self) -> Result<RunReport, RunError> {
        match self.store.root() {
            Some(cached) if cached != self.root => {
                return Err(RunError::RootMismatch {
                    cached: cached.to_path_buf(),
                    root: self.root.clone(),
                });
            }
            Some(_) => {}
            None => self.store.set_root(self.root.clone()),
        }
        let mut report = RunReport::default();
        self.pending.clear();
        self.store.clear_seen();

        let files = discover_markdown(&self.root, &self.ignore).map_err(|source| {
            RunError::Discover {
                root: self.root.clone(),
                source,
            }
        })?;
        info!(root = %self.root.display(), files = files.len(), "sync run started");

        let (commits, mut confirmed) = mpsc::unbounded_channel();
        let ctx = Arc::new(WorkerContext {
            remote: self.remote.clone(),
            extractor: self.extractor.clone(),
            renderer: Arc::new(LimitedRenderer::new(
                self.renderer.clone(),
                self.options.render_concurrency,
                Handle::current(),
            )),
            router: self.router.clone(),
            claims: Arc::new(IdClaims::new(self.root.clone(), &self.store)),
            reuse_hash: !self.options.cache_disabled && !self.options.track_seen_forced,
            commits,
        });
        let workers = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut present = HashSet::new();
        for absolute in files {
            let key = match vault_key(&self.root, &absolute) {
                Ok(key) => key,
                Err(err) => {
                    report.issues.push(RunIssue::file(
                        absolute.display().to_string(),
                        IssueKind::Io,
                        err.to_string(),
                    ));
                    continue;
                }
            };
            present.insert(key.clone());
            let job = FileJob {
                prior: self.store.get(&key).cloned(),
                source: SourceFile { key, absolute },
            };
            let ctx = ctx.clone();
            let workers = workers.clone();
            tasks.spawn(async move {
                let _slot = workers.acquire_owned().await;
                process_file(ctx, job).await
            });
        }
        drop(ctx);

        let mut created: HashMap<Fingerprint, Vec<NoteId>> = HashMap::new();
        let mut orphans = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !report.cancelled => {
                    warn!("cancellation requested, stopping workers");
                    report.cancelled = true;
                    tasks.abort_all();
                }
                Some(entry) = confirmed.recv() => self.commit(entry),
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(outcome)) => {
                        while let Ok(entry) = confirmed.try_recv() {
                            self.commit(entry);
                        }
                        self.finish_file(outcome, &mut report, &mut created, &mut orphans);
                    }
                    Some(Err(err)) if err.is_cancelled() => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "file worker panicked");
                        report.issues.push(RunIssue::file(
                            self.root.display().to_string(),
                            IssueKind::Io,
                            format!("worker failed: {err}"),
                        ));
                    }
                },
            }
        }
        while let Ok(entry) = confirmed.try_recv() {
            self.commit(entry);
        }

        if report.cancelled || report.halted {
            info!(
                cancelled = report.cancelled,
                halted = report.halted,
                "run stopped early, skipping deletion tracking"
            );
        } else if self.options.track_deletions {
            self.collect_orphans(orphans, &present, &created, &mut report)
                .await;
        }

        self.store.persist()?;
        info!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            orphaned = report.orphaned,
            issues = report.issues.len(),
            "sync run finished"
        );
        Ok(report)
    }

    /// Deletes the confirmed candidates remotely, then drops their entries.
    /// Candidates not confirmed stay active.
    pub async fn apply_deletions(
        &mut self,
        confirmed: &[OrphanCandidate],
        report: &mut RunReport,
    ) -> Result<(), RunError> {
        let ids: Vec<NoteId> = confirmed
            .iter()
            .map(|candidate| candidate.note_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            self.pending.clear();
            return Ok(());
        }
        match self.remote.delete_notes(&ids).await {
            Ok(()) => {
                for candidate in confirmed {
                    report.deleted += self
                        .store
                        .remove_entries(&candidate.path, &[candidate.position]);
                }
                self.drop_empty_missing_records();
                info!(deleted = report.deleted, "orphaned notes deleted");
            }
            Err(err) => {
                warn!(error = %err, "deleting orphaned notes failed");
                for candidate in confirmed {
                    report.issues.push(RunIssue::unit(
                        candidate.path.as_str(),
                        candidate.position,
                        IssueKind::from(&err),
                        err.to_string(),
                    ));
                }
            }
        }
        self.pending.clear();
        self.store.persist()?;
        Ok(())
    }

    fn commit(&mut self, entry: ConfirmedEntry) {
        debug!(path = %entry.path, position = entry.position, note_id = %entry.note_id, "entry committed");
        self.store
            .commit_entry(&entry.path, entry.position, entry.fingerprint, entry.note_id);
    }

    fn finish_file(
        &mut self,
        outcome: FileOutcome,
        report: &mut RunReport,
        created: &mut HashMap<Fingerprint, Vec<NoteId>>,
        orphans: &mut Vec<OrphanCandidate>,
    ) {
        match outcome.status {
            FileStatus::Skipped => {
                self.store.mark_all_seen(&outcome.path);
                report.skipped_files += 1;
            }
            FileStatus::Failed => {
                self.store.mark_all_seen(&outcome.path);
                report.failed_files += 1;
            }
            FileStatus::Processed { content_hash } => {
                let seen_at = OffsetDateTime::now_utc().unix_timestamp();
                self.store
                    .set_file_state(&outcome.path, content_hash, seen_at);
                report.processed_files += 1;
            }
        }
        report.created += outcome.created;
        report.updated += outcome.updated;
        report.unchanged += outcome.unchanged;
        report.halted |= outcome.halted;
        report.issues.extend(outcome.issues);
        orphans.extend(outcome.orphans);
        for (fingerprint, note_id) in outcome.created_notes {
            created.entry(fingerprint).or_default().push(note_id);
        }

        if self.options.checkpoint_per_file
            && let Err(err) = self.store.persist()
        {
            warn!(path = %outcome.path, error = %err, "checkpoint failed");
        }
    }

    async fn collect_orphans(
        &mut self,
        mut candidates: Vec<OrphanCandidate>,
        present: &HashSet<String>,
        created: &HashMap<Fingerprint, Vec<NoteId>>,
        report: &mut RunReport,
    ) {
        for (path, record) in self.store.records() {
            if present.contains(path) || self.is_ignored(path) || self.exists(path) {
                continue;
            }
            debug!(path = %path, entries = record.entries.len(), "file disappeared");
            candidates.extend(record.entries.iter().map(|entry| OrphanCandidate {
                path: path.clone(),
                position: entry.position,
                fingerprint: entry.fingerprint.clone(),
                note_id: entry.note_id,
            }));
        }

        let candidate_keys: HashSet<(&str, usize)> = candidates
            .iter()
            .map(|candidate| (candidate.path.as_str(), candidate.position))
            .collect();
        let bound: HashSet<NoteId> = self
            .store
            .records()
            .values()
            .flat_map(|record| {
                record
                    .entries
                    .iter()
                    .filter(|entry| !candidate_keys.contains(&(record.path.as_str(), entry.position)))
                    .map(|entry| entry.note_id)
            })
            .collect();

        let filtered = filter_moves(candidates, created, &bound);
        for candidate in &filtered.released {
            report.released += self
                .store
                .remove_entries(&candidate.path, &[candidate.position]);
        }
        if !filtered.deferred.is_empty() {
            debug!(count = filtered.deferred.len(), "moved cards kept until a later run");
        }

        let ids: Vec<NoteId> = filtered
            .presented
            .iter()
            .map(|candidate| candidate.note_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        match self.remote.find_notes_by_ids(&ids).await {
            Ok(existing) => {
                for candidate in filtered.presented {
                    if existing.contains(&candidate.note_id) {
                        self.pending.push(candidate);
                    } else {
                        report.pruned += self
                            .store
                            .remove_entries(&candidate.path, &[candidate.position]);
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "could not verify orphaned notes, keeping them");
                report.issues.push(RunIssue::file(
                    self.root.display().to_string(),
                    IssueKind::from(&err),
                    format!("deletion check skipped: {err}"),
                ));
                report.halted |= self.remote.is_tripped();
            }
        }
        self.drop_empty_missing_records();
        report.orphaned = self.pending.len();
    }

    /// Removes records of files that no longer exist once nothing is left in them.
    fn drop_empty_missing_records(&mut self) {
        let empty: Vec<String> = self
            .store
            .records()
            .values()
            .filter(|record| record.entries.is_empty() && !self.exists(&record.path))
            .map(|record| record.path.clone())
            .collect();
        for path in empty {
            self.store.remove_record(&path);
        }
    }

    fn exists(&self, key: &str) -> bool {
        path_for_key(&self.root, key).is_ok_and(|path| path.is_file())
    }

    fn is_ignored(&self, key: &str) -> bool {
        path_for_key(&self.root, key)
            .is_ok_and(|path| self.ignore.iter().any(|skip| path.starts_with(skip)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
