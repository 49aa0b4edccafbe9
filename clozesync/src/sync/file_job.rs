use std::collections::BTreeSet;
use std::sync::Arc;

use clozesync_core::NoteId;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::claims::{IdClaims, UnitKey};
use super::fingerprint::{Fingerprint, content_hash};
use super::orphan::OrphanCandidate;
use super::queue::RemoteQueue;
use super::reconcile::{SyncDecision, reconcile, record_from_markers};
use super::remote::{NoteContent, RemoteError};
use super::report::{IssueKind, RunIssue};
use super::store::FileRecord;
use super::writeback::{MarkerEdit, write_back};
use crate::deck::DeckRouter;
use crate::extract::{Anchor, ContentExtractor, FlashcardUnit, SourceFile};
use crate::render::RenderService;

/// A remote call that succeeded; the orchestrator commits it to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConfirmedEntry {
    pub path: String,
    pub position: usize,
    pub fingerprint: Fingerprint,
    pub note_id: NoteId,
}

/// Shared, read-only state handed to every file worker.
pub(crate) struct WorkerContext {
    pub remote: Arc<RemoteQueue>,
    pub extractor: Arc<dyn ContentExtractor>,
    /// Already limited to the run's render concurrency.
    pub renderer: Arc<dyn RenderService>,
    pub router: Arc<DeckRouter>,
    pub claims: Arc<IdClaims>,
    /// Whether a matching whole-file hash lets the file skip extraction.
    pub reuse_hash: bool,
    pub commits: UnboundedSender<ConfirmedEntry>,
}

pub(crate) struct FileJob {
    pub source: SourceFile,
    pub prior: Option<FileRecord>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FileStatus {
    /// Hash matched the stored one; nothing was extracted.
    Skipped,
    /// Extracted and synced. `content_hash` is `None` when some unit failed
    /// or cached cards went missing, so the file is looked at again next run.
    Processed { content_hash: Option<String> },
    /// Unreadable or unparsable; the record is left as it was.
    Failed,
}

#[derive(Debug)]
pub(crate) struct FileOutcome {
    pub path: String,
    pub status: FileStatus,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub issues: Vec<RunIssue>,
    pub orphans: Vec<OrphanCandidate>,
    /// Fingerprints created in this file and the ids they received.
    pub created_notes: Vec<(Fingerprint, NoteId)>,
    pub halted: bool,
}

impl FileOutcome {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            status: FileStatus::Failed,
            created: 0,
            updated: 0,
            unchanged: 0,
            issues: Vec::new(),
            orphans: Vec::new(),
            created_notes: Vec::new(),
            halted: false,
        }
    }

    fn fail(mut self, kind: IssueKind, message: String) -> Self {
        warn!(path = %self.path, kind = kind.as_str(), %message, "file skipped");
        self.issues.push(RunIssue::file(self.path.as_str(), kind, message));
        self.status = FileStatus::Failed;
        self
    }
}

pub(crate) async fn process_file(ctx: Arc<WorkerContext>, job: FileJob) -> FileOutcome {
    let FileJob { source, prior } = job;
    let outcome = FileOutcome::new(&source.key);

    let bytes = match tokio::fs::read(&source.absolute).await {
        Ok(bytes) => bytes,
        Err(err) => return outcome.fail(IssueKind::Io, err.to_string()),
    };
    let stored_hash = prior.as_ref().and_then(|record| record.content_hash.as_deref());
    if ctx.reuse_hash && stored_hash == Some(content_hash(&bytes).as_str()) {
        debug!(path = %source.key, "unchanged, skipping extraction");
        return FileOutcome {
            status: FileStatus::Skipped,
            ..outcome
        };
    }

    let extractor = ctx.extractor.clone();
    let renderer = ctx.renderer.clone();
    let blocking_source = source.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let result = extractor.extract(&blocking_source, &bytes, renderer.as_ref());
        (result, bytes)
    })
    .await;
    let (bytes, extraction) = match joined {
        Ok((Ok(extraction), bytes)) => (bytes, extraction),
        Ok((Err(err), _)) => return outcome.fail(IssueKind::Parse, err.to_string()),
        Err(err) => return outcome.fail(IssueKind::Io, format!("extraction task failed: {err}")),
    };
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => return outcome.fail(IssueKind::Parse, err.to_string()),
    };

    sync_units(&ctx, source, prior, text, extraction.units, outcome).await
}

async fn sync_units(
    ctx: &WorkerContext,
    source: SourceFile,
    prior: Option<FileRecord>,
    text: String,
    units: Vec<FlashcardUnit>,
    mut outcome: FileOutcome,
) -> FileOutcome {
    let key = source.key.as_str();
    let mut failed = false;
    for unit in &units {
        for message in &unit.render_issues {
            outcome.issues.push(RunIssue::unit(
                key,
                unit.position,
                IssueKind::ExternalTool,
                message.as_str(),
            ));
            failed = true;
        }
    }

    let prior = prior.or_else(|| record_from_markers(key, &units));
    let reconciliation = reconcile(&units, prior.as_ref());
    outcome.orphans = reconciliation
        .orphans
        .iter()
        .filter_map(|orphan| {
            Some(OrphanCandidate {
                path: key.to_string(),
                position: orphan.position,
                fingerprint: orphan.fingerprint.clone(),
                note_id: orphan.decision.note_id()?,
            })
        })
        .collect();

    let mut edits: Vec<(Anchor, NoteId)> = Vec::new();
    for (unit, plan) in units.iter().zip(&reconciliation.plans) {
        let unit_key = UnitKey::new(key, unit.position);
        let confirm = |note_id: NoteId| {
            ctx.claims.claim(note_id, &unit_key);
            let _ = ctx.commits.send(ConfirmedEntry {
                path: key.to_string(),
                position: unit.position,
                fingerprint: plan.fingerprint.clone(),
                note_id,
            });
        };
        let result = match plan.decision {
            SyncDecision::Unchanged(id) => {
                confirm(id);
                outcome.unchanged += 1;
                Ok(id)
            }
            SyncDecision::Update(id) => {
                let content = note_content(ctx, key, unit);
                match ctx.remote.update_note_fields(id, &content).await {
                    Ok(()) => {
                        confirm(id);
                        outcome.updated += 1;
                        Ok(id)
                    }
                    Err(RemoteError::NotFound(stale)) => {
                        info!(path = key, position = unit.position, note_id = %stale, "note vanished remotely, recreating");
                        ctx.remote
                            .create_note(&content, &unit_key, &ctx.claims)
                            .await
                            .inspect(|&new_id| {
                                confirm(new_id);
                                outcome.created += 1;
                                outcome.created_notes.push((plan.fingerprint.clone(), new_id));
                            })
                    }
                    Err(err) => Err(err),
                }
            }
            SyncDecision::Create => {
                let content = note_content(ctx, key, unit);
                ctx.remote
                    .create_note(&content, &unit_key, &ctx.claims)
                    .await
                    .inspect(|&new_id| {
                        confirm(new_id);
                        outcome.created += 1;
                        outcome.created_notes.push((plan.fingerprint.clone(), new_id));
                    })
            }
            SyncDecision::OrphanCandidate(_) => continue,
        };
        match result {
            Ok(id) => edits.push((unit.anchor.clone(), id)),
            Err(err) => {
                failed = true;
                warn!(path = key, position = unit.position, error = %err, "card not synced");
                outcome
                    .issues
                    .push(RunIssue::unit(key, unit.position, IssueKind::from(&err), err.to_string()));
                if ctx.remote.is_tripped() {
                    outcome.halted = true;
                    break;
                }
            }
        }
    }

    let absolute = source.absolute.clone();
    let written = tokio::task::spawn_blocking(move || {
        let marker_edits: Vec<MarkerEdit<'_>> = edits
            .iter()
            .map(|(anchor, note_id)| MarkerEdit {
                anchor,
                note_id: *note_id,
            })
            .collect();
        let result = write_back(&absolute, &text, &marker_edits);
        (result, text)
    })
    .await;
    let final_text = match written {
        Ok((Ok(Some(updated)), _)) => Some(updated),
        Ok((Ok(None), original)) => Some(original),
        Ok((Err(err), _)) => {
            outcome
                .issues
                .push(RunIssue::file(key, IssueKind::WriteBack, err.to_string()));
            None
        }
        Err(err) => {
            outcome.issues.push(RunIssue::file(
                key,
                IssueKind::WriteBack,
                format!("write-back task failed: {err}"),
            ));
            None
        }
    };
    if final_text.is_none() {
        failed = true;
    }

    let content_hash = match final_text {
        Some(text) if !failed && outcome.orphans.is_empty() => {
            Some(content_hash(text.as_bytes()))
        }
        _ => None,
    };
    debug!(
        path = key,
        created = outcome.created,
        updated = outcome.updated,
        unchanged = outcome.unchanged,
        "file synced"
    );
    outcome.status = FileStatus::Processed { content_hash };
    outcome
}

fn note_content(ctx: &WorkerContext, key: &str, unit: &FlashcardUnit) -> NoteContent {
    NoteContent {
        deck: ctx.router.resolve(key, &unit.tags),
        text: unit.content.clone(),
        back_extra: unit.context.clone(),
        tags: sorted_tags(&unit.tags),
        pictures: unit.pictures.clone(),
    }
}

fn sorted_tags(tags: &BTreeSet<String>) -> Vec<String> {
    tags.iter().cloned().collect()
}
