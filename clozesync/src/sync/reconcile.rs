use std::collections::{HashMap, HashSet};

use clozesync_core::NoteId;

use super::fingerprint::Fingerprint;
use super::store::{CacheEntry, FileRecord};
use crate::extract::FlashcardUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    Create,
    Update(NoteId),
    Unchanged(NoteId),
    OrphanCandidate(NoteId),
}

impl SyncDecision {
    pub fn note_id(&self) -> Option<NoteId> {
        match *self {
            SyncDecision::Create => None,
            SyncDecision::Update(id)
            | SyncDecision::Unchanged(id)
            | SyncDecision::OrphanCandidate(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUnit {
    pub position: usize,
    pub fingerprint: Fingerprint,
    pub decision: SyncDecision,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// One plan per extracted unit, in extraction order.
    pub plans: Vec<PlannedUnit>,
    /// Prior entries with no unit at their position; always `OrphanCandidate`.
    pub orphans: Vec<PlannedUnit>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.orphans.is_empty()
            && self
                .plans
                .iter()
                .all(|plan| matches!(plan.decision, SyncDecision::Unchanged(_)))
    }
}

/// Content fingerprint of a unit: its front text plus attached picture names.
///
/// Tags and the heading breadcrumb (the note's Back Extra) are not part of
/// it. An edit that only changes tags or headings leaves every card
/// `Unchanged`, so the remote note keeps its old tags and Back Extra until
/// the card text itself changes.
pub fn fingerprint(unit: &FlashcardUnit) -> Fingerprint {
    if unit.pictures.is_empty() {
        return Fingerprint::of(&unit.content);
    }
    let mut input = unit.content.clone();
    for picture in &unit.pictures {
        input.push('\n');
        input.push_str(&picture.filename);
    }
    Fingerprint::of(&input)
}

/// Matches fresh units against the prior record by position key.
///
/// Matching is ordinal: inserting a card above existing ones shifts every
/// later position, which shows up as a run of `Update`s rather than a single
/// `Create`.
pub fn reconcile(units: &[FlashcardUnit], prior: Option<&FileRecord>) -> Reconciliation {
    let lookup: HashMap<usize, &CacheEntry> = prior
        .map(|record| {
            record
                .entries
                .iter()
                .map(|entry| (entry.position, entry))
                .collect()
        })
        .unwrap_or_default();

    let mut visited = HashSet::with_capacity(units.len());
    let plans: Vec<PlannedUnit> = units
        .iter()
        .map(|unit| {
            let fingerprint = fingerprint(unit);
            let decision = match lookup.get(&unit.position) {
                None => SyncDecision::Create,
                Some(entry) if entry.fingerprint == fingerprint => {
                    SyncDecision::Unchanged(entry.note_id)
                }
                Some(entry) => SyncDecision::Update(entry.note_id),
            };
            visited.insert(unit.position);
            PlannedUnit {
                position: unit.position,
                fingerprint,
                decision,
            }
        })
        .collect();

    let orphans = prior
        .map(|record| {
            record
                .entries
                .iter()
                .filter(|entry| !visited.contains(&entry.position))
                .map(|entry| PlannedUnit {
                    position: entry.position,
                    fingerprint: entry.fingerprint.clone(),
                    decision: SyncDecision::OrphanCandidate(entry.note_id),
                })
                .collect()
        })
        .unwrap_or_default();

    Reconciliation { plans, orphans }
}

/// Rebuilds a record from ids already embedded in the source, for files the
/// store knows nothing about. Fingerprints are unknown, so every recovered
/// unit reconciles as `Update` and the remote note is refreshed in place.
/// An id embedded twice is only claimed by its first occurrence.
pub fn record_from_markers(path: &str, units: &[FlashcardUnit]) -> Option<FileRecord> {
    let mut claimed = HashSet::new();
    let entries: Vec<CacheEntry> = units
        .iter()
        .filter_map(|unit| {
            let id = unit.embedded_id()?;
            claimed.insert(id).then(|| CacheEntry {
                position: unit.position,
                fingerprint: Fingerprint::unknown(),
                note_id: id,
                seen: false,
            })
        })
        .collect();
    if entries.is_empty() {
        return None;
    }
    let mut record = FileRecord::new(path);
    record.entries = entries;
    Some(record)
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
