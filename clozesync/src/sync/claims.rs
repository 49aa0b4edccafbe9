use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use clozesync_core::NoteId;
use tracing::debug;

use super::paths::path_for_key;
use super::store::FingerprintStore;
use crate::extract::{MARKER_PREFIX, MARKER_SUFFIX};

/// A card slot: vault path plus position within the file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitKey {
    pub path: String,
    pub position: usize,
}

impl UnitKey {
    pub fn new(path: impl Into<String>, position: usize) -> Self {
        Self {
            path: path.into(),
            position,
        }
    }
}

/// Tracks which card holds each note id during one run, so a create that the
/// remote store resolves to an existing note never binds two live cards to
/// the same id.
pub struct IdClaims {
    root: PathBuf,
    prior: HashMap<NoteId, Vec<UnitKey>>,
    claimed: Mutex<HashMap<NoteId, UnitKey>>,
}

impl IdClaims {
    /// Seeds prior ownership from the store as it was when the run started.
    pub fn new(root: impl Into<PathBuf>, store: &FingerprintStore) -> Self {
        let mut prior: HashMap<NoteId, Vec<UnitKey>> = HashMap::new();
        for record in store.records().values() {
            for entry in &record.entries {
                prior
                    .entry(entry.note_id)
                    .or_default()
                    .push(UnitKey::new(record.path.as_str(), entry.position));
            }
        }
        Self {
            root: root.into(),
            prior,
            claimed: Mutex::new(HashMap::new()),
        }
    }

    /// Records that `key` holds `id` for the rest of the run. The first claim
    /// wins.
    pub fn claim(&self, id: NoteId, key: &UnitKey) {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| key.clone());
    }

    /// Whether a card other than `key` still holds `id`: either it claimed
    /// the id earlier in this run, or its file still carries the id's marker.
    /// A previous owner whose marker is gone has moved away and does not count.
    pub fn held_elsewhere(&self, id: NoteId, key: &UnitKey) -> bool {
        let claimed_by = self
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        if let Some(owner) = claimed_by {
            return owner != *key;
        }
        let marker = format!("{MARKER_PREFIX}{id}{MARKER_SUFFIX}");
        self.prior
            .get(&id)
            .into_iter()
            .flatten()
            .filter(|owner| *owner != key)
            .any(|owner| {
                let live = path_for_key(&self.root, &owner.path)
                    .ok()
                    .and_then(|path| std::fs::read_to_string(path).ok())
                    .is_some_and(|text| text.contains(&marker));
                if live {
                    debug!(note_id = %id, path = %owner.path, position = owner.position, "note still marked in its file");
                }
                live
            })
    }
}
