use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use clozesync_core::NoteId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::fingerprint::Fingerprint;
use super::paths::replace_file;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on cache {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("cache {path} is unreadable ({source}); rerun with --no-cache to rebuild it")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("cache {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
    #[error("failed to encode cache: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub position: usize,
    pub fingerprint: Fingerprint,
    pub note_id: NoteId,
    #[serde(default)]
    pub seen: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    /// `None` forces re-extraction on the next run.
    pub content_hash: Option<String>,
    pub last_seen: i64,
    /// Sorted by position, at most one entry per position.
    pub entries: Vec<CacheEntry>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_hash: None,
            last_seen: 0,
            entries: Vec::new(),
        }
    }

    pub fn entry(&self, position: usize) -> Option<&CacheEntry> {
        self.entries
            .binary_search_by_key(&position, |entry| entry.position)
            .ok()
            .map(|index| &self.entries[index])
    }

    fn upsert(&mut self, entry: CacheEntry) {
        match self
            .entries
            .binary_search_by_key(&entry.position, |existing| existing.position)
        {
            Ok(index) => self.entries[index] = entry,
            Err(index) => self.entries.insert(index, entry),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default)]
    root: Option<PathBuf>,
    #[serde(default)]
    files: BTreeMap<String, FileRecord>,
}

#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    root: Option<&'a Path>,
    files: &'a BTreeMap<String, FileRecord>,
}

/// Persisted map from vault path to [`FileRecord`]. Only the run orchestrator
/// mutates it; workers send it confirmed results.
#[derive(Debug, Default)]
pub struct FingerprintStore {
    location: Option<PathBuf>,
    /// Vault the records' paths are relative to.
    root: Option<PathBuf>,
    records: BTreeMap<String, FileRecord>,
}

impl FingerprintStore {
    /// A store that never touches disk; `persist` is a no-op.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Starts empty but persists to `location`, replacing whatever is there.
    pub fn empty_at(location: impl Into<PathBuf>) -> Self {
        Self {
            location: Some(location.into()),
            root: None,
            records: BTreeMap::new(),
        }
    }

    pub fn load(location: &Path) -> Result<Self, StoreError> {
        let bytes = match std::fs::read(location) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %location.display(), "no cache yet, starting empty");
                return Ok(Self::empty_at(location));
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: location.to_path_buf(),
                    source,
                });
            }
        };
        let document: StoreDocument =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: location.to_path_buf(),
                source,
            })?;
        if document.version != STORE_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path: location.to_path_buf(),
                version: document.version,
            });
        }
        Ok(Self {
            location: Some(location.to_path_buf()),
            root: document.root,
            records: document.files,
        })
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn set_root(&mut self, root: impl Into<PathBuf>) {
        self.root = Some(root.into());
    }

    pub fn records(&self) -> &BTreeMap<String, FileRecord> {
        &self.records
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    /// Records a remote note confirmed for `(path, position)`, replacing any
    /// previous entry at that position.
    pub fn commit_entry(
        &mut self,
        path: &str,
        position: usize,
        fingerprint: Fingerprint,
        note_id: NoteId,
    ) {
        self.record_mut(path).upsert(CacheEntry {
            position,
            fingerprint,
            note_id,
            seen: true,
        });
    }

    /// Returns how many entries were removed.
    pub fn remove_entries(&mut self, path: &str, positions: &[usize]) -> usize {
        let Some(record) = self.records.get_mut(path) else {
            return 0;
        };
        let before = record.entries.len();
        record
            .entries
            .retain(|entry| !positions.contains(&entry.position));
        before - record.entries.len()
    }

    pub fn remove_record(&mut self, path: &str) -> Option<FileRecord> {
        self.records.remove(path)
    }

    pub fn set_file_state(&mut self, path: &str, content_hash: Option<String>, seen_at: i64) {
        let record = self.record_mut(path);
        record.content_hash = content_hash;
        record.last_seen = seen_at;
    }

    pub fn clear_seen(&mut self) {
        for record in self.records.values_mut() {
            for entry in &mut record.entries {
                entry.seen = false;
            }
        }
    }

    pub fn mark_all_seen(&mut self, path: &str) {
        if let Some(record) = self.records.get_mut(path) {
            for entry in &mut record.entries {
                entry.seen = true;
            }
        }
    }

    /// Every `(path, position)` currently bound to `note_id`.
    pub fn owners_of(&self, note_id: NoteId) -> Vec<(String, usize)> {
        self.records
            .values()
            .flat_map(|record| {
                record
                    .entries
                    .iter()
                    .filter(move |entry| entry.note_id == note_id)
                    .map(move |entry| (record.path.clone(), entry.position))
            })
            .collect()
    }

    /// Writes the whole store to a sibling file and renames it into place.
    pub fn persist(&self) -> Result<(), StoreError> {
        let Some(location) = &self.location else {
            return Ok(());
        };
        let document = StoreDocumentRef {
            version: STORE_VERSION,
            root: self.root.as_deref(),
            files: &self.records,
        };
        let bytes = serde_json::to_vec_pretty(&document)?;
        replace_file(location, &bytes).map_err(|source| StoreError::Io {
            path: location.clone(),
            source,
        })?;
        debug!(
            path = %location.display(),
            files = self.records.len(),
            "cache persisted"
        );
        Ok(())
    }

    fn record_mut(&mut self, path: &str) -> &mut FileRecord {
        self.records
            .entry(path.to_string())
            .or_insert_with(|| FileRecord::new(path))
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
