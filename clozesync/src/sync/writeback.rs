use std::io;
use std::path::{Path, PathBuf};

use clozesync_core::NoteId;
use thiserror::Error;
use tracing::debug;

use super::paths::replace_file;
use crate::extract::{Anchor, MARKER_PREFIX, MARKER_SUFFIX};

#[derive(Debug, Error)]
pub enum WriteBackError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("{path} changed during the run; ids were not written back")]
    Changed { path: PathBuf },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Copy)]
pub struct MarkerEdit<'a> {
    pub anchor: &'a Anchor,
    pub note_id: NoteId,
}

enum Splice {
    Insert(usize, String),
    Replace(std::ops::Range<usize>, String),
}

impl Splice {
    fn offset(&self) -> usize {
        match self {
            Splice::Insert(at, _) => *at,
            Splice::Replace(range, _) => range.start,
        }
    }
}

/// Inserts or rewrites `<!--NoteID:…-->` markers. Markers already carrying
/// the right id are left alone, so applying the same edits twice is a no-op.
/// Returns `None` when nothing changes.
pub fn apply_markers(source: &str, edits: &[MarkerEdit<'_>]) -> Option<String> {
    let mut splices: Vec<Splice> = edits
        .iter()
        .filter_map(|edit| match &edit.anchor.marker {
            Some(marker) if marker.id == edit.note_id => None,
            Some(marker) => Some(Splice::Replace(
                marker.digits.clone(),
                edit.note_id.to_string(),
            )),
            None => {
                let newline = if edit.anchor.crlf { "\r\n" } else { "\n" };
                Some(Splice::Insert(
                    edit.anchor.insert_at,
                    format!("{newline}{MARKER_PREFIX}{}{MARKER_SUFFIX}", edit.note_id),
                ))
            }
        })
        .collect();
    if splices.is_empty() {
        return None;
    }
    splices.sort_by_key(|splice| std::cmp::Reverse(splice.offset()));

    let mut out = source.to_string();
    for splice in splices {
        match splice {
            Splice::Insert(at, text) => out.insert_str(at, &text),
            Splice::Replace(range, text) => out.replace_range(range, &text),
        }
    }
    Some(out)
}

/// Applies `edits` to the file at `path`, provided it still holds `original`.
/// Returns the new contents when the file was rewritten.
pub fn write_back(
    path: &Path,
    original: &str,
    edits: &[MarkerEdit<'_>],
) -> Result<Option<String>, WriteBackError> {
    let Some(updated) = apply_markers(original, edits) else {
        return Ok(None);
    };
    let current = std::fs::read(path).map_err(|source| WriteBackError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if current != original.as_bytes() {
        return Err(WriteBackError::Changed {
            path: path.to_path_buf(),
        });
    }
    replace_file(path, updated.as_bytes()).map_err(|source| WriteBackError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), markers = edits.len(), "ids written back");
    Ok(Some(updated))
}
