mod markdown;

use std::collections::BTreeSet;
use std::ops::Range;
use std::path::PathBuf;

use clozesync_core::{NoteId, Picture};
use thiserror::Error;

use crate::render::RenderService;

pub use markdown::MarkdownExtractor;

pub const MARKER_PREFIX: &str = "<!--NoteID:";
pub const MARKER_SUFFIX: &str = "-->";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{path}:{line}: {message}")]
    Parse {
        path: String,
        line: usize,
        message: String,
    },
    #[error("{path} is not valid UTF-8")]
    NotUtf8 { path: String },
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Vault-relative key, `/` separated.
    pub key: String,
    pub absolute: PathBuf,
}

/// A `<!--NoteID:…-->` marker already present after a card line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedMarker {
    pub id: NoteId,
    /// Byte range of the digits in the source file.
    pub digits: Range<usize>,
}

/// Where a card's marker lives, or would be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    /// Byte offset just past the card line's text, before its line ending.
    pub insert_at: usize,
    pub crlf: bool,
    pub marker: Option<EmbeddedMarker>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashcardUnit {
    /// Ordinal of the card within its file.
    pub position: usize,
    /// Front text with cloze deletions, after math and image rendering.
    pub content: String,
    /// Breadcrumb of path segments and headings, sent as back extra.
    pub context: String,
    pub tags: BTreeSet<String>,
    pub pictures: Vec<Picture>,
    pub anchor: Anchor,
    /// Render failures that fell back to raw source.
    pub render_issues: Vec<String>,
}

impl FlashcardUnit {
    pub fn embedded_id(&self) -> Option<NoteId> {
        self.anchor.marker.as_ref().map(|marker| marker.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExtraction {
    pub path: String,
    pub content_hash: String,
    pub tags: BTreeSet<String>,
    pub units: Vec<FlashcardUnit>,
}

pub trait ContentExtractor: Send + Sync {
    fn extract(
        &self,
        source: &SourceFile,
        bytes: &[u8],
        renderer: &dyn RenderService,
    ) -> Result<FileExtraction, ExtractError>;
}
