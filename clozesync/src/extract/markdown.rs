use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use clozesync_core::{NoteId, Picture};

use super::{
    Anchor, ContentExtractor, EmbeddedMarker, ExtractError, FileExtraction, FlashcardUnit,
    MARKER_PREFIX, MARKER_SUFFIX, SourceFile,
};
use crate::render::{RenderRequest, RenderService, Rendered, escape_cloze_braces, is_image_path};
use crate::sync::fingerprint::content_hash;

/// Obsidian-flavoured markdown: every line with a `==highlight==` is a cloze
/// card, headings build the breadcrumb, `#tags` apply to the whole file.
#[derive(Debug, Clone)]
pub struct MarkdownExtractor {
    root: PathBuf,
}

impl MarkdownExtractor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

struct Line<'a> {
    number: usize,
    start: usize,
    text: &'a str,
    crlf: bool,
}

impl ContentExtractor for MarkdownExtractor {
    fn extract(
        &self,
        source: &SourceFile,
        bytes: &[u8],
        renderer: &dyn RenderService,
    ) -> Result<FileExtraction, ExtractError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ExtractError::NotUtf8 {
            path: source.key.clone(),
        })?;
        let note_dir = source
            .absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let trail = path_trail(&source.key);
        let lines = split_lines(text);

        let mut headings: Vec<String> = Vec::new();
        let mut tags = BTreeSet::new();
        let mut units = Vec::new();
        let mut in_fence = false;
        let mut index = 0;
        while index < lines.len() {
            let line = &lines[index];
            index += 1;
            if line.text.trim_start().starts_with("```") {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }
            if line.text.contains("==") {
                let scan = CardScan {
                    root: &self.root,
                    note_dir: &note_dir,
                    renderer,
                    text: String::with_capacity(line.text.len() + 16),
                    pictures: Vec::new(),
                    issues: Vec::new(),
                    clozes: 0,
                    open: false,
                };
                let card = scan.run(line.text).map_err(|message| ExtractError::Parse {
                    path: source.key.clone(),
                    line: line.number,
                    message,
                })?;
                if card.clozes > 0 {
                    let marker = lines.get(index).and_then(parse_marker);
                    if marker.is_some() {
                        index += 1;
                    }
                    units.push(FlashcardUnit {
                        position: units.len(),
                        content: card.text,
                        context: breadcrumb(&trail, &headings),
                        tags: BTreeSet::new(),
                        pictures: card.pictures,
                        anchor: Anchor {
                            insert_at: line.start + line.text.len(),
                            crlf: line.crlf,
                            marker,
                        },
                        render_issues: card.issues,
                    });
                    continue;
                }
            }
            if let Some((level, title)) = heading(line.text) {
                set_heading(&mut headings, level, title);
                continue;
            }
            collect_tags(line.text, &mut tags);
        }

        for unit in &mut units {
            unit.tags = tags.clone();
        }
        Ok(FileExtraction {
            path: source.key.clone(),
            content_hash: content_hash(bytes),
            tags,
            units,
        })
    }
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    let file_crlf = text.contains("\r\n");
    let mut lines = Vec::new();
    let mut offset = 0;
    for (index, raw) in text.split_inclusive('\n').enumerate() {
        let (body, crlf) = if let Some(body) = raw.strip_suffix("\r\n") {
            (body, true)
        } else if let Some(body) = raw.strip_suffix('\n') {
            (body, false)
        } else {
            (raw, file_crlf)
        };
        lines.push(Line {
            number: index + 1,
            start: offset,
            text: body,
            crlf,
        });
        offset += raw.len();
    }
    lines
}

fn parse_marker(line: &Line<'_>) -> Option<EmbeddedMarker> {
    let digits = line
        .text
        .strip_prefix(MARKER_PREFIX)?
        .strip_suffix(MARKER_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let id = digits.parse::<u64>().ok()?;
    let start = line.start + MARKER_PREFIX.len();
    Some(EmbeddedMarker {
        id: NoteId(id),
        digits: start..start + digits.len(),
    })
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let level = line.len() - line.trim_start_matches('#').len();
    if level == 0 {
        return None;
    }
    let title = line[level..].strip_prefix(' ')?;
    Some((level, title.trim()))
}

fn set_heading(headings: &mut Vec<String>, level: usize, title: &str) {
    headings.truncate(level - 1);
    headings.resize(level - 1, String::new());
    headings.push(title.to_string());
}

fn collect_tags(line: &str, tags: &mut BTreeSet<String>) {
    let mut in_code = false;
    let mut previous: Option<char> = None;
    for (index, ch) in line.char_indices() {
        if ch == '`' {
            in_code = !in_code;
        } else if !in_code && ch == '#' && previous.is_none_or(char::is_whitespace) {
            let tail = &line[index + 1..];
            let end = tail
                .find(|c: char| c.is_whitespace() || c == '#')
                .unwrap_or(tail.len());
            if end > 0 {
                tags.insert(tail[..end].to_string());
            }
        }
        previous = Some(ch);
    }
}

fn path_trail(key: &str) -> String {
    let trimmed = key.strip_suffix(".md").unwrap_or(key);
    trimmed.split('/').collect::<Vec<_>>().join(" > ")
}

fn breadcrumb(trail: &str, headings: &[String]) -> String {
    let mut out = trail.to_string();
    for heading in headings.iter().filter(|heading| !heading.is_empty()) {
        let _ = write!(out, " > {heading}");
    }
    out
}

struct ScannedCard {
    text: String,
    pictures: Vec<Picture>,
    issues: Vec<String>,
    clozes: u32,
}

struct CardScan<'a> {
    root: &'a Path,
    note_dir: &'a Path,
    renderer: &'a dyn RenderService,
    text: String,
    pictures: Vec<Picture>,
    issues: Vec<String>,
    clozes: u32,
    open: bool,
}

impl CardScan<'_> {
    fn run(mut self, line: &str) -> Result<ScannedCard, String> {
        let mut rest = line;
        while let Some(ch) = rest.chars().next() {
            if let Some(after) = rest.strip_prefix('`') {
                if let Some(end) = after.find('`') {
                    self.text.push_str(&rest[..end + 2]);
                    rest = &after[end + 1..];
                    continue;
                }
            } else if let Some(after) = rest.strip_prefix("$$") {
                let end = after
                    .find("$$")
                    .ok_or_else(|| "unterminated $$ math".to_string())?;
                self.math(&after[..end], true);
                rest = &after[end + 2..];
                continue;
            } else if let Some(after) = rest.strip_prefix('$') {
                let end = after
                    .find('$')
                    .ok_or_else(|| "unterminated $ math".to_string())?;
                self.math(&after[..end], false);
                rest = &after[end + 1..];
                continue;
            } else if let Some(after) = rest.strip_prefix("![[") {
                if let Some(end) = after.find("]]") {
                    self.link(&after[..end], true);
                    rest = &after[end + 2..];
                    continue;
                }
            } else if let Some(after) = rest.strip_prefix("[[") {
                if let Some(end) = after.find("]]") {
                    self.link(&after[..end], false);
                    rest = &after[end + 2..];
                    continue;
                }
            } else if let Some(after) = rest.strip_prefix("==") {
                if self.open {
                    self.text.push_str("}}");
                } else {
                    self.clozes += 1;
                    let _ = write!(self.text, "{{{{c{}::", self.clozes);
                }
                self.open = !self.open;
                rest = after;
                continue;
            }
            self.text.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
        if self.open {
            return Err("unterminated == highlight".to_string());
        }
        Ok(ScannedCard {
            text: self.text,
            pictures: self.pictures,
            issues: self.issues,
            clozes: self.clozes,
        })
    }

    fn math(&mut self, source: &str, display: bool) {
        let request = if display {
            RenderRequest::DisplayMath(source)
        } else {
            RenderRequest::InlineMath(source)
        };
        match self.renderer.render(&request) {
            Ok(Rendered::Text(text)) => self.text.push_str(&text),
            Ok(Rendered::Picture(picture)) => self.pictures.push(picture),
            Err(err) => {
                let delimiter = if display { "$$" } else { "$" };
                self.text.push_str(&escape_cloze_braces(&format!(
                    "{delimiter}{source}{delimiter}"
                )));
                self.issues.push(format!("math `{source}`: {err}"));
            }
        }
    }

    fn link(&mut self, inner: &str, embedded: bool) {
        let (target, alias) = match inner.split_once('|') {
            Some((target, alias)) => (target, Some(alias)),
            None => (inner, None),
        };
        if embedded && let Some(path) = self.resolve_image(target) {
            match self.renderer.render(&RenderRequest::Image {
                path: &path,
                name: target,
            }) {
                Ok(Rendered::Picture(picture)) => {
                    self.pictures.push(picture);
                    return;
                }
                Ok(Rendered::Text(text)) => {
                    self.text.push_str(&text);
                    return;
                }
                Err(err) => self.issues.push(format!("image {target}: {err}")),
            }
        }
        self.text.push_str(alias.unwrap_or(target));
    }

    fn resolve_image(&self, target: &str) -> Option<PathBuf> {
        let relative = Path::new(target);
        if !is_image_path(relative) {
            return None;
        }
        [self.note_dir.join(relative), self.root.join(relative)]
            .into_iter()
            .find(|candidate| candidate.is_file())
    }
}

#[cfg(test)]
#[path = "markdown_tests.rs"]
mod tests;
