use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const CLOZE_MODEL: &str = "Cloze";
pub const TEXT_FIELD: &str = "Text";
pub const BACK_EXTRA_FIELD: &str = "Back Extra";

/// Millisecond creation timestamp assigned by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(pub u64);

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Picture {
    pub path: PathBuf,
    pub filename: String,
    pub fields: Vec<String>,
}

impl Picture {
    pub fn on_back(path: PathBuf, filename: impl Into<String>) -> Self {
        Self {
            path,
            filename: filename.into(),
            fields: vec![BACK_EXTRA_FIELD.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct NoteOptions {
    allow_duplicate: bool,
    duplicate_scope: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNote {
    pub deck_name: String,
    pub model_name: String,
    pub fields: BTreeMap<String, String>,
    options: NoteOptions,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub picture: Vec<Picture>,
}

impl NewNote {
    pub fn cloze(
        deck: impl Into<String>,
        text: impl Into<String>,
        back_extra: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            deck_name: deck.into(),
            model_name: CLOZE_MODEL.to_string(),
            fields: cloze_fields(text.into(), back_extra.into()),
            options: NoteOptions {
                allow_duplicate: false,
                duplicate_scope: "deck",
            },
            tags,
            picture: Vec::new(),
        }
    }

    pub fn with_pictures(mut self, pictures: Vec<Picture>) -> Self {
        self.picture = pictures;
        self
    }

    /// Lets the remote store accept this note even when its deck already
    /// holds one with the same `Text`.
    pub fn allowing_duplicates(mut self) -> Self {
        self.options.allow_duplicate = true;
        self
    }

    /// Search query for the note the remote store considers a duplicate of
    /// this one: same deck, same model, same first field.
    pub fn duplicate_query(&self) -> String {
        let mut out = format!(
            "deck:\"{}\" note:\"{}\"",
            escape_query(&self.deck_name),
            escape_query(&self.model_name)
        );
        if let Some(text) = self.fields.get(TEXT_FIELD) {
            let _ = write!(out, " \"{TEXT_FIELD}:{}\"", escape_query(text).replace(':', "\\:"));
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NoteUpdate {
    pub id: NoteId,
    pub fields: BTreeMap<String, String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub picture: Vec<Picture>,
}

impl NoteUpdate {
    pub fn cloze(
        id: NoteId,
        text: impl Into<String>,
        back_extra: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            id,
            fields: cloze_fields(text.into(), back_extra.into()),
            tags,
            picture: Vec::new(),
        }
    }

    pub fn with_pictures(mut self, pictures: Vec<Picture>) -> Self {
        self.picture = pictures;
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NoteInfo {
    #[serde(default)]
    pub note_id: Option<NoteId>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn cloze_fields(text: String, back_extra: String) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TEXT_FIELD.to_string(), text),
        (BACK_EXTRA_FIELD.to_string(), back_extra),
    ])
}

fn escape_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '"' | '*' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
