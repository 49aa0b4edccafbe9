mod client;
mod note;

pub use client::{AnkiClient, AnkiError, ApiErrorClass};
pub use note::{NewNote, NoteId, NoteInfo, NoteUpdate, Picture};
