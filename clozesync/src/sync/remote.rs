use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use clozesync_core::{AnkiClient, AnkiError, ApiErrorClass, NewNote, NoteId, NoteUpdate, Picture};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote store rejected the request: {0}")]
    Rejected(String),
    #[error("note {0} no longer exists in the remote store")]
    NotFound(NoteId),
}

/// Everything the remote store receives for one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteContent {
    pub deck: String,
    pub text: String,
    pub back_extra: String,
    pub tags: Vec<String>,
    pub pictures: Vec<Picture>,
}

/// What a create does when the deck already holds a note with the same text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Return the existing note instead of creating one.
    Reuse,
    /// Create a distinct note anyway.
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedNote {
    pub id: NoteId,
    /// Set when `id` is a note that already existed.
    pub reused: bool,
}

#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn create_note(
        &self,
        note: &NoteContent,
        duplicates: DuplicatePolicy,
    ) -> Result<CreatedNote, RemoteError>;

    /// Fails with [`RemoteError::NotFound`] when `id` is gone remotely.
    async fn update_note_fields(&self, id: NoteId, note: &NoteContent) -> Result<(), RemoteError>;

    /// Best effort: ids that no longer exist are not an error.
    async fn delete_notes(&self, ids: &[NoteId]) -> Result<(), RemoteError>;

    async fn find_notes_by_ids(&self, ids: &[NoteId]) -> Result<HashSet<NoteId>, RemoteError>;
}

/// [`NoteStore`] backed by AnkiConnect.
pub struct AnkiConnectStore {
    client: AnkiClient,
    ensured_decks: Mutex<HashSet<String>>,
}

impl AnkiConnectStore {
    pub fn new(client: AnkiClient) -> Self {
        Self {
            client,
            ensured_decks: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_deck(&self, deck: &str) -> Result<(), RemoteError> {
        let known = self
            .ensured_decks
            .lock()
            .map(|decks| decks.contains(deck))
            .unwrap_or(false);
        if known {
            return Ok(());
        }
        self.client
            .create_deck(deck)
            .await
            .map_err(|err| remote_error(err, None))?;
        if let Ok(mut decks) = self.ensured_decks.lock() {
            decks.insert(deck.to_string());
        }
        debug!(deck, "deck ensured");
        Ok(())
    }
}

#[async_trait]
impl NoteStore for AnkiConnectStore {
    async fn create_note(
        &self,
        note: &NoteContent,
        duplicates: DuplicatePolicy,
    ) -> Result<CreatedNote, RemoteError> {
        self.ensure_deck(&note.deck).await?;
        let mut request = NewNote::cloze(
            note.deck.as_str(),
            note.text.as_str(),
            note.back_extra.as_str(),
            note.tags.clone(),
        )
        .with_pictures(note.pictures.clone());
        if duplicates == DuplicatePolicy::Allow {
            request = request.allowing_duplicates();
        }
        match self.client.add_note(&request).await {
            Ok(id) => Ok(CreatedNote { id, reused: false }),
            Err(err) if err.classification() == ApiErrorClass::Duplicate => {
                let query = request.duplicate_query();
                let existing = self
                    .client
                    .find_notes(&query)
                    .await
                    .map_err(|err| remote_error(err, None))?;
                match existing.first() {
                    Some(&id) => {
                        info!(note_id = %id, deck = %note.deck, "reusing existing duplicate note");
                        Ok(CreatedNote { id, reused: true })
                    }
                    None => Err(RemoteError::Rejected(err.to_string())),
                }
            }
            Err(err) => Err(remote_error(err, None)),
        }
    }

    async fn update_note_fields(&self, id: NoteId, note: &NoteContent) -> Result<(), RemoteError> {
        let request = NoteUpdate::cloze(
            id,
            note.text.as_str(),
            note.back_extra.as_str(),
            note.tags.clone(),
        )
        .with_pictures(note.pictures.clone());
        self.client
            .update_note(&request)
            .await
            .map_err(|err| remote_error(err, Some(id)))
    }

    async fn delete_notes(&self, ids: &[NoteId]) -> Result<(), RemoteError> {
        match self.client.delete_notes(ids).await {
            Ok(()) => Ok(()),
            Err(err) if err.classification() == ApiErrorClass::NotFound => {
                debug!(error = %err, "some notes were already deleted remotely");
                Ok(())
            }
            Err(err) => Err(remote_error(err, None)),
        }
    }

    async fn find_notes_by_ids(&self, ids: &[NoteId]) -> Result<HashSet<NoteId>, RemoteError> {
        let infos = self
            .client
            .notes_info(ids)
            .await
            .map_err(|err| remote_error(err, None))?;
        let requested: HashSet<NoteId> = ids.iter().copied().collect();
        Ok(infos
            .into_iter()
            .filter_map(|info| info.note_id)
            .filter(|id| requested.contains(id))
            .collect())
    }
}

fn remote_error(err: AnkiError, id: Option<NoteId>) -> RemoteError {
    match (err.classification(), id) {
        (ApiErrorClass::Unavailable, _) => RemoteError::Unavailable(err.to_string()),
        (ApiErrorClass::NotFound, Some(id)) => RemoteError::NotFound(id),
        _ => RemoteError::Rejected(err.to_string()),
    }
}
