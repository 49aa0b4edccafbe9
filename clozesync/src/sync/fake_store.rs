use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use clozesync_core::NoteId;

use super::remote::{CreatedNote, DuplicatePolicy, NoteContent, NoteStore, RemoteError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(String),
    Update(NoteId),
    Delete(Vec<NoteId>),
    Find(Vec<NoteId>),
}

#[derive(Default)]
struct State {
    next_id: u64,
    notes: BTreeMap<NoteId, NoteContent>,
    calls: Vec<Call>,
    unavailable: bool,
    fail_next: u32,
    create_failures: Vec<(String, RemoteError)>,
}

/// In-memory remote store that records every call. Like the real store, a
/// note is a duplicate when its deck and text match an existing one; with
/// [`DuplicatePolicy::Reuse`] the existing id comes back marked as reused.
pub struct RecordingNoteStore {
    state: Mutex<State>,
}

impl RecordingNoteStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1_700_000_000_000,
                ..State::default()
            }),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn fail_next_unavailable(&self, count: u32) {
        self.state.lock().unwrap().fail_next = count;
    }

    pub fn fail_creates_containing(&self, needle: &str, error: RemoteError) {
        self.state
            .lock()
            .unwrap()
            .create_failures
            .push((needle.to_string(), error));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.create_failures.clear();
        state.unavailable = false;
        state.fail_next = 0;
    }

    /// Drops a note behind the engine's back.
    pub fn forget(&self, id: NoteId) {
        self.state.lock().unwrap().notes.remove(&id);
    }

    pub fn note(&self, id: NoteId) -> Option<NoteContent> {
        self.state.lock().unwrap().notes.get(&id).cloned()
    }

    pub fn notes(&self) -> BTreeMap<NoteId, NoteContent> {
        self.state.lock().unwrap().notes.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn create_calls(&self) -> usize {
        self.count(|call| matches!(call, Call::Create(_)))
    }

    pub fn update_calls(&self) -> usize {
        self.count(|call| matches!(call, Call::Update(_)))
    }

    pub fn delete_calls(&self) -> usize {
        self.count(|call| matches!(call, Call::Delete(_)))
    }

    pub fn mutating_calls(&self) -> usize {
        self.create_calls() + self.update_calls() + self.delete_calls()
    }

    fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }
}

impl State {
    fn check_available(&mut self) -> Result<(), RemoteError> {
        if self.unavailable {
            return Err(RemoteError::Unavailable("connection refused".to_string()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(RemoteError::Unavailable("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NoteStore for RecordingNoteStore {
    async fn create_note(
        &self,
        note: &NoteContent,
        duplicates: DuplicatePolicy,
    ) -> Result<CreatedNote, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create(note.text.clone()));
        state.check_available()?;
        if let Some((_, error)) = state
            .create_failures
            .iter()
            .find(|(needle, _)| note.text.contains(needle.as_str()))
        {
            return Err(error.clone());
        }
        let existing = state
            .notes
            .iter()
            .find(|(_, existing)| existing.deck == note.deck && existing.text == note.text)
            .map(|(id, _)| *id);
        if let Some(id) = existing
            && duplicates == DuplicatePolicy::Reuse
        {
            return Ok(CreatedNote { id, reused: true });
        }
        state.next_id += 1;
        let id = NoteId(state.next_id);
        state.notes.insert(id, note.clone());
        Ok(CreatedNote { id, reused: false })
    }

    async fn update_note_fields(&self, id: NoteId, note: &NoteContent) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Update(id));
        state.check_available()?;
        match state.notes.get_mut(&id) {
            Some(existing) => {
                *existing = note.clone();
                Ok(())
            }
            None => Err(RemoteError::NotFound(id)),
        }
    }

    async fn delete_notes(&self, ids: &[NoteId]) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Delete(ids.to_vec()));
        state.check_available()?;
        for id in ids {
            state.notes.remove(id);
        }
        Ok(())
    }

    async fn find_notes_by_ids(&self, ids: &[NoteId]) -> Result<HashSet<NoteId>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Find(ids.to_vec()));
        state.check_available()?;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| state.notes.contains_key(id))
            .collect())
    }
}
