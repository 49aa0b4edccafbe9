use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clozesync_core::NoteId;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::backoff::Backoff;
use super::claims::{IdClaims, UnitKey};
use super::remote::{DuplicatePolicy, NoteContent, NoteStore, RemoteError};

/// Single-flight gate in front of the remote store, shared by all workers.
///
/// Unavailable failures are retried with backoff. Once a call exhausts its
/// attempts the queue trips and every later call fails immediately.
pub struct RemoteQueue {
    store: Arc<dyn NoteStore>,
    gate: Semaphore,
    backoff: Backoff,
    max_attempts: u32,
    tripped: AtomicBool,
}

impl RemoteQueue {
    pub fn new(store: Arc<dyn NoteStore>, retries: u32) -> Self {
        Self {
            store,
            gate: Semaphore::new(1),
            backoff: Backoff::remote_default(),
            max_attempts: retries.saturating_add(1),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Creates the note for the card at `key` and claims its id. When the
    /// remote store hands back an existing note that another live card
    /// already holds, a distinct note is created instead. The gate stays held
    /// from the create to the claim.
    pub async fn create_note(
        &self,
        note: &NoteContent,
        key: &UnitKey,
        claims: &IdClaims,
    ) -> Result<NoteId, RemoteError> {
        let store = &self.store;
        self.run("create", || async move {
            let created = store.create_note(note, DuplicatePolicy::Reuse).await?;
            let id = if created.reused && claims.held_elsewhere(created.id, key) {
                debug!(
                    note_id = %created.id,
                    path = %key.path,
                    position = key.position,
                    "identical note belongs to another card, creating a distinct one"
                );
                store.create_note(note, DuplicatePolicy::Allow).await?.id
            } else {
                created.id
            };
            claims.claim(id, key);
            Ok::<_, RemoteError>(id)
        })
        .await
    }

    pub async fn update_note_fields(
        &self,
        id: NoteId,
        note: &NoteContent,
    ) -> Result<(), RemoteError> {
        let store = &self.store;
        self.run("update", || store.update_note_fields(id, note))
            .await
    }

    pub async fn delete_notes(&self, ids: &[NoteId]) -> Result<(), RemoteError> {
        if ids.is_empty() {
            return Ok(());
        }
        let store = &self.store;
        self.run("delete", || store.delete_notes(ids)).await
    }

    pub async fn find_notes_by_ids(&self, ids: &[NoteId]) -> Result<HashSet<NoteId>, RemoteError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let store = &self.store;
        self.run("find", || store.find_notes_by_ids(ids)).await
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| RemoteError::Unavailable("remote queue closed".to_string()))?;
        let mut attempt = 0;
        loop {
            if self.is_tripped() {
                return Err(RemoteError::Unavailable(
                    "remote store stopped responding earlier in this run".to_string(),
                ));
            }
            match call().await {
                Err(RemoteError::Unavailable(message)) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(operation, attempts = attempt, error = %message, "remote store unavailable, giving up");
                        self.tripped.store(true, Ordering::SeqCst);
                        return Err(RemoteError::Unavailable(message));
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    debug!(operation, attempt, ?delay, error = %message, "retrying remote call");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::fake_store::RecordingNoteStore;
    use crate::sync::remote::CreatedNote;
    use crate::sync::store::FingerprintStore;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn content(text: &str) -> NoteContent {
        NoteContent {
            deck: "Obsidian".to_string(),
            text: text.to_string(),
            back_extra: String::new(),
            tags: Vec::new(),
            pictures: Vec::new(),
        }
    }

    fn claims() -> IdClaims {
        IdClaims::new("/vault", &FingerprintStore::in_memory())
    }

    fn key(position: usize) -> UnitKey {
        UnitKey::new("a.md", position)
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(RecordingNoteStore::new());
        store.fail_next_unavailable(2);
        let queue = RemoteQueue::new(store.clone(), 3).with_backoff(Backoff::immediate());

        let id = queue
            .create_note(&content("{{c1::a}}"), &key(0), &claims())
            .await
            .unwrap();

        assert_eq!(store.create_calls(), 3);
        assert!(store.note(id).is_some());
        assert!(!queue.is_tripped());
    }

    #[tokio::test]
    async fn sustained_failure_trips_and_fails_fast() {
        let store = Arc::new(RecordingNoteStore::new());
        store.set_unavailable(true);
        let queue = RemoteQueue::new(store.clone(), 2).with_backoff(Backoff::immediate());

        let claims = claims();
        let err = queue
            .create_note(&content("{{c1::a}}"), &key(0), &claims)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)));
        assert_eq!(store.create_calls(), 3);
        assert!(queue.is_tripped());

        store.set_unavailable(false);
        let err = queue
            .create_note(&content("{{c1::b}}"), &key(1), &claims)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)));
        assert_eq!(store.create_calls(), 3);
    }

    #[tokio::test]
    async fn rejected_calls_are_not_retried() {
        let store = Arc::new(RecordingNoteStore::new());
        store.fail_creates_containing("bad", RemoteError::Rejected("invalid deck".to_string()));
        let queue = RemoteQueue::new(store.clone(), 3).with_backoff(Backoff::immediate());

        let err = queue
            .create_note(&content("{{c1::bad}}"), &key(0), &claims())
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::Rejected("invalid deck".to_string()));
        assert_eq!(store.create_calls(), 1);
        assert!(!queue.is_tripped());
    }

    #[tokio::test]
    async fn identical_cards_get_distinct_notes() {
        let store = Arc::new(RecordingNoteStore::new());
        let queue = RemoteQueue::new(store.clone(), 0);
        let claims = claims();

        let first = queue
            .create_note(&content("{{c1::same}}"), &key(0), &claims)
            .await
            .unwrap();
        let second = queue
            .create_note(&content("{{c1::same}}"), &key(1), &claims)
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(store.notes().len(), 2);
        assert_eq!(store.create_calls(), 3);
    }

    #[tokio::test]
    async fn unclaimed_duplicate_is_reused() {
        let store = Arc::new(RecordingNoteStore::new());
        let queue = RemoteQueue::new(store.clone(), 0);

        let first = queue
            .create_note(&content("{{c1::moved}}"), &key(0), &claims())
            .await
            .unwrap();
        let again = queue
            .create_note(&content("{{c1::moved}}"), &UnitKey::new("b.md", 0), &claims())
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(store.notes().len(), 1);
    }

    struct SlowStore {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl NoteStore for SlowStore {
        async fn create_note(
            &self,
            _note: &NoteContent,
            _duplicates: DuplicatePolicy,
        ) -> Result<CreatedNote, RemoteError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(CreatedNote {
                id: NoteId(1),
                reused: false,
            })
        }

        async fn update_note_fields(
            &self,
            _id: NoteId,
            _note: &NoteContent,
        ) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn delete_notes(&self, _ids: &[NoteId]) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn find_notes_by_ids(
            &self,
            _ids: &[NoteId],
        ) -> Result<HashSet<NoteId>, RemoteError> {
            Ok(HashSet::new())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn calls_never_overlap() {
        let store = Arc::new(SlowStore {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let queue = Arc::new(RemoteQueue::new(store.clone(), 0));
        let claims = Arc::new(claims());

        let mut handles = Vec::new();
        for index in 0..8 {
            let queue = queue.clone();
            let claims = claims.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .create_note(&content(&format!("{{{{c1::{index}}}}}")), &key(index), &claims)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.peak.load(Ordering::SeqCst), 1);
    }
}
