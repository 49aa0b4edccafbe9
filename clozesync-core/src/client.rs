use reqwest::{Client, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::note::{NewNote, NoteId, NoteInfo, NoteUpdate};

const DEFAULT_BASE_URL: &str = "http://localhost:8765";
const API_VERSION: u8 = 6;

#[derive(Debug, Error)]
pub enum AnkiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("endpoint returned {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("{action} failed: {message}")]
    Action {
        action: &'static str,
        message: String,
    },
    #[error("{action} returned neither result nor error")]
    EmptyResult { action: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Unavailable,
    NotFound,
    Duplicate,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    CreateDeck,
    AddNote,
    UpdateNote,
    DeleteNotes,
    NotesInfo,
    FindNotes,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::CreateDeck => "createDeck",
            Action::AddNote => "addNote",
            Action::UpdateNote => "updateNote",
            Action::DeleteNotes => "deleteNotes",
            Action::NotesInfo => "notesInfo",
            Action::FindNotes => "findNotes",
        }
    }
}

#[derive(Debug, Serialize)]
struct Request<'a, P: Serialize> {
    action: &'static str,
    version: u8,
    params: &'a P,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeckParams<'a> {
    deck: &'a str,
}

#[derive(Debug, Serialize)]
struct NoteParams<'a, T: Serialize> {
    note: &'a T,
}

#[derive(Debug, Serialize)]
struct NotesParams<'a> {
    notes: &'a [NoteId],
}

#[derive(Debug, Serialize)]
struct QueryParams<'a> {
    query: &'a str,
}

#[derive(Clone)]
pub struct AnkiClient {
    http: Client,
    base_url: Url,
}

impl AnkiClient {
    pub fn new() -> Result<Self, AnkiError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, AnkiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Creating a deck that already exists is a no-op on the remote side.
    pub async fn create_deck(&self, deck: &str) -> Result<u64, AnkiError> {
        self.invoke_required(Action::CreateDeck, &DeckParams { deck })
            .await
    }

    pub async fn add_note(&self, note: &NewNote) -> Result<NoteId, AnkiError> {
        self.invoke_required(Action::AddNote, &NoteParams { note })
            .await
    }

    pub async fn update_note(&self, update: &NoteUpdate) -> Result<(), AnkiError> {
        self.invoke::<_, IgnoredAny>(Action::UpdateNote, &NoteParams { note: update })
            .await
            .map(|_| ())
    }

    pub async fn delete_notes(&self, ids: &[NoteId]) -> Result<(), AnkiError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.invoke::<_, IgnoredAny>(Action::DeleteNotes, &NotesParams { notes: ids })
            .await
            .map(|_| ())
    }

    /// Unknown ids come back as empty objects, i.e. `note_id == None`.
    pub async fn notes_info(&self, ids: &[NoteId]) -> Result<Vec<NoteInfo>, AnkiError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.invoke_required(Action::NotesInfo, &NotesParams { notes: ids })
            .await
    }

    pub async fn find_notes(&self, query: &str) -> Result<Vec<NoteId>, AnkiError> {
        self.invoke_required(Action::FindNotes, &QueryParams { query })
            .await
    }

    async fn invoke_required<P, R>(&self, action: Action, params: &P) -> Result<R, AnkiError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.invoke(action, params)
            .await?
            .ok_or(AnkiError::EmptyResult {
                action: action.as_str(),
            })
    }

    async fn invoke<P, R>(&self, action: Action, params: &P) -> Result<Option<R>, AnkiError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.base_url.clone())
            .json(&Request {
                action: action.as_str(),
                version: API_VERSION,
                params,
            })
            .send()
            .await?;
        let envelope: Envelope<R> = Self::handle_response(response).await?;
        match (envelope.result, envelope.error) {
            (_, Some(message)) => Err(AnkiError::Action {
                action: action.as_str(),
                message,
            }),
            (result, None) => Ok(result),
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, AnkiError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AnkiError::Http { status, body })
        }
    }
}

impl AnkiError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            AnkiError::Request(err) if err.is_decode() => ApiErrorClass::Rejected,
            AnkiError::Request(_) => ApiErrorClass::Unavailable,
            AnkiError::Http { status, .. } => classify_http_status(*status),
            AnkiError::Action { message, .. } => classify_action_message(message),
            AnkiError::Url(_) | AnkiError::EmptyResult { .. } => ApiErrorClass::Rejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification() == ApiErrorClass::Unavailable
    }
}

fn classify_http_status(status: StatusCode) -> ApiErrorClass {
    if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
    {
        ApiErrorClass::Unavailable
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else {
        ApiErrorClass::Rejected
    }
}

fn classify_action_message(message: &str) -> ApiErrorClass {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("duplicate") {
        ApiErrorClass::Duplicate
    } else if lowered.contains("not found") || lowered.contains("notfound") {
        ApiErrorClass::NotFound
    } else {
        ApiErrorClass::Rejected
    }
}
