use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::cards::{CardPayload, CardStatus, CardSummary, DeckId, Rating};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("a study session is already open on the storage engine")]
    SessionBusy,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage engine error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("malformed storage reply: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    /// Busy sessions and transport failures clear up on their own; a poll
    /// tick that hits one waits for the next tick instead of failing.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::SessionBusy | StoreError::Http(_))
    }
}

/// Study actions understood by the storage engine.
///
/// The engine requires a flip before it accepts a rating, so submission
/// flows always send [`StudyAction::Flip`] ahead of [`StudyAction::Rate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyAction {
    Start,
    Flip,
    Rate(Rating),
    Close,
}

impl StudyAction {
    /// Wire form of the action (`start`, `flip`, `1`..`4`, `close`).
    pub fn as_str(&self) -> &'static str {
        match self {
            StudyAction::Start => "start",
            StudyAction::Flip => "flip",
            StudyAction::Rate(rating) => rating.as_action_str(),
            StudyAction::Close => "close",
        }
    }
}

/// Parameters for an ephemeral tag-filtered session deck.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilteredSessionOptions {
    pub tags_to_include: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags_to_exclude: Vec<String>,
    pub card_limit: u32,
}

impl FilteredSessionOptions {
    pub fn for_tag(tag: impl Into<String>, card_limit: u32) -> Self {
        FilteredSessionOptions {
            tags_to_include: vec![tag.into()],
            tags_to_exclude: Vec::new(),
            card_limit,
        }
    }
}

/// Boundary to the storage engine.
///
/// The engine enforces a single open study session at a time; opening a
/// second one (plain or filtered) fails with [`StoreError::SessionBusy`]
/// until the first is closed.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Lists cards carrying `tag`, optionally narrowed to one scheduling
    /// state.
    async fn list_cards_by_tag(
        &self,
        tag: &str,
        state: Option<CardStatus>,
    ) -> Result<Vec<CardSummary>>;

    /// Lists every card in a deck scope.
    async fn list_scope_cards(&self, scope_id: DeckId) -> Result<Vec<CardSummary>>;

    /// Creates an ephemeral filtered session deck over the cards of
    /// `scope_id` matching `options` and returns the new deck's id.
    async fn open_filtered_session(
        &self,
        scope_id: DeckId,
        options: &FilteredSessionOptions,
    ) -> Result<DeckId>;

    /// Drives the session on `scope_id` with one action. `None` from
    /// [`StudyAction::Start`] or [`StudyAction::Rate`] means the session
    /// has no more due cards.
    async fn study(&self, scope_id: DeckId, action: StudyAction) -> Result<Option<CardPayload>>;
}
