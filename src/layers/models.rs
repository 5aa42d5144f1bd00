use serde::Serialize;
use thiserror::Error;

use crate::cards::{CardId, DeckId};
use crate::polling::PollStatus;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, LayerError>;

#[derive(Error, Debug)]
pub enum LayerError {
    #[error("a layer tagged '{0}' is already on the stack")]
    DuplicateTag(String),
    #[error("no active layer")]
    NoActiveLayer,
    #[error("active layer has not timed out")]
    NotTimedOut,
    #[error("active layer has no session to study yet")]
    NotReady,
    #[error("detection retries exhausted for layer '{0}'")]
    RetriesExhausted(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Where a layer is in its lifecycle.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LayerPhase {
    /// A background task is polling the store for produced cards.
    Polling,
    /// Beneath a newer layer on the stack; polling withheld.
    Suspended,
    /// The detection window elapsed; waiting for a manual retry or teardown.
    TimedOut,
    /// Expected cards found and an isolated session available.
    Ready,
    /// The isolated session is being driven to completion.
    Studying,
}

/// One production batch: a tag plus its card-count bookkeeping.
///
/// `expected_count` is fixed when the layer starts and is never revised;
/// readiness compares the store's tag count against
/// `initial_count + expected_count`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub tag: String,
    /// Cards the production request is expected to add.
    pub expected_count: usize,
    /// Cards already bearing the tag before the request went out.
    pub initial_count: usize,
    /// Cards rated through this layer's isolated session so far.
    pub processed_count: usize,
    /// Tag of the layer this one was spawned from, for nested requests.
    pub parent_tag: Option<String>,
}

/// Display snapshot of one stack entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayerView {
    pub tag: String,
    pub expected_count: usize,
    pub initial_count: usize,
    pub processed_count: usize,
    pub parent_tag: Option<String>,
    pub phase: LayerPhase,
    pub session_scope_id: Option<DeckId>,
    pub poll: Option<PollStatus>,
}

/// Notifications pushed over the coordinator's event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerEvent {
    /// The layer found its expected cards and opened an isolated session.
    Ready { tag: String, session_scope_id: DeckId },
    /// Detection timed out with this many manual retries left.
    TimedOut { tag: String, retries_remaining: u32 },
    Completed { tag: String, processed_count: usize },
    /// The named layer is back on top of the stack and active.
    Resumed { tag: String },
    AllLayersComplete,
}

/// Outcome of driving the active layer's isolated session.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerFinish {
    /// Every served card had a cached answer; the layer popped.
    Completed { tag: String, processed_count: usize },
    /// A served card has no cached answer yet. The session is closed and
    /// the layer stays on the stack until that card is answered.
    AwaitingAnswer {
        tag: String,
        card_id: Option<CardId>,
        processed_count: usize,
    },
}
