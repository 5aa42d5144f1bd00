//! Top-level session control: the primary study session, pause and resume
//! around definition production, and answer-cache reconciliation in between.
//!
//! The orchestrator owns the pieces the rest of the crate provides: one
//! [`LayerCoordinator`] for definition layers, one [`CardQueue`] for produced
//! cards, and the primary session state. The storage engine allows a single
//! open study session, so every transition here is a hand-off of that slot:
//! the primary session is closed before the producer may write, layer
//! sessions open only once their cards were detected, and ratings given
//! while no session is open are cached and submitted on resume.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::cards::{extract_card_ids, Card, CardId, CardPayload, DeckId, Rating};
use crate::layers::{LayerCoordinator, LayerError, LayerEvent, LayerFinish, LayerView};
use crate::polling::PollConfig;
use crate::producer::{build_card_context, DefinitionProducer, ProduceRequest, ProducerError};
use crate::queue::{CardQueue, QueueStatus};
use crate::store::{StoreClient, StoreError, StudyAction};

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("no primary study session is open")]
    NoPrimarySession,
    #[error("no card is currently displayed")]
    NoCurrentCard,
    #[error("the current card has no note id to derive a layer tag from")]
    MissingNoteId,
    #[error("the definition request carries no words")]
    NoWords,
    #[error(transparent)]
    Producer(#[from] ProducerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Layer(#[from] LayerError),
}

fn default_tag_prefix() -> String {
    "vocab".to_string()
}

fn default_session_card_limit() -> u32 {
    100
}

/// Orchestrator settings, deserializable from host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Deck produced vocabulary cards land in.
    pub vocab_deck_id: DeckId,
    #[serde(default)]
    pub poll: PollConfig,
    /// Prefix of layer tags derived from primary cards.
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    /// Upper bound on cards captured by a layer's filtered session.
    #[serde(default = "default_session_card_limit")]
    pub session_card_limit: u32,
}

/// Result of answering the primary card.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerOutcome {
    /// The rating went through the live session; the next card, if any.
    Submitted(Option<CardPayload>),
    /// The session is paused; the rating was cached for resume.
    Cached,
}

#[derive(Debug)]
struct PrimarySession {
    deck_id: DeckId,
    current: Option<CardPayload>,
    paused: bool,
}

/// Primary-session half of the aggregate status.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryStatus {
    pub deck_id: DeckId,
    pub paused: bool,
    pub current_card_id: Option<CardId>,
}

/// Aggregate snapshot served to status surfaces.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub primary: Option<PrimaryStatus>,
    pub queue: QueueStatus,
    pub current_vocab_card_id: Option<CardId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<LayerView>,
}

/// Drives one primary study session and the definition layers spawned from
/// it. Constructed per session; all mutable state lives behind its own
/// locks, so the handle can be shared freely.
pub struct SessionOrchestrator {
    store: Arc<dyn StoreClient>,
    producer: Arc<dyn DefinitionProducer>,
    config: OrchestratorConfig,
    queue: Arc<Mutex<CardQueue>>,
    seen: Arc<Mutex<HashSet<CardId>>>,
    coordinator: LayerCoordinator,
    primary: Mutex<Option<PrimarySession>>,
    /// Vocabulary card currently displayed, kept here so a requeue does not
    /// need the payload resent by the caller.
    current_vocab: Mutex<Option<Card>>,
}

impl SessionOrchestrator {
    /// Builds the orchestrator and the layer event stream consumed by the
    /// presentation side.
    pub fn new(
        store: Arc<dyn StoreClient>,
        producer: Arc<dyn DefinitionProducer>,
        config: OrchestratorConfig,
    ) -> (Self, mpsc::Receiver<LayerEvent>) {
        let queue = Arc::new(Mutex::new(CardQueue::new()));
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let (coordinator, events) = LayerCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&seen),
            config.vocab_deck_id,
            config.poll.clone(),
            config.session_card_limit,
        );
        (
            SessionOrchestrator {
                store,
                producer,
                config,
                queue,
                seen,
                coordinator,
                primary: Mutex::new(None),
                current_vocab: Mutex::new(None),
            },
            events,
        )
    }

    /// Opens the primary study session on `deck_id` and returns the first
    /// card. Ids already present in the vocabulary deck are recorded first,
    /// so cards that predate this session are never mistaken for produced
    /// ones. Any previous live primary session is closed.
    pub async fn start_primary(&self, deck_id: DeckId) -> Result<Option<CardPayload>> {
        let previous = {
            let primary = self.primary.lock().unwrap();
            primary.as_ref().and_then(|s| (!s.paused).then_some(s.deck_id))
        };
        if let Some(old_deck) = previous {
            if let Err(err) = self.store.study(old_deck, StudyAction::Close).await {
                log::warn!(
                    "Session: failed to close previous primary session on deck {}: {}",
                    old_deck,
                    err
                );
            }
        }

        let listed = self.store.list_scope_cards(self.config.vocab_deck_id).await?;
        let preexisting = extract_card_ids(&listed);
        let seeded = preexisting.len();
        self.seen.lock().unwrap().extend(preexisting);

        let served = self.store.study(deck_id, StudyAction::Start).await?;
        *self.primary.lock().unwrap() = Some(PrimarySession {
            deck_id,
            current: served.clone(),
            paused: false,
        });
        log::info!(
            "Session: primary session opened on deck {} ({} vocabulary card(s) already present)",
            deck_id,
            seeded
        );
        Ok(served)
    }

    /// Reveals the back of the current primary card. While paused the
    /// payload is already client-side and the flip is local; a live session
    /// is asked so the engine state stays in step.
    pub async fn flip_primary(&self) -> Result<Option<CardPayload>> {
        let deck_id = {
            let mut primary = self.primary.lock().unwrap();
            let session = primary.as_mut().ok_or(OrchestratorError::NoPrimarySession)?;
            let current = session
                .current
                .as_mut()
                .ok_or(OrchestratorError::NoCurrentCard)?;
            if session.paused {
                current.back_shown = true;
                return Ok(Some(current.clone()));
            }
            session.deck_id
        };

        let served = self.store.study(deck_id, StudyAction::Flip).await?;
        if let Some(session) = self.primary.lock().unwrap().as_mut() {
            session.current = served.clone();
        }
        Ok(served)
    }

    /// Rates the current primary card. While the session is paused the
    /// rating is cached and reconciled on [`resume`](Self::resume);
    /// otherwise it is submitted live (flipping first when the back was
    /// never shown) and the next card becomes current.
    pub async fn answer_primary(&self, rating: Rating) -> Result<AnswerOutcome> {
        let (deck_id, card_id, back_shown, paused) = {
            let primary = self.primary.lock().unwrap();
            let session = primary.as_ref().ok_or(OrchestratorError::NoPrimarySession)?;
            let current = session
                .current
                .as_ref()
                .ok_or(OrchestratorError::NoCurrentCard)?;
            (session.deck_id, current.card_id, current.back_shown, session.paused)
        };

        if paused {
            let id = card_id.ok_or(OrchestratorError::NoCurrentCard)?;
            self.queue.lock().unwrap().cache_answer(id, rating);
            log::info!("Session: rating for card {} cached while paused", id);
            return Ok(AnswerOutcome::Cached);
        }

        if !back_shown {
            self.store.study(deck_id, StudyAction::Flip).await?;
        }
        let served = self.store.study(deck_id, StudyAction::Rate(rating)).await?;
        if let Some(session) = self.primary.lock().unwrap().as_mut() {
            session.current = served.clone();
        }
        Ok(AnswerOutcome::Submitted(served))
    }

    /// Pauses studying and requests definitions for `words`.
    ///
    /// The layer tag is derived from the source card's note id: the primary
    /// card for a first request, the vocabulary card currently displayed for
    /// a nested one (prefixed with the parent layer's tag). The layer starts
    /// polling before the single-writer session is released and before the
    /// producer is called, so its baseline can never include the cards it
    /// waits for. A producer failure rolls the layer back and surfaces the
    /// error; the primary session stays paused until [`resume`](Self::resume).
    ///
    /// Returns the tag of the created layer.
    pub async fn pause_for_definition(&self, words: &[String]) -> Result<String> {
        let words: Vec<String> = words
            .iter()
            .map(|word| word.trim())
            .filter(|word| !word.is_empty())
            .map(str::to_string)
            .collect();
        if words.is_empty() {
            return Err(OrchestratorError::NoWords);
        }

        let (source, tag) = match self.coordinator.active_tag() {
            Some(parent) => {
                let current = self.current_vocab.lock().unwrap();
                let card = current.as_ref().ok_or(OrchestratorError::NoCurrentCard)?;
                let note_id = card.note_id.ok_or(OrchestratorError::MissingNoteId)?;
                (card.as_payload(), format!("{}_{}", parent, note_id))
            }
            None => {
                let primary = self.primary.lock().unwrap();
                let session = primary.as_ref().ok_or(OrchestratorError::NoPrimarySession)?;
                let current = session
                    .current
                    .as_ref()
                    .ok_or(OrchestratorError::NoCurrentCard)?;
                let note_id = current.note_id.ok_or(OrchestratorError::MissingNoteId)?;
                (current.clone(), format!("{}_{}", self.config.tag_prefix, note_id))
            }
        };
        let context = build_card_context(&source);

        self.coordinator.start_layer(&tag, words.len()).await?;

        // The producer writes into the store; the single-writer session has
        // to be released first.
        if let Err(err) = self.close_primary_if_live().await {
            log::warn!(
                "Session: rolling back layer '{}', primary session close failed: {}",
                tag,
                err
            );
            self.rollback_layer(&tag).await;
            return Err(err);
        }

        let request = ProduceRequest::new(
            words,
            context,
            tag.clone(),
            self.config.vocab_deck_id,
        );
        log::info!(
            "Session: requesting {} definition(s) under tag '{}'",
            request.words.len(),
            tag
        );
        if let Err(err) = self.producer.produce(&request).await {
            log::warn!("Session: rolling back layer '{}', producer failed: {}", tag, err);
            self.rollback_layer(&tag).await;
            return Err(err.into());
        }
        Ok(tag)
    }

    /// Caches a rating for later submission and releases the card it rates.
    /// Used for vocabulary cards (submitted when their layer finishes) and
    /// for the primary card while the session is paused.
    pub fn cache_user_answer(&self, id: CardId, rating: Rating) {
        self.queue.lock().unwrap().cache_answer(id, rating);
        let mut current = self.current_vocab.lock().unwrap();
        if current.as_ref().map(|card| card.id) == Some(id) {
            *current = None;
        }
        log::info!("Session: rating cached for card {}", id);
    }

    /// Takes the next produced vocabulary card for display. A card taken
    /// earlier but neither rated nor requeued goes back to the end of the
    /// queue first.
    pub fn next_vocab_card(&self) -> Option<CardPayload> {
        let mut queue = self.queue.lock().unwrap();
        let mut current = self.current_vocab.lock().unwrap();
        if let Some(previous) = current.take() {
            queue.requeue(previous);
        }
        let card = queue.dequeue()?;
        let payload = card.as_payload();
        *current = Some(card);
        Some(payload)
    }

    /// Returns the displayed vocabulary card to the end of the queue.
    /// `false` when no card is currently out.
    pub fn requeue_vocab_card(&self) -> bool {
        let mut queue = self.queue.lock().unwrap();
        match self.current_vocab.lock().unwrap().take() {
            Some(card) => queue.requeue(card),
            None => false,
        }
    }

    /// Restarts the primary study session after the layers above it are
    /// gone. Cards whose rating was cached while paused are flipped and
    /// submitted as they come up, each cached entry consumed exactly once;
    /// the first card without one is returned for display.
    pub async fn resume(&self) -> Result<Option<CardPayload>> {
        let deck_id = {
            let primary = self.primary.lock().unwrap();
            primary
                .as_ref()
                .map(|s| s.deck_id)
                .ok_or(OrchestratorError::NoPrimarySession)?
        };

        let mut served = self.store.study(deck_id, StudyAction::Start).await?;
        loop {
            let Some(payload) = &served else { break };
            let Some(id) = payload.card_id else { break };
            let cached = self.queue.lock().unwrap().cached_answer(id);
            let Some(rating) = cached else { break };

            if !payload.back_shown {
                self.store.study(deck_id, StudyAction::Flip).await?;
            }
            served = self.store.study(deck_id, StudyAction::Rate(rating)).await?;
            self.queue.lock().unwrap().pop_cached_answer(id);
            log::info!("Session: cached rating for card {} submitted", id);
        }

        if let Some(session) = self.primary.lock().unwrap().as_mut() {
            session.paused = false;
            session.current = served.clone();
        }
        log::info!("Session: primary session resumed on deck {}", deck_id);
        Ok(served)
    }

    /// Drives the active layer's session through the cached answers.
    pub async fn finish_layer(&self) -> Result<LayerFinish> {
        Ok(self.coordinator.finish_active_layer().await?)
    }

    /// Restarts detection for a timed-out layer.
    pub async fn retry_detection(&self) -> Result<()> {
        Ok(self.coordinator.retry_active_layer().await?)
    }

    /// Discards the active layer without studying its cards.
    pub async fn abandon_layer(&self) -> Result<()> {
        Ok(self.coordinator.abandon_active_layer().await?)
    }

    /// Aggregate snapshot: primary session, queue counts, layer stack.
    pub fn status(&self) -> OrchestratorStatus {
        let primary = self
            .primary
            .lock()
            .unwrap()
            .as_ref()
            .map(|session| PrimaryStatus {
                deck_id: session.deck_id,
                paused: session.paused,
                current_card_id: session.current.as_ref().and_then(|c| c.card_id),
            });
        OrchestratorStatus {
            primary,
            queue: self.queue.lock().unwrap().status(),
            current_vocab_card_id: self.current_vocab.lock().unwrap().as_ref().map(|c| c.id),
            layers: self.coordinator.views(),
        }
    }

    /// Best-effort teardown: every layer, then the primary session, then
    /// the local queue state.
    pub async fn close_all(&self) {
        self.coordinator.close_all().await;

        let session = self.primary.lock().unwrap().take();
        if let Some(session) = session {
            if !session.paused {
                if let Err(err) = self.store.study(session.deck_id, StudyAction::Close).await {
                    log::warn!(
                        "Session: failed to close primary session on deck {}: {}",
                        session.deck_id,
                        err
                    );
                }
            }
        }

        self.queue.lock().unwrap().clear();
        *self.current_vocab.lock().unwrap() = None;
        log::info!("Session: teardown complete");
    }

    /// Closes the live primary session and marks it paused. A session that
    /// is already paused (or was never opened) is left alone.
    async fn close_primary_if_live(&self) -> Result<()> {
        let deck_id = {
            let primary = self.primary.lock().unwrap();
            primary.as_ref().and_then(|s| (!s.paused).then_some(s.deck_id))
        };
        let Some(deck_id) = deck_id else {
            return Ok(());
        };

        self.store.study(deck_id, StudyAction::Close).await?;
        if let Some(session) = self.primary.lock().unwrap().as_mut() {
            session.paused = true;
        }
        log::info!("Session: primary session on deck {} paused", deck_id);
        Ok(())
    }

    async fn rollback_layer(&self, tag: &str) {
        if self.coordinator.active_tag().as_deref() == Some(tag) {
            if let Err(err) = self.coordinator.abandon_active_layer().await {
                log::warn!("Session: failed to roll back layer '{}': {}", tag, err);
            }
        }
    }
}
