//! In-memory [`StoreClient`] double with real tag filtering, single-writer
//! session enforcement, and a call journal shared with other test doubles so
//! cross-component call ordering can be asserted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::cards::{Card, CardId, CardPayload, CardStatus, CardSummary, DeckId};
use crate::store::client::{
    FilteredSessionOptions, Result, StoreClient, StoreError, StudyAction,
};

/// Journal of calls in arrival order, shared between doubles.
pub type CallJournal = Arc<Mutex<Vec<String>>>;

/// Ephemeral scope ids handed out by [`MemoryStore`] start here.
const FIRST_SCOPE_ID: DeckId = 90_000;

struct SessionState {
    card_ids: Vec<CardId>,
    position: usize,
    flipped: bool,
}

struct MemoryState {
    cards: HashMap<CardId, Card>,
    /// Card ids captured when a filtered scope was created, in serve order.
    filtered_scopes: HashMap<DeckId, Vec<CardId>>,
    sessions: HashMap<DeckId, SessionState>,
    /// The single-writer slot; `Some` while any session is open.
    open_session: Option<DeckId>,
    next_scope_id: DeckId,
    /// Scripted failures: this many filtered-session opens fail busy.
    busy_opens_remaining: u32,
    /// Listing entries served without a card id.
    phantoms: Vec<CardSummary>,
    ratings: Vec<(CardId, u8)>,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    journal: CallJournal,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: Mutex::new(MemoryState {
                cards: HashMap::new(),
                filtered_scopes: HashMap::new(),
                sessions: HashMap::new(),
                open_session: None,
                next_scope_id: FIRST_SCOPE_ID,
                busy_opens_remaining: 0,
                phantoms: Vec::new(),
                ratings: Vec::new(),
            }),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle to the shared journal, for producers under test to record into.
    pub fn journal(&self) -> CallJournal {
        Arc::clone(&self.journal)
    }

    pub fn journal_entries(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn add_card(&self, card: Card) {
        let mut state = self.state.lock().unwrap();
        state.cards.insert(card.id, card);
    }

    /// Scripts the next `count` filtered-session opens to fail busy.
    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().unwrap().busy_opens_remaining = count;
    }

    /// Adds a listing entry without a card id.
    pub fn add_phantom_summary(&self, summary: CardSummary) {
        self.state.lock().unwrap().phantoms.push(summary);
    }

    pub fn card_state(&self, id: CardId) -> Option<CardStatus> {
        self.state.lock().unwrap().cards.get(&id).map(|c| c.state)
    }

    pub fn open_session_scope(&self) -> Option<DeckId> {
        self.state.lock().unwrap().open_session
    }

    /// Ratings applied so far, in submission order.
    pub fn ratings(&self) -> Vec<(CardId, u8)> {
        self.state.lock().unwrap().ratings.clone()
    }

    fn record(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }

    fn summary_of(card: &Card) -> CardSummary {
        CardSummary {
            card_id: Some(card.id),
            note_id: card.note_id,
            deck_id: card.deck_id,
            tags: card.tags.clone(),
            state: card.state,
            fields: card.fields.clone(),
        }
    }

    /// Cards a fresh session over `scope` would serve, in order.
    fn session_cards(state: &MemoryState, scope: DeckId) -> Vec<CardId> {
        match state.filtered_scopes.get(&scope) {
            // Filtered scopes replay their captured ids, dropping cards
            // answered since capture.
            Some(captured) => captured
                .iter()
                .copied()
                .filter(|id| {
                    state
                        .cards
                        .get(id)
                        .map(|c| c.state == CardStatus::New)
                        .unwrap_or(false)
                })
                .collect(),
            None => {
                let mut ids: Vec<CardId> = state
                    .cards
                    .values()
                    .filter(|c| c.deck_id == Some(scope) && c.state == CardStatus::New)
                    .map(|c| c.id)
                    .collect();
                ids.sort_unstable();
                ids
            }
        }
    }

    fn serve_current(state: &MemoryState, scope: DeckId) -> Option<CardPayload> {
        let session = state.sessions.get(&scope)?;
        let id = session.card_ids.get(session.position)?;
        let card = state.cards.get(id)?;
        let mut payload = card.as_payload();
        payload.back_shown = session.flipped;
        Some(payload)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn list_cards_by_tag(
        &self,
        tag: &str,
        state_filter: Option<CardStatus>,
    ) -> Result<Vec<CardSummary>> {
        self.record(format!(
            "list_tag:{}:{}",
            tag,
            state_filter.map(|s| s.as_str()).unwrap_or("any")
        ));

        let state = self.state.lock().unwrap();
        let mut matches: Vec<&Card> = state
            .cards
            .values()
            .filter(|c| c.has_tag(tag))
            .filter(|c| state_filter.map(|s| c.state == s).unwrap_or(true))
            .collect();
        matches.sort_unstable_by_key(|c| c.id);

        let mut summaries: Vec<CardSummary> = matches.into_iter().map(Self::summary_of).collect();
        summaries.extend(
            state
                .phantoms
                .iter()
                .filter(|p| p.tags.iter().any(|t| t == tag))
                .filter(|p| state_filter.map(|s| p.state == s).unwrap_or(true))
                .cloned(),
        );
        Ok(summaries)
    }

    async fn list_scope_cards(&self, scope_id: DeckId) -> Result<Vec<CardSummary>> {
        self.record(format!("list_scope:{}", scope_id));

        let state = self.state.lock().unwrap();
        let summaries = match state.filtered_scopes.get(&scope_id) {
            Some(captured) => captured
                .iter()
                .filter_map(|id| state.cards.get(id))
                .map(Self::summary_of)
                .collect(),
            None => {
                let mut matches: Vec<&Card> = state
                    .cards
                    .values()
                    .filter(|c| c.deck_id == Some(scope_id))
                    .collect();
                matches.sort_unstable_by_key(|c| c.id);
                matches.into_iter().map(Self::summary_of).collect()
            }
        };
        Ok(summaries)
    }

    async fn open_filtered_session(
        &self,
        scope_id: DeckId,
        options: &FilteredSessionOptions,
    ) -> Result<DeckId> {
        let mut state = self.state.lock().unwrap();
        if state.busy_opens_remaining > 0 {
            state.busy_opens_remaining -= 1;
            drop(state);
            self.record("open_filtered_busy".to_string());
            return Err(StoreError::SessionBusy);
        }
        if state.open_session.is_some() {
            drop(state);
            self.record("open_filtered_busy".to_string());
            return Err(StoreError::SessionBusy);
        }

        let mut captured: Vec<CardId> = state
            .cards
            .values()
            .filter(|c| c.deck_id == Some(scope_id) && c.state == CardStatus::New)
            .filter(|c| options.tags_to_include.iter().any(|t| c.has_tag(t)))
            .filter(|c| !options.tags_to_exclude.iter().any(|t| c.has_tag(t)))
            .map(|c| c.id)
            .collect();
        captured.sort_unstable();
        captured.truncate(options.card_limit as usize);

        let new_scope = state.next_scope_id;
        state.next_scope_id += 1;
        state.filtered_scopes.insert(new_scope, captured);
        drop(state);

        self.record(format!(
            "open_filtered:{}:{}",
            scope_id,
            options.tags_to_include.join("+")
        ));
        Ok(new_scope)
    }

    async fn study(&self, scope_id: DeckId, action: StudyAction) -> Result<Option<CardPayload>> {
        let mut state = self.state.lock().unwrap();
        match action {
            StudyAction::Start => {
                if let Some(open) = state.open_session {
                    if open != scope_id {
                        drop(state);
                        self.record(format!("study_busy:{}", scope_id));
                        return Err(StoreError::SessionBusy);
                    }
                }
                let card_ids = Self::session_cards(&state, scope_id);
                state.sessions.insert(
                    scope_id,
                    SessionState {
                        card_ids,
                        position: 0,
                        flipped: false,
                    },
                );
                state.open_session = Some(scope_id);
                let served = Self::serve_current(&state, scope_id);
                drop(state);
                self.record(format!("study:{}:start", scope_id));
                Ok(served)
            }
            StudyAction::Flip => {
                let session =
                    state
                        .sessions
                        .get_mut(&scope_id)
                        .ok_or_else(|| StoreError::Api {
                            status: 400,
                            message: format!("no session open for deck {}", scope_id),
                        })?;
                session.flipped = true;
                let served = Self::serve_current(&state, scope_id);
                drop(state);
                self.record(format!("study:{}:flip", scope_id));
                Ok(served)
            }
            StudyAction::Rate(rating) => {
                let session =
                    state
                        .sessions
                        .get_mut(&scope_id)
                        .ok_or_else(|| StoreError::Api {
                            status: 400,
                            message: format!("no session open for deck {}", scope_id),
                        })?;
                if !session.flipped {
                    return Err(StoreError::Api {
                        status: 400,
                        message: "flip required before rating".to_string(),
                    });
                }
                let id = session
                    .card_ids
                    .get(session.position)
                    .copied()
                    .ok_or_else(|| StoreError::Api {
                        status: 400,
                        message: "no current card to rate".to_string(),
                    })?;
                session.position += 1;
                session.flipped = false;
                if let Some(card) = state.cards.get_mut(&id) {
                    card.state = CardStatus::Learning;
                }
                state.ratings.push((id, rating.value()));
                let served = Self::serve_current(&state, scope_id);
                drop(state);
                self.record(format!("study:{}:{}", scope_id, rating.value()));
                Ok(served)
            }
            StudyAction::Close => {
                state.sessions.remove(&scope_id);
                if state.open_session == Some(scope_id) {
                    state.open_session = None;
                }
                drop(state);
                self.record(format!("study:{}:close", scope_id));
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::Rating;
    use std::collections::BTreeMap;

    fn card(id: CardId, deck: DeckId, tags: &[&str]) -> Card {
        Card {
            id,
            note_id: Some(id * 10),
            deck_id: Some(deck),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            state: CardStatus::New,
            fields: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_filtered_capture_matches_tag_state_and_limit() {
        let store = MemoryStore::new();
        store.add_card(card(1, 5, &["vocab_9"]));
        store.add_card(card(2, 5, &["vocab_9"]));
        store.add_card(card(3, 5, &["other"]));
        store.add_card(card(4, 7, &["vocab_9"]));

        let scope = store
            .open_filtered_session(5, &FilteredSessionOptions::for_tag("vocab_9", 1))
            .await
            .unwrap();
        let listed = store.list_scope_cards(scope).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].card_id, Some(1));
    }

    #[tokio::test]
    async fn test_single_writer_slot() {
        let store = MemoryStore::new();
        store.add_card(card(1, 5, &["a"]));
        store.study(5, StudyAction::Start).await.unwrap();

        let err = store
            .open_filtered_session(5, &FilteredSessionOptions::for_tag("a", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionBusy));
        assert!(matches!(
            store.study(99, StudyAction::Start).await.unwrap_err(),
            StoreError::SessionBusy
        ));

        store.study(5, StudyAction::Close).await.unwrap();
        assert!(store.open_session_scope().is_none());
        store.study(99, StudyAction::Start).await.unwrap();
    }

    #[tokio::test]
    async fn test_rating_requires_flip_and_advances() {
        let store = MemoryStore::new();
        store.add_card(card(1, 5, &[]));
        store.add_card(card(2, 5, &[]));

        let first = store.study(5, StudyAction::Start).await.unwrap().unwrap();
        assert_eq!(first.card_id, Some(1));
        assert!(!first.back_shown);

        let err = store.study(5, StudyAction::Rate(Rating::Good)).await.unwrap_err();
        assert!(matches!(err, StoreError::Api { status: 400, .. }));

        let flipped = store.study(5, StudyAction::Flip).await.unwrap().unwrap();
        assert!(flipped.back_shown);
        let next = store.study(5, StudyAction::Rate(Rating::Good)).await.unwrap();
        assert_eq!(next.unwrap().card_id, Some(2));

        assert_eq!(store.ratings(), vec![(1, 3)]);
        assert_eq!(store.card_state(1), Some(CardStatus::Learning));
    }

    #[tokio::test]
    async fn test_scripted_busy_opens() {
        let store = MemoryStore::new();
        store.add_card(card(1, 5, &["t"]));
        store.fail_next_opens(1);

        let options = FilteredSessionOptions::for_tag("t", 10);
        assert!(store.open_filtered_session(5, &options).await.is_err());
        assert!(store.open_filtered_session(5, &options).await.is_ok());

        let journal = store.journal_entries();
        assert_eq!(journal[0], "open_filtered_busy");
        assert!(journal[1].starts_with("open_filtered:5:"));
    }

    #[tokio::test]
    async fn test_phantoms_appear_in_tag_listings() {
        let store = MemoryStore::new();
        store.add_phantom_summary(CardSummary {
            tags: vec!["ghost".to_string()],
            ..Default::default()
        });

        let listed = store
            .list_cards_by_tag("ghost", Some(CardStatus::New))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].card_id, None);
    }
}
