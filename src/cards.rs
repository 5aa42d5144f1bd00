//! Card data models shared by the queue, polling, and session layers.
//!
//! Ids live in the external storage engine's integer id space. Listing
//! entries arrive over the wire and may be incomplete; anything that needs a
//! guaranteed id goes through [`CardSummary::into_card`].

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Identifier of a card in the external storage engine.
pub type CardId = i64;

/// Identifier of the note a card belongs to.
pub type NoteId = i64;

/// Identifier of a deck (scope) in the external storage engine.
pub type DeckId = i64;

/// Scheduling state of a card, as the engine reports it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    #[default]
    New,
    Learning,
    Review,
    Relearning,
}

impl CardStatus {
    /// Wire form used in listing queries.
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::New => "new",
            CardStatus::Learning => "learning",
            CardStatus::Review => "review",
            CardStatus::Relearning => "relearning",
        }
    }
}

/// User rating for a studied card, mirroring the engine's four ease buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rating {
    Again,
    Hard,
    Good,
    Easy,
}

impl Rating {
    pub fn from_value(value: u8) -> Option<Rating> {
        match value {
            1 => Some(Rating::Again),
            2 => Some(Rating::Hard),
            3 => Some(Rating::Good),
            4 => Some(Rating::Easy),
            _ => None,
        }
    }

    pub fn value(&self) -> u8 {
        match self {
            Rating::Again => 1,
            Rating::Hard => 2,
            Rating::Good => 3,
            Rating::Easy => 4,
        }
    }

    /// Wire form of the rating as a study action.
    pub fn as_action_str(&self) -> &'static str {
        match self {
            Rating::Again => "1",
            Rating::Hard => "2",
            Rating::Good => "3",
            Rating::Easy => "4",
        }
    }
}

/// A card as this subsystem tracks it: listing data with a guaranteed id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: CardId,
    #[serde(default)]
    pub note_id: Option<NoteId>,
    #[serde(default)]
    pub deck_id: Option<DeckId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub state: CardStatus,
    /// Field name to rendered value, as the engine serves it.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Card {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Display form of the card, matching what a study session would serve.
    pub fn as_payload(&self) -> CardPayload {
        CardPayload {
            card_id: Some(self.id),
            note_id: self.note_id,
            tags: self.tags.clone(),
            fields: self.fields.clone(),
            back_shown: false,
        }
    }
}

/// One entry of a listing reply. Ids are optional on the wire; entries
/// without a card id are dropped (and logged) before they reach the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CardSummary {
    #[serde(default)]
    pub card_id: Option<CardId>,
    #[serde(default)]
    pub note_id: Option<NoteId>,
    #[serde(default)]
    pub deck_id: Option<DeckId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub state: CardStatus,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl CardSummary {
    /// Promotes the summary to a [`Card`], or `None` when the id is missing.
    pub fn into_card(self) -> Option<Card> {
        let id = self.card_id?;
        Some(Card {
            id,
            note_id: self.note_id,
            deck_id: self.deck_id,
            tags: self.tags,
            state: self.state,
            fields: self.fields,
        })
    }
}

/// Card content served by an open study session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardPayload {
    #[serde(default)]
    pub card_id: Option<CardId>,
    #[serde(default)]
    pub note_id: Option<NoteId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// True once the back of the card has been revealed.
    #[serde(default)]
    pub back_shown: bool,
}

/// Collects the card ids present in a listing, skipping entries that
/// arrived without one.
pub fn extract_card_ids(summaries: &[CardSummary]) -> HashSet<CardId> {
    let mut ids = HashSet::with_capacity(summaries.len());
    for summary in summaries {
        match summary.card_id {
            Some(id) => {
                ids.insert(id);
            }
            None => {
                log::warn!(
                    "Card listing entry without an id skipped (note id: {:?})",
                    summary.note_id
                );
            }
        }
    }
    ids
}
