//! LIFO delivery queue for freshly produced vocabulary cards.
//!
//! The queue serves the most recently produced card first and guards against
//! duplicate delivery: a card id can be queued, in progress, or awaiting
//! answer submission, but never more than one of the three at once. Ratings
//! given while submission has to wait (the storage session is closed or held
//! by a layer) are cached here and consumed exactly once when they are
//! finally applied.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cards::{Card, CardId, Rating};

/// A rating supplied while submission had to be deferred.
#[derive(Debug, Clone, Copy)]
pub struct CachedAnswer {
    pub rating: Rating,
    pub cached_at: DateTime<Utc>,
}

/// Counts reported to status surfaces.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_length: usize,
    pub in_progress_count: usize,
    pub cached_count: usize,
    pub processed_count: usize,
}

/// LIFO card queue with duplicate suppression and a pending-answer cache.
#[derive(Debug, Default)]
pub struct CardQueue {
    queue: VecDeque<Card>,
    in_progress: HashSet<CardId>,
    cached: HashMap<CardId, CachedAnswer>,
    processed: usize,
}

impl CardQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a card at the front of the queue. A no-op when the id is
    /// already queued, in progress, or has an uncommitted cached answer.
    pub fn enqueue(&mut self, card: Card) -> bool {
        if self.contains(card.id) {
            log::debug!("Queue: card {} already tracked, enqueue skipped", card.id);
            return false;
        }
        self.queue.push_front(card);
        true
    }

    /// Removes and returns the front card, marking its id in progress.
    /// An empty queue yields `None`, not an error.
    pub fn dequeue(&mut self) -> Option<Card> {
        let card = self.queue.pop_front()?;
        self.in_progress.insert(card.id);
        Some(card)
    }

    /// Returns an in-progress card to the queue. Requeued cards go to the
    /// back: they were already seen once and must not shadow fresher
    /// arrivals.
    pub fn requeue(&mut self, card: Card) -> bool {
        if !self.in_progress.remove(&card.id) {
            log::debug!("Queue: card {} is not in progress, requeue skipped", card.id);
            return false;
        }
        self.queue.push_back(card);
        true
    }

    /// Caches a rating for later submission, clearing the in-progress mark.
    /// Overwrites any prior uncommitted rating for the same id.
    pub fn cache_answer(&mut self, id: CardId, rating: Rating) {
        self.in_progress.remove(&id);
        self.cached.insert(
            id,
            CachedAnswer {
                rating,
                cached_at: Utc::now(),
            },
        );
    }

    /// Reads a cached rating without consuming it.
    pub fn cached_answer(&self, id: CardId) -> Option<Rating> {
        self.cached.get(&id).map(|answer| answer.rating)
    }

    /// Single-consumption read of a cached rating. The entry is removed and
    /// counted as processed; a second pop for the same id yields `None`.
    pub fn pop_cached_answer(&mut self, id: CardId) -> Option<Rating> {
        let answer = self.cached.remove(&id)?;
        self.processed += 1;
        Some(answer.rating)
    }

    /// True when the id is queued, in progress, or awaiting submission.
    pub fn contains(&self, id: CardId) -> bool {
        self.in_progress.contains(&id)
            || self.cached.contains_key(&id)
            || self.queue.iter().any(|card| card.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Drops all queued cards and pending state.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_progress.clear();
        self.cached.clear();
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_length: self.queue.len(),
            in_progress_count: self.in_progress.len(),
            cached_count: self.cached.len(),
            processed_count: self.processed,
        }
    }
}
