//! Dispatch of definition-production requests.
//!
//! The producer is fire-and-forget: `produce` returning `Ok` means the
//! request was accepted, never that cards exist. Card arrival is observed
//! solely by polling the store for the request's tag.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::cards::DeckId;

pub mod context;
pub mod http;

pub use context::build_card_context;
pub use http::HttpProducer;

pub type Result<T> = std::result::Result<T, ProducerError>;

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("producer unreachable: {0}")]
    Unavailable(String),
    #[error("producer rejected the request: {0}")]
    Rejected(String),
}

/// One production request, correlated by `id` in producer logs.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub id: Uuid,
    pub words: Vec<String>,
    /// Context block built from the card the words came from.
    pub context: String,
    /// Tag every produced card must carry; polling keys on it.
    pub tag: String,
    /// Deck the produced cards land in.
    pub target_scope_id: DeckId,
    pub issued_at: DateTime<Utc>,
}

impl ProduceRequest {
    pub fn new(
        words: Vec<String>,
        context: String,
        tag: String,
        target_scope_id: DeckId,
    ) -> Self {
        ProduceRequest {
            id: Uuid::new_v4(),
            words,
            context,
            tag,
            target_scope_id,
            issued_at: Utc::now(),
        }
    }
}

/// Boundary to the external definition producer.
#[async_trait]
pub trait DefinitionProducer: Send + Sync {
    /// Dispatches one request. `Ok` promises acceptance, not completion.
    async fn produce(&self, request: &ProduceRequest) -> Result<()>;
}
