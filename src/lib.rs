//! Layered study-session orchestration for producer-generated flashcards
//!
//! This crate drives a study session that can pause itself while an external
//! producer writes new vocabulary cards, detect their arrival, and study
//! them in isolated layers before resuming where it left off:
//! - Primary session control with pause/resume and deferred answer caching
//! - A LIFO delivery queue serving the most recently produced card first
//! - Baseline-diff polling with wall-clock timeout and bounded manual retries
//! - A layer stack that multiplexes the store's single-writer study session
//!
//! The storage engine and the producer sit behind async traits
//! ([`store::StoreClient`], [`producer::DefinitionProducer`]) with
//! reqwest-backed implementations.

pub mod cards;
pub mod layers;
pub mod orchestrator;
pub mod polling;
pub mod producer;
pub mod queue;
pub mod store;

pub use cards::{Card, CardId, CardPayload, CardStatus, CardSummary, DeckId, NoteId, Rating};
pub use layers::{
    LayerCoordinator, LayerError, LayerEvent, LayerFinish, LayerPhase, LayerView,
};
pub use orchestrator::{
    AnswerOutcome, OrchestratorConfig, OrchestratorError, OrchestratorStatus, PrimaryStatus,
    SessionOrchestrator,
};
pub use polling::{PollConfig, PollStatus, PollVerdict, PollingManager};
pub use producer::{DefinitionProducer, HttpProducer, ProduceRequest, ProducerError};
pub use queue::{CardQueue, QueueStatus};
pub use store::{FilteredSessionOptions, HttpStoreClient, StoreClient, StoreError, StudyAction};
