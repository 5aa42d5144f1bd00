//! Access to the external flashcard storage engine.
//!
//! [`client::StoreClient`] is the seam: listings, filtered-session creation
//! and study actions. [`http::HttpStoreClient`] talks to a real engine;
//! [`memory::MemoryStore`] stands in under test.

pub mod client;
pub mod http;
#[cfg(test)]
pub mod memory;

pub use client::{FilteredSessionOptions, StoreClient, StoreError, StudyAction};
pub use http::HttpStoreClient;
