//! The layer stack: named batches of produced cards, polled for arrival and
//! studied through isolated tag-filtered sessions.

pub mod coordinator;
pub mod models;

pub use coordinator::LayerCoordinator;
pub use models::{
    Layer, LayerError, LayerEvent, LayerFinish, LayerPhase, LayerView, Result,
};
