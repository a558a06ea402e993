//! Shared types for the saga orchestration engine.

pub mod state;
pub mod types;

pub use state::{InvalidTransition, SagaState};
pub use types::SagaId;
