//! Durable storage for saga progress.
//!
//! A [`SagaRecord`] is the persisted projection of one saga instance. The
//! [`SagaPersistence`] trait is the only boundary the orchestrator writes
//! through; [`InMemorySagaStore`] and [`PostgresSagaStore`] implement it.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use common::{SagaId, SagaState};
pub use error::{Result, SagaStoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use record::{SagaCheckpoint, SagaRecord, Version, lease_deadline};
pub use store::{SagaPersistence, SaveOptions};
