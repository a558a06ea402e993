use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// The stored version did not match the version the writer expected.
    /// Another writer advanced the record in the meantime.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// Another orchestrator holds an unexpired lease on the record.
    #[error("Saga {saga_id} is leased by {owner}")]
    LeaseHeld { saga_id: SagaId, owner: String },

    /// No record exists for the saga.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A stored row could not be mapped back into a record.
    #[error("Corrupt saga record {saga_id}: {reason}")]
    Corrupt { saga_id: SagaId, reason: String },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaStoreError {
    /// Returns true if the error means another writer owns the record.
    pub fn is_exclusivity_loss(&self) -> bool {
        matches!(
            self,
            SagaStoreError::ConcurrencyConflict { .. } | SagaStoreError::LeaseHeld { .. }
        )
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, SagaStoreError>;
