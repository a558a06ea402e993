//! Saga error types.

use common::{InvalidTransition, SagaId, SagaState};
use saga_store::SagaStoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
///
/// Step and compensation failures are not errors: they end up in a
/// `SagaResult`. These variants cover infrastructure faults, loss of
/// exclusivity, and integration defects.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The state machine was asked to take an edge it does not have.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// `execute` was called on a saga that is no longer Pending.
    #[error("Saga is not pending (state: {0})")]
    NotPending(SagaState),

    /// `resume` was called on a saga in a terminal state.
    #[error("Saga is not resumable from state {0}")]
    NotResumable(SagaState),

    /// The saga was assembled with a context of a different saga type.
    #[error("Saga type mismatch: definition is '{definition}', context is '{context}'")]
    SagaTypeMismatch { definition: String, context: String },

    /// No definition is registered for the saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// A step name is not part of the saga definition.
    #[error("Unknown step '{step}' in saga type '{saga_type}'")]
    UnknownStep { saga_type: String, step: String },

    /// A saga definition declares the same step name twice.
    #[error("Duplicate step name '{0}'")]
    DuplicateStep(String),

    /// A step name is empty or contains the `": "` separator of persisted
    /// failure text.
    #[error("Invalid step name '{0}'")]
    InvalidStepName(String),

    /// A saga definition has no steps.
    #[error("Saga type '{0}' has no steps")]
    EmptyDefinition(String),

    /// A context key was about to be overwritten with a different value.
    #[error("Context key '{key}' is already set to a different value")]
    ContextKeyConflict { key: String },

    /// A persisted record does not describe a state this engine can resume.
    #[error("Corrupt saga record {saga_id}: {reason}")]
    CorruptRecord { saga_id: SagaId, reason: String },

    /// Another orchestrator took over the saga; this one must stop.
    #[error("Lost exclusive ownership of saga {0}")]
    ExclusivityLost(SagaId),

    /// Inventory service error.
    #[error("Inventory service error: {0}")]
    InventoryService(String),

    /// Payment service error.
    #[error("Payment service error: {0}")]
    PaymentService(String),

    /// Shipping service error.
    #[error("Shipping service error: {0}")]
    ShippingService(String),

    /// The manual-intervention queue rejected a ticket.
    #[error("Intervention queue error: {0}")]
    InterventionQueue(String),

    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] SagaStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
