//! Saga orchestration engine.
//!
//! A saga is a long-running business transaction split into ordered local
//! steps, each committed on its own, with a compensating action standing in
//! for rollback. [`SagaOrchestrator`] runs the steps of a [`SagaDefinition`]
//! in order, persists progress after every transition through
//! [`saga_store::SagaPersistence`], and on failure compensates the completed
//! steps in reverse completion order. [`SagaRecoveryService`] picks up
//! sagas left incomplete by a crashed process.
//!
//! The order fulfillment saga follows these steps:
//! 1. Reserve inventory
//! 2. Process payment
//! 3. Create shipment

pub mod context;
pub mod definition;
pub mod error;
pub mod escalation;
pub mod events;
pub mod orchestrator;
pub mod order_fulfillment;
pub mod parallel;
pub mod recovery;
pub mod retry;
pub mod services;
pub mod step;

pub use common::{SagaId, SagaState};
pub use context::{CallContext, SagaContext};
pub use definition::{SagaCatalog, SagaDefinition, SagaDefinitionBuilder};
pub use error::{Result, SagaError};
pub use escalation::{Escalation, InMemoryInterventionQueue, InterventionQueue, InterventionTicket};
pub use events::SagaEvent;
pub use orchestrator::{
    CANCELLED, CancellationHandle, InFlightSagas, OUTCOME_UNKNOWN, SagaOrchestrator, SagaResult,
    StepFailure,
};
pub use order_fulfillment::OrderRequest;
pub use parallel::ParallelGroup;
pub use recovery::{RecoveryReport, SagaRecoveryService};
pub use retry::RetryPolicy;
pub use services::{
    InMemoryInventoryService, InMemoryPaymentService, InMemoryShippingService, InventoryService,
    PaymentResult, PaymentService, ReservationItem, ReservationResult, ShipmentResult,
    ShippingService,
};
pub use step::{DEFAULT_STEP_TIMEOUT, SagaStep, StepOutput, StepResult};
