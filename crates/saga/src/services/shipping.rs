//! Shipping service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::context::CallContext;
use crate::error::SagaError;

/// Result of a successful shipment creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentResult {
    /// The tracking number assigned by the shipping service.
    pub tracking_number: String,
}

/// Trait for shipping operations.
#[async_trait]
pub trait ShippingService: Send + Sync {
    /// Creates a shipment for the saga's order, idempotent on the call's key.
    async fn create_shipment(&self, call: &CallContext) -> Result<ShipmentResult, SagaError>;

    /// Cancels a previously created shipment. Unknown tracking numbers are
    /// not an error.
    async fn cancel_shipment(&self, call: &CallContext, tracking_number: &str)
    -> Result<(), SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryShippingState {
    shipments: HashMap<String, String>,
    by_key: HashMap<String, String>,
    next_id: u32,
    create_calls: usize,
    fail_on_create: bool,
    fail_on_cancel: bool,
}

/// In-memory shipping service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingService {
    state: Arc<RwLock<InMemoryShippingState>>,
}

impl InMemoryShippingService {
    /// Creates a new in-memory shipping service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the service to fail every create_shipment call.
    pub async fn set_fail_on_create(&self, fail: bool) {
        self.state.write().await.fail_on_create = fail;
    }

    /// Configures the service to fail every cancel_shipment call.
    pub async fn set_fail_on_cancel(&self, fail: bool) {
        self.state.write().await.fail_on_cancel = fail;
    }

    /// Returns the number of active shipments.
    pub async fn shipment_count(&self) -> usize {
        self.state.read().await.shipments.len()
    }

    /// Returns true if a shipment exists with the given tracking number.
    pub async fn has_shipment(&self, tracking_number: &str) -> bool {
        self.state
            .read()
            .await
            .shipments
            .contains_key(tracking_number)
    }

    /// Number of create_shipment calls received.
    pub async fn create_calls(&self) -> usize {
        self.state.read().await.create_calls
    }
}

#[async_trait]
impl ShippingService for InMemoryShippingService {
    async fn create_shipment(&self, call: &CallContext) -> Result<ShipmentResult, SagaError> {
        let mut state = self.state.write().await;
        state.create_calls += 1;

        if let Some(tracking_number) = state.by_key.get(&call.idempotency_key) {
            return Ok(ShipmentResult {
                tracking_number: tracking_number.clone(),
            });
        }

        if state.fail_on_create {
            return Err(SagaError::ShippingService(
                "Shipping unavailable".to_string(),
            ));
        }

        state.next_id += 1;
        let tracking_number = format!("TRACK-{:04}", state.next_id);
        state
            .shipments
            .insert(tracking_number.clone(), call.correlation_id.clone());
        state
            .by_key
            .insert(call.idempotency_key.clone(), tracking_number.clone());

        tracing::debug!(
            saga_id = %call.saga_id,
            correlation_id = %call.correlation_id,
            %tracking_number,
            "shipment created"
        );
        Ok(ShipmentResult { tracking_number })
    }

    async fn cancel_shipment(
        &self,
        call: &CallContext,
        tracking_number: &str,
    ) -> Result<(), SagaError> {
        let mut state = self.state.write().await;

        if state.fail_on_cancel {
            return Err(SagaError::ShippingService(
                "Carrier rejected cancellation".to_string(),
            ));
        }

        if state.shipments.remove(tracking_number).is_some() {
            tracing::debug!(saga_id = %call.saga_id, tracking_number, "shipment cancelled");
        }
        Ok(())
    }
}
