//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::context::CallContext;
use crate::error::SagaError;

/// Result of a successful inventory reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationResult {
    /// The reservation ID assigned by the inventory service.
    pub reservation_id: String,
}

/// An item to reserve in inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationItem {
    /// Stock keeping unit of the product.
    pub sku: String,
    /// Quantity to reserve.
    pub quantity: u32,
}

impl ReservationItem {
    pub fn new(sku: impl Into<String>, quantity: u32) -> Self {
        Self {
            sku: sku.into(),
            quantity,
        }
    }
}

/// Trait for inventory management operations.
///
/// Every call carries the saga's [`CallContext`]. `reserve` is idempotent on
/// `call.idempotency_key`; `release` succeeds for unknown reservations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves inventory for the given items.
    async fn reserve(
        &self,
        call: &CallContext,
        items: &[ReservationItem],
    ) -> Result<ReservationResult, SagaError>;

    /// Releases a previously made reservation.
    async fn release(&self, call: &CallContext, reservation_id: &str) -> Result<(), SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<String, (String, Vec<ReservationItem>)>,
    by_key: HashMap<String, String>,
    next_id: u32,
    reserve_calls: usize,
    release_calls: usize,
    fail_on_reserve: bool,
    failing_releases: u32,
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the service to fail every reserve call.
    pub async fn set_fail_on_reserve(&self, fail: bool) {
        self.state.write().await.fail_on_reserve = fail;
    }

    /// Configures the service to fail every release call.
    pub async fn set_fail_on_release(&self, fail: bool) {
        self.state.write().await.failing_releases = if fail { u32::MAX } else { 0 };
    }

    /// Fails the next `times` release calls, then recovers.
    pub async fn fail_next_releases(&self, times: u32) {
        self.state.write().await.failing_releases = times;
    }

    /// Returns the number of active reservations.
    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }

    /// Returns true if a reservation exists with the given ID.
    pub async fn has_reservation(&self, reservation_id: &str) -> bool {
        self.state
            .read()
            .await
            .reservations
            .contains_key(reservation_id)
    }

    /// Number of reserve calls received, including replays.
    pub async fn reserve_calls(&self) -> usize {
        self.state.read().await.reserve_calls
    }

    /// Number of release calls received, including failed ones.
    pub async fn release_calls(&self) -> usize {
        self.state.read().await.release_calls
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(
        &self,
        call: &CallContext,
        items: &[ReservationItem],
    ) -> Result<ReservationResult, SagaError> {
        let mut state = self.state.write().await;
        state.reserve_calls += 1;

        if let Some(reservation_id) = state.by_key.get(&call.idempotency_key) {
            tracing::debug!(
                saga_id = %call.saga_id,
                correlation_id = %call.correlation_id,
                reservation_id,
                "replayed inventory reservation"
            );
            return Ok(ReservationResult {
                reservation_id: reservation_id.clone(),
            });
        }

        if state.fail_on_reserve {
            return Err(SagaError::InventoryService(
                "Insufficient stock".to_string(),
            ));
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state.reservations.insert(
            reservation_id.clone(),
            (call.correlation_id.clone(), items.to_vec()),
        );
        state
            .by_key
            .insert(call.idempotency_key.clone(), reservation_id.clone());

        tracing::debug!(
            saga_id = %call.saga_id,
            correlation_id = %call.correlation_id,
            %reservation_id,
            "inventory reserved"
        );
        Ok(ReservationResult { reservation_id })
    }

    async fn release(&self, call: &CallContext, reservation_id: &str) -> Result<(), SagaError> {
        let mut state = self.state.write().await;
        state.release_calls += 1;

        if state.failing_releases > 0 {
            state.failing_releases -= 1;
            return Err(SagaError::InventoryService(
                "Inventory backend unavailable".to_string(),
            ));
        }

        if state.reservations.remove(reservation_id).is_none() {
            tracing::debug!(
                saga_id = %call.saga_id,
                reservation_id,
                "reservation already released"
            );
        }
        Ok(())
    }
}
