//! Order fulfillment saga: reserve inventory, charge payment, create shipment.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::SagaContext;
use crate::definition::SagaDefinition;
use crate::error::Result;
use crate::services::{InventoryService, PaymentService, ReservationItem, ShippingService};
use crate::step::{SagaStep, StepOutput, StepResult};

/// The saga type identifier for order fulfillment.
pub const SAGA_TYPE: &str = "OrderFulfillment";

/// Step name: Reserve inventory for the order.
pub const STEP_RESERVE_INVENTORY: &str = "reserve_inventory";

/// Step name: Process payment for the order.
pub const STEP_PROCESS_PAYMENT: &str = "process_payment";

/// Step name: Create shipment for the order.
pub const STEP_CREATE_SHIPMENT: &str = "create_shipment";

// Context keys
pub const KEY_ITEMS: &str = "items";
pub const KEY_CUSTOMER_ID: &str = "customer_id";
pub const KEY_AMOUNT_CENTS: &str = "amount_cents";
pub const KEY_RESERVATION_ID: &str = "reservation_id";
pub const KEY_PAYMENT_ID: &str = "payment_id";
pub const KEY_TRACKING_NUMBER: &str = "tracking_number";

const SERVICE_TIMEOUT: Duration = Duration::from_secs(10);

/// Input of one order fulfillment saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Becomes the saga's correlation ID.
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<ReservationItem>,
    pub amount_cents: i64,
}

impl OrderRequest {
    /// Creates the saga context carrying this order.
    pub fn into_context(self) -> Result<SagaContext> {
        let mut ctx = SagaContext::new(SAGA_TYPE, self.order_id);
        ctx.put(KEY_ITEMS, self.items)?;
        ctx.put(KEY_CUSTOMER_ID, self.customer_id)?;
        ctx.put(KEY_AMOUNT_CENTS, self.amount_cents)?;
        Ok(ctx)
    }
}

/// Builds the order fulfillment definition over the given services.
pub fn definition<I, P, S>(inventory: I, payment: P, shipping: S) -> Result<SagaDefinition>
where
    I: InventoryService + 'static,
    P: PaymentService + 'static,
    S: ShippingService + 'static,
{
    SagaDefinition::builder(SAGA_TYPE)
        .step(ReserveInventoryStep::new(inventory))
        .step(ChargePaymentStep::new(payment))
        .step(CreateShipmentStep::new(shipping))
        .build()
}

fn missing(key: &str) -> StepResult {
    StepResult::failure(format!("missing context value '{key}'"))
}

/// Reserves the order's items; compensated by releasing the reservation.
pub struct ReserveInventoryStep<I> {
    inventory: I,
}

impl<I: InventoryService> ReserveInventoryStep<I> {
    pub fn new(inventory: I) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl<I: InventoryService> SagaStep for ReserveInventoryStep<I> {
    fn name(&self) -> &str {
        STEP_RESERVE_INVENTORY
    }

    async fn execute(&self, ctx: &SagaContext) -> StepResult {
        let items: Vec<ReservationItem> = match ctx.get_as(KEY_ITEMS) {
            Ok(Some(items)) => items,
            Ok(None) => return missing(KEY_ITEMS),
            Err(e) => return StepResult::failure(e.to_string()),
        };
        if items.is_empty() {
            return StepResult::failure("Order has no items");
        }

        let call = ctx.call_context(STEP_RESERVE_INVENTORY);
        match self.inventory.reserve(&call, &items).await {
            Ok(result) => StepResult::success_with(KEY_RESERVATION_ID, result.reservation_id),
            Err(e) => StepResult::failure(e.to_string()),
        }
    }

    async fn compensate(&self, ctx: &SagaContext) -> StepResult {
        let Some(reservation_id) = ctx.get_str(KEY_RESERVATION_ID) else {
            return StepResult::success();
        };
        let call = ctx.call_context(STEP_RESERVE_INVENTORY);
        self.inventory
            .release(&call, reservation_id)
            .await
            .map(|()| StepOutput::new())
            .into()
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        SERVICE_TIMEOUT
    }
}

/// Charges the customer; compensated by a refund.
pub struct ChargePaymentStep<P> {
    payment: P,
}

impl<P: PaymentService> ChargePaymentStep<P> {
    pub fn new(payment: P) -> Self {
        Self { payment }
    }
}

#[async_trait]
impl<P: PaymentService> SagaStep for ChargePaymentStep<P> {
    fn name(&self) -> &str {
        STEP_PROCESS_PAYMENT
    }

    async fn execute(&self, ctx: &SagaContext) -> StepResult {
        let Some(customer_id) = ctx.get_str(KEY_CUSTOMER_ID) else {
            return missing(KEY_CUSTOMER_ID);
        };
        let amount_cents: i64 = match ctx.get_as(KEY_AMOUNT_CENTS) {
            Ok(Some(amount)) => amount,
            Ok(None) => return missing(KEY_AMOUNT_CENTS),
            Err(e) => return StepResult::failure(e.to_string()),
        };

        let call = ctx.call_context(STEP_PROCESS_PAYMENT);
        match self.payment.charge(&call, customer_id, amount_cents).await {
            Ok(result) => StepResult::success_with(KEY_PAYMENT_ID, result.payment_id),
            Err(e) => StepResult::failure(e.to_string()),
        }
    }

    async fn compensate(&self, ctx: &SagaContext) -> StepResult {
        let Some(payment_id) = ctx.get_str(KEY_PAYMENT_ID) else {
            return StepResult::success();
        };
        let call = ctx.call_context(STEP_PROCESS_PAYMENT);
        self.payment
            .refund(&call, payment_id)
            .await
            .map(|()| StepOutput::new())
            .into()
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        SERVICE_TIMEOUT
    }
}

/// Creates the shipment; compensated by cancelling it.
pub struct CreateShipmentStep<S> {
    shipping: S,
}

impl<S: ShippingService> CreateShipmentStep<S> {
    pub fn new(shipping: S) -> Self {
        Self { shipping }
    }
}

#[async_trait]
impl<S: ShippingService> SagaStep for CreateShipmentStep<S> {
    fn name(&self) -> &str {
        STEP_CREATE_SHIPMENT
    }

    async fn execute(&self, ctx: &SagaContext) -> StepResult {
        let call = ctx.call_context(STEP_CREATE_SHIPMENT);
        match self.shipping.create_shipment(&call).await {
            Ok(result) => StepResult::success_with(KEY_TRACKING_NUMBER, result.tracking_number),
            Err(e) => StepResult::failure(e.to_string()),
        }
    }

    async fn compensate(&self, ctx: &SagaContext) -> StepResult {
        let Some(tracking_number) = ctx.get_str(KEY_TRACKING_NUMBER) else {
            return StepResult::success();
        };
        let call = ctx.call_context(STEP_CREATE_SHIPMENT);
        self.shipping
            .cancel_shipment(&call, tracking_number)
            .await
            .map(|()| StepOutput::new())
            .into()
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        SERVICE_TIMEOUT
    }
}
