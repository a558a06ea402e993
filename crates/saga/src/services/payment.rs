//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::context::CallContext;
use crate::error::SagaError;

/// Result of a successful payment charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentResult {
    /// The payment ID assigned by the payment service.
    pub payment_id: String,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges a customer. Idempotent on `call.idempotency_key`: a replay
    /// returns the original payment without charging again.
    async fn charge(
        &self,
        call: &CallContext,
        customer_id: &str,
        amount_cents: i64,
    ) -> Result<PaymentResult, SagaError>;

    /// Refunds a previously made payment. Unknown or already refunded
    /// payments are not an error.
    async fn refund(&self, call: &CallContext, payment_id: &str) -> Result<(), SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, (String, i64)>,
    by_key: HashMap<String, String>,
    next_id: u32,
    charges: usize,
    refund_calls: usize,
    fail_on_charge: bool,
    fail_on_refund: bool,
}

/// In-memory payment service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the service to decline every charge.
    pub async fn set_fail_on_charge(&self, fail: bool) {
        self.state.write().await.fail_on_charge = fail;
    }

    /// Configures the service to fail every refund.
    pub async fn set_fail_on_refund(&self, fail: bool) {
        self.state.write().await.fail_on_refund = fail;
    }

    /// Returns the number of active payments.
    pub async fn payment_count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    /// Returns true if a payment exists with the given ID.
    pub async fn has_payment(&self, payment_id: &str) -> bool {
        self.state.read().await.payments.contains_key(payment_id)
    }

    /// Number of charges actually made. Replays are not counted.
    pub async fn charge_count(&self) -> usize {
        self.state.read().await.charges
    }

    /// Number of refund calls received.
    pub async fn refund_calls(&self) -> usize {
        self.state.read().await.refund_calls
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(
        &self,
        call: &CallContext,
        customer_id: &str,
        amount_cents: i64,
    ) -> Result<PaymentResult, SagaError> {
        let mut state = self.state.write().await;

        if let Some(payment_id) = state.by_key.get(&call.idempotency_key) {
            return Ok(PaymentResult {
                payment_id: payment_id.clone(),
            });
        }

        if state.fail_on_charge {
            return Err(SagaError::PaymentService("Payment declined".to_string()));
        }
        if amount_cents <= 0 {
            return Err(SagaError::PaymentService(format!(
                "Invalid amount: {amount_cents}"
            )));
        }

        state.next_id += 1;
        state.charges += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state
            .payments
            .insert(payment_id.clone(), (customer_id.to_string(), amount_cents));
        state
            .by_key
            .insert(call.idempotency_key.clone(), payment_id.clone());

        tracing::debug!(
            saga_id = %call.saga_id,
            correlation_id = %call.correlation_id,
            %payment_id,
            amount_cents,
            "payment charged"
        );
        Ok(PaymentResult { payment_id })
    }

    async fn refund(&self, call: &CallContext, payment_id: &str) -> Result<(), SagaError> {
        let mut state = self.state.write().await;
        state.refund_calls += 1;

        if state.fail_on_refund {
            return Err(SagaError::PaymentService(
                "Refund gateway unavailable".to_string(),
            ));
        }

        if state.payments.remove(payment_id).is_some() {
            tracing::debug!(saga_id = %call.saga_id, payment_id, "payment refunded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::SagaId;

    use super::*;

    fn call() -> CallContext {
        let saga_id = SagaId::new();
        CallContext {
            saga_id,
            correlation_id: "order-1".to_string(),
            idempotency_key: format!("{saga_id}:process_payment"),
        }
    }

    #[tokio::test]
    async fn test_charge_and_refund() {
        let service = InMemoryPaymentService::new();
        let call = call();

        let result = service.charge(&call, "cust-1", 5000).await.unwrap();
        assert!(result.payment_id.starts_with("PAY-"));
        assert_eq!(service.payment_count().await, 1);
        assert!(service.has_payment(&result.payment_id).await);

        service.refund(&call, &result.payment_id).await.unwrap();
        assert_eq!(service.payment_count().await, 0);
    }

    #[tokio::test]
    async fn test_double_charge_does_not_occur() {
        let service = InMemoryPaymentService::new();
        let call = call();

        let first = service.charge(&call, "cust-1", 5000).await.unwrap();
        let second = service.charge(&call, "cust-1", 5000).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.charge_count().await, 1);
    }

    #[tokio::test]
    async fn test_refund_twice_succeeds() {
        let service = InMemoryPaymentService::new();
        let call = call();
        let result = service.charge(&call, "cust-1", 100).await.unwrap();

        service.refund(&call, &result.payment_id).await.unwrap();
        service.refund(&call, &result.payment_id).await.unwrap();
        assert_eq!(service.refund_calls().await, 2);
    }

    #[tokio::test]
    async fn test_fail_on_charge() {
        let service = InMemoryPaymentService::new();
        service.set_fail_on_charge(true).await;

        assert!(service.charge(&call(), "cust-1", 5000).await.is_err());
        assert_eq!(service.payment_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_positive_amount_rejected() {
        let service = InMemoryPaymentService::new();
        assert!(service.charge(&call(), "cust-1", 0).await.is_err());
    }
}
