//! Escalation of sagas whose compensation could not be completed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::SagaError;

/// Everything an operator needs to resolve a CompensationFailed saga by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionTicket {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub correlation_id: String,
    pub failed_step: String,
    pub step_error: String,
    pub compensation_step: String,
    pub compensation_error: String,
    /// Completed steps that were never compensated, most recent first.
    pub uncompensated_steps: Vec<String>,
    pub raised_at: DateTime<Utc>,
}

/// Where an escalated saga was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Escalation {
    /// A ticket was placed on the manual-intervention queue. The record is
    /// dead-lettered as well.
    ManualIntervention,
    /// The saga record was marked dead-lettered.
    DeadLettered,
}

/// A queue of sagas waiting for a human.
#[async_trait]
pub trait InterventionQueue: Send + Sync {
    async fn enqueue(&self, ticket: InterventionTicket) -> Result<(), SagaError>;
}

/// In-memory intervention queue.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInterventionQueue {
    tickets: Arc<RwLock<Vec<InterventionTicket>>>,
    reject: Arc<RwLock<bool>>,
}

impl InMemoryInterventionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all tickets, oldest first.
    pub async fn tickets(&self) -> Vec<InterventionTicket> {
        self.tickets.read().await.clone()
    }

    /// Makes every later `enqueue` fail, to exercise the dead-letter fallback.
    pub async fn set_reject(&self, reject: bool) {
        *self.reject.write().await = reject;
    }
}

#[async_trait]
impl InterventionQueue for InMemoryInterventionQueue {
    async fn enqueue(&self, ticket: InterventionTicket) -> Result<(), SagaError> {
        if *self.reject.read().await {
            return Err(SagaError::InterventionQueue("queue unavailable".to_string()));
        }
        self.tickets.write().await.push(ticket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> InterventionTicket {
        InterventionTicket {
            saga_id: SagaId::new(),
            saga_type: "OrderFulfillment".to_string(),
            correlation_id: "order-1".to_string(),
            failed_step: "create_shipment".to_string(),
            step_error: "Shipping unavailable".to_string(),
            compensation_step: "reserve_inventory".to_string(),
            compensation_error: "Inventory service error: timeout".to_string(),
            uncompensated_steps: vec!["reserve_inventory".to_string()],
            raised_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_list() {
        let queue = InMemoryInterventionQueue::new();
        let t = ticket();
        queue.enqueue(t.clone()).await.unwrap();
        assert_eq!(queue.tickets().await, vec![t]);
    }

    #[tokio::test]
    async fn test_reject() {
        let queue = InMemoryInterventionQueue::new();
        queue.set_reject(true).await;
        assert!(queue.enqueue(ticket()).await.is_err());
        assert!(queue.tickets().await.is_empty());
    }
}
