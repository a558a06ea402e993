//! Shared state for one saga run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// Identity and data bag for one saga instance.
///
/// Steps read their inputs from the data bag and hand their outputs back to
/// the orchestrator, which merges them in with [`SagaContext::merge`]. A key,
/// once set, can only be set again to the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaContext {
    saga_id: SagaId,
    saga_type: String,
    correlation_id: String,
    started_at: DateTime<Utc>,
    data: BTreeMap<String, serde_json::Value>,
}

/// Identifiers every outbound call made on behalf of a step should carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub saga_id: SagaId,
    pub correlation_id: String,
    /// Deterministic key for this saga + step; see [`SagaContext::idempotency_key`].
    pub idempotency_key: String,
}

impl SagaContext {
    /// Creates a context for a new saga instance.
    pub fn new(saga_type: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self::with_id(SagaId::new(), saga_type, correlation_id)
    }

    /// Creates a context with a caller-chosen saga ID.
    pub fn with_id(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            saga_id,
            saga_type: saga_type.into(),
            correlation_id: correlation_id.into(),
            started_at: Utc::now(),
            data: BTreeMap::new(),
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns the raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Returns the string stored under `key`, if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Deserializes the value stored under `key`.
    ///
    /// Returns `Ok(None)` if the key is absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SagaError> {
        self.data
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(SagaError::from)
    }

    /// Returns true if `key` is set.
    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Returns the whole data bag.
    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }

    /// Sets `key` to `value`.
    ///
    /// Setting a key again with an equal value is a no-op, so re-running an
    /// idempotent step is harmless. A different value is rejected.
    pub fn put(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<(), SagaError> {
        let key = key.into();
        let value = serde_json::to_value(value)?;
        match self.data.get(&key) {
            Some(existing) if *existing == value => Ok(()),
            Some(_) => Err(SagaError::ContextKeyConflict { key }),
            None => {
                self.data.insert(key, value);
                Ok(())
            }
        }
    }

    /// Merges a set of step outputs, rejecting the whole batch on any conflict.
    pub fn merge(&mut self, outputs: &BTreeMap<String, serde_json::Value>) -> Result<(), SagaError> {
        if let Some(key) = outputs
            .iter()
            .find(|(k, v)| self.data.get(*k).is_some_and(|existing| existing != *v))
            .map(|(k, _)| k.clone())
        {
            return Err(SagaError::ContextKeyConflict { key });
        }
        for (key, value) in outputs {
            self.data.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    /// Deterministic idempotency key for `step` within this saga.
    pub fn idempotency_key(&self, step: &str) -> String {
        format!("{}:{}", self.saga_id, step)
    }

    /// Builds the identifiers an outbound call for `step` should carry.
    pub fn call_context(&self, step: &str) -> CallContext {
        CallContext {
            saga_id: self.saga_id,
            correlation_id: self.correlation_id.clone(),
            idempotency_key: self.idempotency_key(step),
        }
    }

    /// Serializes the context for persistence.
    pub fn to_value(&self) -> Result<serde_json::Value, SagaError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Restores a context from its persisted form.
    pub fn from_value(value: serde_json::Value) -> Result<Self, SagaError> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_context_identity() {
        let ctx = SagaContext::new("OrderFulfillment", "order-1");
        assert_eq!(ctx.saga_type(), "OrderFulfillment");
        assert_eq!(ctx.correlation_id(), "order-1");
        assert!(ctx.data().is_empty());
    }

    #[test]
    fn test_put_and_get() {
        let mut ctx = SagaContext::new("T", "c");
        ctx.put("reservation_id", "RES-0001").unwrap();
        ctx.put("amount_cents", 4500).unwrap();

        assert_eq!(ctx.get_str("reservation_id"), Some("RES-0001"));
        assert_eq!(ctx.get_as::<i64>("amount_cents").unwrap(), Some(4500));
        assert_eq!(ctx.get_as::<i64>("missing").unwrap(), None);
        assert!(ctx.get_as::<i64>("reservation_id").is_err());
    }

    #[test]
    fn test_put_same_value_is_noop() {
        let mut ctx = SagaContext::new("T", "c");
        ctx.put("payment_id", "PAY-1").unwrap();
        ctx.put("payment_id", "PAY-1").unwrap();
        assert_eq!(ctx.get_str("payment_id"), Some("PAY-1"));
    }

    #[test]
    fn test_put_conflicting_value_is_rejected() {
        let mut ctx = SagaContext::new("T", "c");
        ctx.put("payment_id", "PAY-1").unwrap();
        let err = ctx.put("payment_id", "PAY-2").unwrap_err();
        assert!(matches!(err, SagaError::ContextKeyConflict { ref key } if key == "payment_id"));
        assert_eq!(ctx.get_str("payment_id"), Some("PAY-1"));
    }

    #[test]
    fn test_merge_is_all_or_nothing() {
        let mut ctx = SagaContext::new("T", "c");
        ctx.put("a", 1).unwrap();

        let outputs = BTreeMap::from([("b".to_string(), json!(2)), ("a".to_string(), json!(9))]);
        assert!(ctx.merge(&outputs).is_err());
        assert!(!ctx.contains("b"));

        let outputs = BTreeMap::from([("b".to_string(), json!(2)), ("a".to_string(), json!(1))]);
        ctx.merge(&outputs).unwrap();
        assert_eq!(ctx.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let ctx = SagaContext::new("T", "c");
        let key = ctx.idempotency_key("process_payment");
        assert_eq!(key, ctx.idempotency_key("process_payment"));
        assert_eq!(key, format!("{}:process_payment", ctx.saga_id()));
        assert_ne!(key, ctx.idempotency_key("reserve_inventory"));
    }

    #[test]
    fn test_call_context_carries_correlation() {
        let ctx = SagaContext::new("T", "order-9");
        let call = ctx.call_context("create_shipment");
        assert_eq!(call.saga_id, ctx.saga_id());
        assert_eq!(call.correlation_id, "order-9");
        assert_eq!(call.idempotency_key, ctx.idempotency_key("create_shipment"));
    }

    #[test]
    fn test_value_round_trip_preserves_identity() {
        let mut ctx = SagaContext::new("T", "c");
        ctx.put("items", json!([{"sku": "SKU-1"}])).unwrap();

        let restored = SagaContext::from_value(ctx.to_value().unwrap()).unwrap();
        assert_eq!(restored, ctx);
    }
}
