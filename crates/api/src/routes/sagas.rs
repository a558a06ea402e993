//! Saga start, inspection, cancellation and recovery endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::SagaId;
use saga::order_fulfillment::OrderRequest;
use saga::{
    InFlightSagas, InMemoryInterventionQueue, InMemoryInventoryService,
    InMemoryPaymentService, InMemoryShippingService, InterventionTicket, RecoveryReport,
    RetryPolicy, ReservationItem, SagaDefinition, SagaOrchestrator, SagaRecoveryService,
};
use saga_store::{SagaPersistence, SagaRecord};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<P: SagaPersistence> {
    pub store: P,
    pub definition: Arc<SagaDefinition>,
    pub recovery: Arc<SagaRecoveryService<P>>,
    pub inventory: InMemoryInventoryService,
    pub payment: InMemoryPaymentService,
    pub shipping: InMemoryShippingService,
    pub interventions: InMemoryInterventionQueue,
    /// Sagas executing in this process; shared with `recovery`.
    pub running: InFlightSagas,
    pub owner: String,
    pub lease: Duration,
    pub retry: RetryPolicy,
}

// -- Request types --

#[derive(Deserialize)]
pub struct StartOrderSagaRequest {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<ItemRequest>,
    pub amount_cents: i64,
}

#[derive(Deserialize)]
pub struct ItemRequest {
    pub sku: String,
    pub quantity: u32,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaStartedResponse {
    pub saga_id: String,
    pub correlation_id: String,
}

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_id: String,
    pub saga_type: String,
    pub correlation_id: String,
    pub state: String,
    pub completed_steps: Vec<String>,
    pub compensated_steps: Vec<String>,
    pub context: serde_json::Value,
    pub failure: Option<String>,
    pub compensation_error: Option<String>,
    pub version: i64,
    pub owner: Option<String>,
    pub recovery_attempts: u32,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub dead_letter_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SagaRecord> for SagaResponse {
    fn from(record: SagaRecord) -> Self {
        Self {
            saga_id: record.saga_id.to_string(),
            saga_type: record.saga_type,
            correlation_id: record.correlation_id,
            state: record.state.to_string(),
            completed_steps: record.completed_steps,
            compensated_steps: record.compensated_steps,
            context: record.context,
            failure: record.failure,
            compensation_error: record.compensation_error,
            version: record.version.as_i64(),
            owner: record.owner,
            recovery_attempts: record.recovery_attempts,
            dead_lettered_at: record.dead_lettered_at,
            dead_letter_reason: record.dead_letter_reason,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub saga_id: String,
    pub cancellation_requested: bool,
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    SagaId::parse(id).map_err(|_| ApiError::BadRequest(format!("Invalid saga ID: {id}")))
}

fn validate(req: &StartOrderSagaRequest) -> Result<(), ApiError> {
    if req.order_id.trim().is_empty() {
        return Err(ApiError::BadRequest("order_id must not be empty".to_string()));
    }
    if req.items.is_empty() {
        return Err(ApiError::BadRequest("at least one item is required".to_string()));
    }
    if req.items.iter().any(|item| item.quantity == 0) {
        return Err(ApiError::BadRequest("item quantity must be positive".to_string()));
    }
    if req.amount_cents <= 0 {
        return Err(ApiError::BadRequest("amount_cents must be positive".to_string()));
    }
    Ok(())
}

// -- Handlers --

/// POST /sagas/order-fulfillment: starts an order saga in the background.
#[tracing::instrument(skip(state, req), fields(order_id = %req.order_id))]
pub async fn start_order<P: SagaPersistence + Clone + 'static>(
    State(state): State<Arc<AppState<P>>>,
    Json(req): Json<StartOrderSagaRequest>,
) -> Result<(StatusCode, Json<SagaStartedResponse>), ApiError> {
    validate(&req)?;

    let request = OrderRequest {
        order_id: req.order_id,
        customer_id: req.customer_id,
        items: req
            .items
            .into_iter()
            .map(|item| ReservationItem::new(item.sku, item.quantity))
            .collect(),
        amount_cents: req.amount_cents,
    };
    let correlation_id = request.order_id.clone();
    let context = request.into_context()?;

    let orchestrator =
        SagaOrchestrator::new(Arc::clone(&state.definition), context, state.store.clone())?
            .with_owner(state.owner.clone())
            .with_lease(state.lease)
            .with_retry_policy(state.retry)
            .with_intervention_queue(Arc::new(state.interventions.clone()));
    let saga_id = orchestrator.saga_id();

    state
        .running
        .register(saga_id, orchestrator.cancellation())
        .await;

    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        match orchestrator.execute().await {
            Ok(result) => {
                tracing::debug!(%saga_id, state = %result.state, "saga task finished");
            }
            Err(e) => {
                tracing::error!(%saga_id, error = %e, "saga task aborted");
            }
        }
        task_state.running.deregister(saga_id).await;
    });

    tracing::info!(%saga_id, "order saga accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SagaStartedResponse {
            saga_id: saga_id.to_string(),
            correlation_id,
        }),
    ))
}

/// GET /sagas/{id}: returns the persisted record of a saga.
#[tracing::instrument(skip(state))]
pub async fn get<P: SagaPersistence + Clone + 'static>(
    State(state): State<Arc<AppState<P>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let record = state
        .store
        .find_by_id(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga not found: {saga_id}")))?;

    Ok(Json(record.into()))
}

/// GET /sagas: lists sagas that have not reached a terminal state.
#[tracing::instrument(skip(state))]
pub async fn list_incomplete<P: SagaPersistence + Clone + 'static>(
    State(state): State<Arc<AppState<P>>>,
) -> Result<Json<Vec<SagaResponse>>, ApiError> {
    let records = state.store.find_incomplete().await?;
    Ok(Json(records.into_iter().map(SagaResponse::from).collect()))
}

/// GET /sagas/dead-lettered: lists sagas waiting for an operator.
#[tracing::instrument(skip(state))]
pub async fn list_dead_lettered<P: SagaPersistence + Clone + 'static>(
    State(state): State<Arc<AppState<P>>>,
) -> Result<Json<Vec<SagaResponse>>, ApiError> {
    let records = state.store.find_dead_lettered().await?;
    Ok(Json(records.into_iter().map(SagaResponse::from).collect()))
}

/// POST /sagas/{id}/cancel: asks a saga running in this process to stop.
///
/// The saga halts at its next step boundary and compensates what it completed.
#[tracing::instrument(skip(state))]
pub async fn cancel<P: SagaPersistence + Clone + 'static>(
    State(state): State<Arc<AppState<P>>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let saga_id = parse_saga_id(&id)?;

    if state.running.cancel(saga_id).await {
        tracing::info!(%saga_id, "saga cancellation requested");
        return Ok((
            StatusCode::ACCEPTED,
            Json(CancelResponse {
                saga_id: saga_id.to_string(),
                cancellation_requested: true,
            }),
        ));
    }

    match state.store.find_by_id(saga_id).await? {
        Some(record) => Err(ApiError::Conflict(format!(
            "Saga {saga_id} is not running in this process (state: {})",
            record.state
        ))),
        None => Err(ApiError::NotFound(format!("Saga not found: {saga_id}"))),
    }
}

/// POST /sagas/recover: runs one recovery sweep now.
#[tracing::instrument(skip(state))]
pub async fn recover<P: SagaPersistence + Clone + 'static>(
    State(state): State<Arc<AppState<P>>>,
) -> Result<Json<RecoveryReport>, ApiError> {
    let report = state.recovery.recover_all().await?;
    Ok(Json(report))
}

/// GET /interventions: lists tickets raised for failed compensations.
pub async fn interventions<P: SagaPersistence + Clone + 'static>(
    State(state): State<Arc<AppState<P>>>,
) -> Json<Vec<InterventionTicket>> {
    Json(state.interventions.tickets().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StartOrderSagaRequest {
        StartOrderSagaRequest {
            order_id: "order-1".to_string(),
            customer_id: "cust-1".to_string(),
            items: vec![ItemRequest {
                sku: "SKU-1".to_string(),
                quantity: 1,
            }],
            amount_cents: 100,
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_request() {
        assert!(validate(&request()).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut req = request();
        req.items.clear();
        assert!(matches!(validate(&req), Err(ApiError::BadRequest(_))));

        let mut req = request();
        req.amount_cents = 0;
        assert!(matches!(validate(&req), Err(ApiError::BadRequest(_))));

        let mut req = request();
        req.order_id = "  ".to_string();
        assert!(matches!(validate(&req), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_parse_saga_id_rejects_garbage() {
        assert!(matches!(parse_saga_id("nope"), Err(ApiError::BadRequest(_))));
        let id = SagaId::new();
        assert_eq!(parse_saga_id(&id.to_string()).unwrap(), id);
    }
}
