//! Liveness endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga_store::SagaPersistence;
use serde::Serialize;

use super::sagas::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Lease owner name of this process.
    pub owner: String,
    /// Sagas currently executing in this process.
    pub in_flight: usize,
}

/// GET /health: liveness plus this orchestrator's identity and load.
pub async fn check<P: SagaPersistence + Clone + 'static>(
    State(state): State<Arc<AppState<P>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        owner: state.owner.clone(),
        in_flight: state.running.len().await,
    })
}
