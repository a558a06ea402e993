//! HTTP API server with observability for the saga orchestrator.
//!
//! Provides REST endpoints to start, inspect, cancel and recover sagas,
//! with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    InFlightSagas, InMemoryInterventionQueue, InMemoryInventoryService, InMemoryPaymentService,
    InMemoryShippingService, SagaCatalog, SagaRecoveryService, order_fulfillment,
};
use saga_store::SagaPersistence;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::sagas::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<P: SagaPersistence + Clone + 'static>(
    state: Arc<AppState<P>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<P>))
        .route(
            "/sagas/order-fulfillment",
            post(routes::sagas::start_order::<P>),
        )
        .route("/sagas", get(routes::sagas::list_incomplete::<P>))
        .route(
            "/sagas/dead-lettered",
            get(routes::sagas::list_dead_lettered::<P>),
        )
        .route("/sagas/recover", post(routes::sagas::recover::<P>))
        .route("/sagas/{id}", get(routes::sagas::get::<P>))
        .route("/sagas/{id}/cancel", post(routes::sagas::cancel::<P>))
        .route("/interventions", get(routes::sagas::interventions::<P>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates application state over `store` with in-memory participant services.
pub fn create_state<P: SagaPersistence + Clone + 'static>(
    store: P,
    config: &Config,
) -> saga::Result<Arc<AppState<P>>> {
    let inventory = InMemoryInventoryService::new();
    let payment = InMemoryPaymentService::new();
    let shipping = InMemoryShippingService::new();
    let interventions = InMemoryInterventionQueue::new();
    let running = InFlightSagas::new();

    let definition = Arc::new(order_fulfillment::definition(
        inventory.clone(),
        payment.clone(),
        shipping.clone(),
    )?);

    let mut catalog = SagaCatalog::new();
    catalog.register(Arc::clone(&definition));

    let recovery = SagaRecoveryService::new(store.clone(), Arc::new(catalog), &config.owner_id)
        .with_lease(config.lease)
        .with_retry_policy(config.retry_policy())
        .with_max_recovery_attempts(config.max_recovery_attempts)
        .with_intervention_queue(Arc::new(interventions.clone()))
        .with_in_flight(running.clone());

    Ok(Arc::new(AppState {
        store,
        definition,
        recovery: Arc::new(recovery),
        inventory,
        payment,
        shipping,
        interventions,
        running,
        owner: config.owner_id.clone(),
        lease: config.lease,
        retry: config.retry_policy(),
    }))
}

/// Creates application state with the default configuration.
pub fn create_default_state<P: SagaPersistence + Clone + 'static>(
    store: P,
) -> saga::Result<Arc<AppState<P>>> {
    create_state(store, &Config::default())
}
