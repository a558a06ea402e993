//! Integration tests for the order fulfillment saga.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use saga::order_fulfillment::{
    self, ChargePaymentStep, CreateShipmentStep, KEY_PAYMENT_ID, KEY_RESERVATION_ID,
    KEY_TRACKING_NUMBER, ReserveInventoryStep, SAGA_TYPE, STEP_CREATE_SHIPMENT,
    STEP_PROCESS_PAYMENT, STEP_RESERVE_INVENTORY,
};
use saga::{
    CANCELLED, CallContext, Escalation, InMemoryInterventionQueue, InMemoryInventoryService,
    InMemoryPaymentService, InMemoryShippingService, InventoryService, OrderRequest,
    ParallelGroup, ReservationItem, ReservationResult, RetryPolicy, SagaCatalog, SagaContext,
    SagaDefinition, SagaError, SagaEvent, SagaId, SagaOrchestrator, SagaRecoveryService,
    SagaState, SagaStep, ShipmentResult, ShippingService, StepResult,
};
use saga_store::{InMemorySagaStore, SagaPersistence};

struct TestHarness {
    store: InMemorySagaStore,
    inventory: InMemoryInventoryService,
    payment: InMemoryPaymentService,
    shipping: InMemoryShippingService,
    definition: Arc<SagaDefinition>,
}

impl TestHarness {
    fn new() -> Self {
        let inventory = InMemoryInventoryService::new();
        let payment = InMemoryPaymentService::new();
        let shipping = InMemoryShippingService::new();
        let definition = Arc::new(
            order_fulfillment::definition(inventory.clone(), payment.clone(), shipping.clone())
                .unwrap(),
        );

        Self {
            store: InMemorySagaStore::new(),
            inventory,
            payment,
            shipping,
            definition,
        }
    }

    fn orchestrator(&self) -> SagaOrchestrator<InMemorySagaStore> {
        SagaOrchestrator::new(
            Arc::clone(&self.definition),
            request("order-1").into_context().unwrap(),
            self.store.clone(),
        )
        .unwrap()
        .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    fn catalog(&self) -> Arc<SagaCatalog> {
        let mut catalog = SagaCatalog::new();
        catalog.register(Arc::clone(&self.definition));
        Arc::new(catalog)
    }
}

fn request(order_id: &str) -> OrderRequest {
    OrderRequest {
        order_id: order_id.to_string(),
        customer_id: "cust-1".to_string(),
        items: vec![
            ReservationItem::new("SKU-001", 2),
            ReservationItem::new("SKU-002", 1),
        ],
        amount_cents: 4500,
    }
}

/// A step that never finishes, standing in for a process that dies mid-step.
struct Hang(&'static str);

#[async_trait]
impl SagaStep for Hang {
    fn name(&self) -> &str {
        self.0
    }

    async fn execute(&self, _ctx: &SagaContext) -> StepResult {
        std::future::pending().await
    }

    async fn compensate(&self, _ctx: &SagaContext) -> StepResult {
        StepResult::success()
    }
}

/// Shipping service that takes a while to answer.
#[derive(Clone)]
struct SlowShipping(InMemoryShippingService);

#[async_trait]
impl ShippingService for SlowShipping {
    async fn create_shipment(&self, call: &CallContext) -> Result<ShipmentResult, SagaError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.0.create_shipment(call).await
    }

    async fn cancel_shipment(&self, call: &CallContext, tracking: &str) -> Result<(), SagaError> {
        self.0.cancel_shipment(call, tracking).await
    }
}

/// Inventory service that takes a while to reserve.
#[derive(Clone)]
struct SlowInventory(InMemoryInventoryService);

#[async_trait]
impl InventoryService for SlowInventory {
    async fn reserve(
        &self,
        call: &CallContext,
        items: &[ReservationItem],
    ) -> Result<ReservationResult, SagaError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.0.reserve(call, items).await
    }

    async fn release(&self, call: &CallContext, reservation_id: &str) -> Result<(), SagaError> {
        self.0.release(call, reservation_id).await
    }
}

/// Runs the order saga until the first two steps are persisted, then kills
/// it, leaving a Running record behind.
async fn crash_after_payment(h: &TestHarness) -> SagaId {
    let crashing = Arc::new(
        SagaDefinition::builder(SAGA_TYPE)
            .step(ReserveInventoryStep::new(h.inventory.clone()))
            .step(ChargePaymentStep::new(h.payment.clone()))
            .step(Hang(STEP_CREATE_SHIPMENT))
            .build()
            .unwrap(),
    );
    let ctx = request("order-crash").into_context().unwrap();
    let saga_id = ctx.saga_id();
    let orchestrator = SagaOrchestrator::new(crashing, ctx, h.store.clone())
        .unwrap()
        .with_owner("node-crashed")
        .with_lease(Duration::from_millis(30));

    let task = tokio::spawn(orchestrator.execute());
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(record) = h.store.find_by_id(saga_id).await.unwrap()
                && record.completed_steps.len() == 2
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    task.abort();
    let _ = task.await;

    // Let the crashed owner's lease run out.
    tokio::time::sleep(Duration::from_millis(60)).await;
    saga_id
}

#[tokio::test]
async fn test_happy_path_full_order_fulfillment() {
    let h = TestHarness::new();

    let result = h.orchestrator().execute().await.unwrap();

    assert_eq!(result.state, SagaState::Completed);
    assert_eq!(
        result.completed_steps,
        vec![STEP_RESERVE_INVENTORY, STEP_PROCESS_PAYMENT, STEP_CREATE_SHIPMENT]
    );
    assert!(result.context.get_str(KEY_RESERVATION_ID).is_some());
    assert!(result.context.get_str(KEY_PAYMENT_ID).is_some());
    assert!(result.context.get_str(KEY_TRACKING_NUMBER).is_some());
    assert!(result.error.is_none());
    assert!(!result.requires_operator());

    assert_eq!(h.inventory.reservation_count().await, 1);
    assert_eq!(h.payment.payment_count().await, 1);
    assert_eq!(h.shipping.shipment_count().await, 1);

    let record = h.store.find_by_id(result.saga_id).await.unwrap().unwrap();
    assert_eq!(record.state, SagaState::Completed);
    assert_eq!(record.completed_steps, result.completed_steps);
    assert_eq!(record.correlation_id, "order-1");
    assert!(h.store.find_incomplete().await.unwrap().is_empty());

    let events: Vec<_> = result.history.iter().map(SagaEvent::event_type).collect();
    assert_eq!(
        events,
        vec![
            "SagaStarted",
            "StepCompleted",
            "StepCompleted",
            "StepCompleted",
            "SagaCompleted"
        ]
    );
}

#[tokio::test]
async fn test_payment_failure_releases_inventory_once() {
    let h = TestHarness::new();
    h.payment.set_fail_on_charge(true).await;

    let result = h.orchestrator().execute().await.unwrap();

    assert_eq!(result.state, SagaState::Failed);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.step, STEP_PROCESS_PAYMENT);
    assert!(error.error.contains("Payment declined"));
    assert_eq!(result.compensated_steps, vec![STEP_RESERVE_INVENTORY]);

    assert_eq!(h.inventory.release_calls().await, 1);
    assert_eq!(h.inventory.reservation_count().await, 0);
    assert_eq!(h.payment.refund_calls().await, 0);
    assert_eq!(h.shipping.create_calls().await, 0);

    let record = h.store.find_by_id(result.saga_id).await.unwrap().unwrap();
    assert_eq!(record.state, SagaState::Failed);
    assert!(!record.is_dead_lettered());
}

#[tokio::test]
async fn test_inventory_failure_compensates_nothing() {
    let h = TestHarness::new();
    h.inventory.set_fail_on_reserve(true).await;

    let result = h.orchestrator().execute().await.unwrap();

    assert_eq!(result.state, SagaState::Failed);
    assert!(result.completed_steps.is_empty());
    assert_eq!(h.inventory.release_calls().await, 0);
    assert_eq!(h.payment.charge_count().await, 0);
}

#[tokio::test]
async fn test_shipping_failure_with_failing_release_needs_operator() {
    let h = TestHarness::new();
    h.shipping.set_fail_on_create(true).await;
    h.inventory.set_fail_on_release(true).await;

    let result = h.orchestrator().execute().await.unwrap();

    assert_eq!(result.state, SagaState::CompensationFailed);
    assert!(result.requires_operator());

    let error = result.error.as_ref().unwrap();
    assert_eq!(error.step, STEP_CREATE_SHIPMENT);
    assert!(error.error.contains("Shipping unavailable"));
    let compensation = result.compensation_error.as_ref().unwrap();
    assert_eq!(compensation.step, STEP_RESERVE_INVENTORY);
    assert!(compensation.error.contains("Inventory backend unavailable"));

    // Payment was refunded before the release failed; the release was retried.
    assert_eq!(result.compensated_steps, vec![STEP_PROCESS_PAYMENT]);
    assert_eq!(h.payment.payment_count().await, 0);
    assert_eq!(h.inventory.release_calls().await, 3);
    assert_eq!(h.inventory.reservation_count().await, 1);

    assert_eq!(result.escalation, Some(Escalation::DeadLettered));
    let record = h.store.find_by_id(result.saga_id).await.unwrap().unwrap();
    assert_eq!(record.state, SagaState::CompensationFailed);
    assert!(record.failure.is_some());
    assert!(record.compensation_error.is_some());
    assert!(record.is_dead_lettered());
}

#[tokio::test]
async fn test_transient_release_failure_is_retried() {
    let h = TestHarness::new();
    h.shipping.set_fail_on_create(true).await;
    h.inventory.fail_next_releases(2).await;

    let result = h.orchestrator().execute().await.unwrap();

    assert_eq!(result.state, SagaState::Failed);
    assert_eq!(
        result.compensated_steps,
        vec![STEP_PROCESS_PAYMENT, STEP_RESERVE_INVENTORY]
    );
    assert_eq!(h.inventory.release_calls().await, 3);
    assert_eq!(h.inventory.reservation_count().await, 0);
}

#[tokio::test]
async fn test_compensation_failure_goes_to_intervention_queue() {
    let h = TestHarness::new();
    h.shipping.set_fail_on_create(true).await;
    h.payment.set_fail_on_refund(true).await;
    let queue = InMemoryInterventionQueue::new();

    let result = h
        .orchestrator()
        .with_intervention_queue(Arc::new(queue.clone()))
        .execute()
        .await
        .unwrap();

    assert_eq!(result.state, SagaState::CompensationFailed);
    assert_eq!(result.escalation, Some(Escalation::ManualIntervention));

    let tickets = queue.tickets().await;
    assert_eq!(tickets.len(), 1);
    let ticket = &tickets[0];
    assert_eq!(ticket.saga_id, result.saga_id);
    assert_eq!(ticket.failed_step, STEP_CREATE_SHIPMENT);
    assert_eq!(ticket.compensation_step, STEP_PROCESS_PAYMENT);
    assert_eq!(
        ticket.uncompensated_steps,
        vec![STEP_PROCESS_PAYMENT, STEP_RESERVE_INVENTORY]
    );
    // Compensation stopped at the refund; the reservation was never released.
    assert_eq!(h.inventory.release_calls().await, 0);
}

#[tokio::test]
async fn test_crash_recovery_resumes_at_step_three() {
    let h = TestHarness::new();
    let saga_id = crash_after_payment(&h).await;

    let record = h.store.find_by_id(saga_id).await.unwrap().unwrap();
    assert_eq!(record.state, SagaState::Running);
    assert_eq!(
        record.completed_steps,
        vec![STEP_RESERVE_INVENTORY, STEP_PROCESS_PAYMENT]
    );

    let service = SagaRecoveryService::new(h.store.clone(), h.catalog(), "node-b");
    let report = service.recover_all().await.unwrap();
    assert_eq!(report.recovered, vec![saga_id]);

    let record = h.store.find_by_id(saga_id).await.unwrap().unwrap();
    assert_eq!(record.state, SagaState::Completed);
    assert_eq!(
        record.completed_steps,
        vec![STEP_RESERVE_INVENTORY, STEP_PROCESS_PAYMENT, STEP_CREATE_SHIPMENT]
    );
    assert!(record.owner.is_none());

    // Steps 1 and 2 were not run again.
    assert_eq!(h.inventory.reserve_calls().await, 1);
    assert_eq!(h.payment.charge_count().await, 1);
    assert_eq!(h.shipping.shipment_count().await, 1);
}

#[tokio::test]
async fn test_recovery_respects_live_lease_of_running_owner() {
    let h = TestHarness::new();
    let saga_id = crash_after_payment(&h).await;
    let mut record = h.store.find_by_id(saga_id).await.unwrap().unwrap();
    record.owner = Some("node-alive".to_string());
    record.lease_expires_at = Some(chrono::Utc::now() + chrono::Duration::seconds(60));
    h.store.insert_raw(record).await;

    let service = SagaRecoveryService::new(h.store.clone(), h.catalog(), "node-b");
    let report = service.recover_all().await.unwrap();

    assert!(report.recovered.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(h.shipping.create_calls().await, 0);
}

#[tokio::test]
async fn test_concurrent_recovery_sweeps_resume_once() {
    let h = TestHarness::new();
    let saga_id = crash_after_payment(&h).await;

    let slow = SlowShipping(h.shipping.clone());
    let definition = Arc::new(
        SagaDefinition::builder(SAGA_TYPE)
            .step(ReserveInventoryStep::new(h.inventory.clone()))
            .step(ChargePaymentStep::new(h.payment.clone()))
            .step(CreateShipmentStep::new(slow))
            .build()
            .unwrap(),
    );
    let mut catalog = SagaCatalog::new();
    catalog.register(definition);
    let catalog = Arc::new(catalog);

    let a = SagaRecoveryService::new(h.store.clone(), Arc::clone(&catalog), "node-a");
    let b = SagaRecoveryService::new(h.store.clone(), catalog, "node-b");

    let (report_a, report_b) = tokio::join!(a.recover_all(), b.recover_all());
    let (report_a, report_b) = (report_a.unwrap(), report_b.unwrap());

    assert_eq!(report_a.recovered.len() + report_b.recovered.len(), 1);
    assert_eq!(report_a.skipped.len() + report_b.skipped.len(), 1);
    assert!(report_a.failed.is_empty() && report_b.failed.is_empty());

    assert_eq!(h.shipping.create_calls().await, 1);
    assert_eq!(h.shipping.shipment_count().await, 1);
    let record = h.store.find_by_id(saga_id).await.unwrap().unwrap();
    assert_eq!(record.state, SagaState::Completed);
}

#[tokio::test]
async fn test_cancellation_compensates_completed_steps() {
    let h = TestHarness::new();
    let definition = Arc::new(
        SagaDefinition::builder(SAGA_TYPE)
            .step(ReserveInventoryStep::new(SlowInventory(h.inventory.clone())))
            .step(ChargePaymentStep::new(h.payment.clone()))
            .step(CreateShipmentStep::new(h.shipping.clone()))
            .build()
            .unwrap(),
    );
    let orchestrator = SagaOrchestrator::new(
        definition,
        request("order-cancel").into_context().unwrap(),
        h.store.clone(),
    )
    .unwrap();
    let cancel = orchestrator.cancellation();

    let task = tokio::spawn(orchestrator.execute());
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();
    let result = task.await.unwrap().unwrap();

    assert_eq!(result.state, SagaState::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.step, STEP_PROCESS_PAYMENT);
    assert_eq!(error.error, CANCELLED);
    assert_eq!(result.compensated_steps, vec![STEP_RESERVE_INVENTORY]);
    assert_eq!(h.inventory.reservation_count().await, 0);
    assert_eq!(h.payment.charge_count().await, 0);
}

#[tokio::test]
async fn test_parallel_group_is_undone_as_a_unit() {
    let h = TestHarness::new();
    h.shipping.set_fail_on_create(true).await;
    let definition = Arc::new(
        SagaDefinition::builder(SAGA_TYPE)
            .step(
                ParallelGroup::new("reserve_and_charge")
                    .step(ReserveInventoryStep::new(h.inventory.clone()))
                    .step(ChargePaymentStep::new(h.payment.clone())),
            )
            .step(CreateShipmentStep::new(h.shipping.clone()))
            .build()
            .unwrap(),
    );

    let result = SagaOrchestrator::new(
        definition,
        request("order-par").into_context().unwrap(),
        h.store.clone(),
    )
    .unwrap()
    .execute()
    .await
    .unwrap();

    assert_eq!(result.state, SagaState::Failed);
    assert!(result.context.get_str(KEY_RESERVATION_ID).is_some());
    assert!(result.context.get_str(KEY_PAYMENT_ID).is_some());
    assert_eq!(result.compensated_steps, vec!["reserve_and_charge"]);
    assert_eq!(h.inventory.reservation_count().await, 0);
    assert_eq!(h.payment.payment_count().await, 0);
}

#[tokio::test]
async fn test_many_sagas_run_concurrently() {
    let h = Arc::new(TestHarness::new());

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                SagaOrchestrator::new(
                    Arc::clone(&h.definition),
                    request(&format!("order-{i}")).into_context().unwrap(),
                    h.store.clone(),
                )
                .unwrap()
                .execute()
                .await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().state, SagaState::Completed);
    }
    assert_eq!(h.store.record_count().await, 20);
    assert_eq!(h.payment.charge_count().await, 20);
}
