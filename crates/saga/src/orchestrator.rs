//! Saga orchestrator: drives one saga instance through its steps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{SagaId, SagaState};
use saga_store::{SagaCheckpoint, SagaPersistence, SagaRecord, SaveOptions, Version};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tracing::Instrument;

use crate::context::SagaContext;
use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::escalation::{Escalation, InterventionQueue, InterventionTicket};
use crate::events::SagaEvent;
use crate::retry::RetryPolicy;
use crate::step::{SagaStep, StepResult, bounded};

/// Error text of the synthetic failure injected by a cancellation request.
pub const CANCELLED: &str = "saga cancelled";

/// Error text recorded for a non-idempotent step that was in flight when
/// its orchestrator stopped.
pub const OUTCOME_UNKNOWN: &str = "outcome unknown after interruption";

/// Lease taken on the saga record by an orchestrator that has an owner.
///
/// Must outlast the longest step timeout plus the longest retry delay, since
/// the lease is only renewed between steps and between compensation attempts.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// A step name paired with the error it failed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub error: String,
}

impl StepFailure {
    pub fn new(step: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            error: error.into(),
        }
    }

    /// Parses the `"step: error"` form written to the saga record.
    fn parse(raw: &str) -> Self {
        match raw.split_once(": ") {
            Some((step, error)) => Self::new(step, error),
            None => Self::new("", raw),
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

/// Outcome of a saga run.
#[derive(Debug, Clone, Serialize)]
pub struct SagaResult {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub correlation_id: String,
    /// Completed, Failed or CompensationFailed.
    pub state: SagaState,
    pub completed_steps: Vec<String>,
    pub compensated_steps: Vec<String>,
    pub context: SagaContext,
    /// The forward step failure that triggered compensation.
    pub error: Option<StepFailure>,
    /// The compensation that could not be completed.
    pub compensation_error: Option<StepFailure>,
    /// Transitions made during this run.
    pub history: Vec<SagaEvent>,
    /// Where the saga was escalated, if compensation failed.
    pub escalation: Option<Escalation>,
}

impl SagaResult {
    pub fn is_completed(&self) -> bool {
        self.state == SagaState::Completed
    }

    /// True when the saga ended in CompensationFailed and needs an operator.
    ///
    /// This is distinct from an ordinary business failure: the system is
    /// left in a known-inconsistent state.
    pub fn requires_operator(&self) -> bool {
        self.state == SagaState::CompensationFailed
    }
}

/// Requests cancellation of a running saga.
///
/// The request is observed before the next step starts and handled as a
/// failure of that step, so completed steps are compensated as usual.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Sagas executing in this process, each with the handle that cancels it.
///
/// The recovery service leaves registered sagas alone even when it shares an
/// owner name with the code that started them.
#[derive(Debug, Clone, Default)]
pub struct InFlightSagas {
    running: Arc<RwLock<HashMap<SagaId, CancellationHandle>>>,
}

impl InFlightSagas {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, saga_id: SagaId, handle: CancellationHandle) {
        self.running.write().await.insert(saga_id, handle);
    }

    pub async fn deregister(&self, saga_id: SagaId) {
        self.running.write().await.remove(&saga_id);
    }

    pub async fn contains(&self, saga_id: SagaId) -> bool {
        self.running.read().await.contains_key(&saga_id)
    }

    /// Requests cancellation. Returns false if the saga is not registered.
    pub async fn cancel(&self, saga_id: SagaId) -> bool {
        match self.running.read().await.get(&saga_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.running.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.running.read().await.is_empty()
    }
}

/// Executes the steps of one saga instance against its context.
///
/// Either every step succeeds, or every step that completed is compensated
/// in reverse completion order. Progress is persisted after every
/// transition, before the next step runs or the run returns. Step and
/// compensation failures end up in the [`SagaResult`]; `Err` is reserved for
/// persistence faults, loss of exclusivity and integration defects.
pub struct SagaOrchestrator<P: SagaPersistence> {
    definition: Arc<SagaDefinition>,
    context: SagaContext,
    store: P,
    state: SagaState,
    completed: Vec<String>,
    compensated: Vec<String>,
    failure: Option<StepFailure>,
    compensation_failure: Option<StepFailure>,
    version: Version,
    owner: Option<String>,
    lease: Duration,
    retry: RetryPolicy,
    queue: Option<Arc<dyn InterventionQueue>>,
    cancel: Arc<watch::Sender<bool>>,
    history: Vec<SagaEvent>,
    escalation: Option<Escalation>,
}

impl<P: SagaPersistence> SagaOrchestrator<P> {
    /// Assembles a new saga in the Pending state.
    pub fn new(definition: Arc<SagaDefinition>, context: SagaContext, store: P) -> Result<Self> {
        if context.saga_type() != definition.saga_type() {
            return Err(SagaError::SagaTypeMismatch {
                definition: definition.saga_type().to_string(),
                context: context.saga_type().to_string(),
            });
        }

        Ok(Self {
            definition,
            context,
            store,
            state: SagaState::Pending,
            completed: Vec::new(),
            compensated: Vec::new(),
            failure: None,
            compensation_failure: None,
            version: Version::initial(),
            owner: None,
            lease: DEFAULT_LEASE,
            retry: RetryPolicy::default(),
            queue: None,
            cancel: Arc::new(watch::channel(false).0),
            history: Vec::new(),
            escalation: None,
        })
    }

    /// Rebuilds an orchestrator from a persisted record, ready to [`resume`].
    ///
    /// [`resume`]: SagaOrchestrator::resume
    pub fn from_record(definition: Arc<SagaDefinition>, record: SagaRecord, store: P) -> Result<Self> {
        let saga_id = record.saga_id;
        if record.saga_type != definition.saga_type() {
            return Err(SagaError::SagaTypeMismatch {
                definition: definition.saga_type().to_string(),
                context: record.saga_type,
            });
        }

        let context = SagaContext::from_value(record.context).map_err(|e| SagaError::CorruptRecord {
            saga_id,
            reason: format!("unreadable context: {e}"),
        })?;
        if context.saga_id() != saga_id {
            return Err(SagaError::CorruptRecord {
                saga_id,
                reason: format!("context belongs to saga {}", context.saga_id()),
            });
        }

        for step in record.completed_steps.iter().chain(&record.compensated_steps) {
            if definition.step(step).is_none() {
                return Err(SagaError::UnknownStep {
                    saga_type: record.saga_type.clone(),
                    step: step.clone(),
                });
            }
        }

        let mut orchestrator = Self::new(definition, context, store)?;
        orchestrator.state = record.state;
        orchestrator.completed = record.completed_steps;
        orchestrator.compensated = record.compensated_steps;
        orchestrator.failure = record.failure.as_deref().map(StepFailure::parse);
        orchestrator.compensation_failure =
            record.compensation_error.as_deref().map(StepFailure::parse);
        orchestrator.version = record.version;
        orchestrator.owner = record.owner;
        Ok(orchestrator)
    }

    /// Sets the owner recorded on every write; writes then hold a lease.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Also sends CompensationFailed sagas to `queue` as intervention tickets.
    pub fn with_intervention_queue(mut self, queue: Arc<dyn InterventionQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Returns a handle that cancels this saga.
    pub fn cancellation(&self) -> CancellationHandle {
        CancellationHandle {
            tx: Arc::clone(&self.cancel),
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.context.saga_id()
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn context(&self) -> &SagaContext {
        &self.context
    }

    /// Runs the saga from the beginning. The saga must be Pending.
    pub async fn execute(mut self) -> Result<SagaResult> {
        if self.state != SagaState::Pending {
            return Err(SagaError::NotPending(self.state));
        }

        let span = self.span();
        async move {
            metrics::counter!("saga_executions_total").increment(1);
            let started = Instant::now();

            self.transition(SagaState::Running)?;
            self.record(SagaEvent::saga_started(
                self.context.saga_id(),
                self.definition.saga_type(),
                self.context.correlation_id(),
            ));
            self.checkpoint().await?;

            self.run_forward(0).await?;
            Ok::<_, SagaError>(self.finish(started))
        }
        .instrument(span)
        .await
    }

    /// Continues a persisted saga from where it stopped.
    ///
    /// A Running saga resumes forward execution at the first declared step
    /// not yet completed. If that step is not idempotent it may already have
    /// taken effect, so it is not run again: it fails with [`OUTCOME_UNKNOWN`]
    /// and is compensated along with the steps before it. A Compensating saga
    /// compensates the completed steps not yet compensated, most recent
    /// first. A Pending saga starts from the beginning.
    pub async fn resume(mut self) -> Result<SagaResult> {
        let span = self.span();
        async move {
            let started = Instant::now();
            match self.state {
                SagaState::Pending => return self.execute().await,
                SagaState::Running => {
                    self.verify_completed_prefix()?;
                    tracing::info!(
                        state = %self.state,
                        completed = self.completed.len(),
                        "resuming saga forward execution"
                    );
                    self.record(SagaEvent::saga_resumed(self.state, self.completed.len()));
                    let next = self.completed.len();
                    let definition = Arc::clone(&self.definition);
                    match definition.steps().get(next) {
                        Some(step) if !step.is_idempotent() => {
                            let name = step.name();
                            tracing::warn!(
                                step = name,
                                "non-idempotent step was in flight when the saga stopped, compensating"
                            );
                            self.completed.push(name.to_string());
                            self.fail_step(name, OUTCOME_UNKNOWN.to_string()).await?;
                        }
                        _ => self.run_forward(next).await?,
                    }
                }
                SagaState::Compensating => {
                    tracing::info!(
                        state = %self.state,
                        pending = self.pending_compensations().len(),
                        "resuming saga compensation"
                    );
                    self.record(SagaEvent::saga_resumed(self.state, self.completed.len()));
                    self.run_compensation().await?;
                }
                state => return Err(SagaError::NotResumable(state)),
            }
            Ok(self.finish(started))
        }
        .instrument(span)
        .await
    }

    fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "saga",
            saga_id = %self.context.saga_id(),
            saga_type = %self.definition.saga_type(),
            correlation_id = %self.context.correlation_id(),
        )
    }

    /// Runs forward steps starting at declaration index `from`.
    async fn run_forward(&mut self, from: usize) -> Result<()> {
        let definition = Arc::clone(&self.definition);

        for step in definition.steps().iter().skip(from) {
            let name = step.name();
            if *self.cancel.borrow() {
                tracing::warn!(step = name, "saga cancellation requested");
                return self.fail_step(name, CANCELLED.to_string()).await;
            }

            tracing::info!(step = name, "saga step started");
            let result = bounded(name, step.timeout(), step.execute(&self.context)).await;

            match result {
                StepResult::Success(outputs) => {
                    if let Err(e) = self.context.merge(&outputs) {
                        return self.fail_step(name, e.to_string()).await;
                    }
                    self.completed.push(name.to_string());
                    self.record(SagaEvent::step_completed(name));
                    self.checkpoint().await?;
                    tracing::info!(step = name, "saga step completed");
                }
                StepResult::Failure(error) => return self.fail_step(name, error).await,
            }
        }

        self.transition(SagaState::Completed)?;
        self.record(SagaEvent::saga_ended(SagaState::Completed, None));
        self.checkpoint().await
    }

    /// Records a forward failure and compensates what completed before it.
    async fn fail_step(&mut self, step: &str, error: String) -> Result<()> {
        metrics::counter!("saga_step_failures_total", "step" => step.to_string()).increment(1);
        tracing::warn!(step, error = %error, "saga step failed");
        self.record(SagaEvent::step_failed(step, error.as_str()));
        self.failure = Some(StepFailure::new(step, error));

        self.transition(SagaState::Compensating)?;
        self.record(SagaEvent::compensation_started(step));
        self.checkpoint().await?;

        self.run_compensation().await
    }

    fn pending_compensations(&self) -> Vec<String> {
        self.completed
            .iter()
            .rev()
            .filter(|step| !self.compensated.contains(step))
            .cloned()
            .collect()
    }

    /// Compensates completed steps in reverse completion order.
    ///
    /// Stops at the first compensation that still fails after retries.
    async fn run_compensation(&mut self) -> Result<()> {
        let definition = Arc::clone(&self.definition);

        for name in self.pending_compensations() {
            let step = definition
                .step(&name)
                .ok_or_else(|| SagaError::UnknownStep {
                    saga_type: definition.saga_type().to_string(),
                    step: name.clone(),
                })?;

            tracing::info!(step = %name, "compensating saga step");
            match self.compensate_with_retry(step.as_ref()).await? {
                Ok(()) => {
                    self.compensated.push(name.clone());
                    self.record(SagaEvent::compensation_step_completed(name.as_str()));
                    self.checkpoint().await?;
                }
                Err(error) => {
                    tracing::error!(step = %name, error = %error, "saga compensation failed");
                    self.record(SagaEvent::compensation_step_failed(name.as_str(), error.as_str()));
                    let failure = StepFailure::new(name, error);
                    self.compensation_failure = Some(failure.clone());

                    self.transition(SagaState::CompensationFailed)?;
                    self.record(SagaEvent::saga_ended(
                        SagaState::CompensationFailed,
                        Some(failure.to_string()),
                    ));
                    self.checkpoint().await?;
                    return self.escalate(failure).await;
                }
            }
        }

        self.transition(SagaState::Failed)?;
        let reason = self.failure.as_ref().map(ToString::to_string);
        self.record(SagaEvent::saga_ended(SagaState::Failed, reason));
        self.checkpoint().await
    }

    /// Calls `compensate` until it succeeds or the retry policy gives up.
    ///
    /// The inner result is the compensation outcome. The lease is renewed
    /// before every retry, so only a failed renewal is returned as `Err`.
    async fn compensate_with_retry(
        &mut self,
        step: &dyn SagaStep,
    ) -> Result<std::result::Result<(), String>> {
        let mut failed_attempts = 0;
        loop {
            let result = bounded(step.name(), step.timeout(), step.compensate(&self.context)).await;
            match result {
                StepResult::Success(findings) => {
                    if let Err(e) = self.context.merge(&findings) {
                        tracing::warn!(step = step.name(), error = %e, "compensation findings not recorded");
                    }
                    return Ok(Ok(()));
                }
                StepResult::Failure(error) => {
                    failed_attempts += 1;
                    let Some(delay) = self.retry.backoff(failed_attempts) else {
                        return Ok(Err(error));
                    };
                    metrics::counter!("saga_compensation_retries_total").increment(1);
                    tracing::warn!(
                        step = step.name(),
                        attempt = failed_attempts,
                        ?delay,
                        error = %error,
                        "compensation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if self.owner.is_some() {
                        self.checkpoint().await?;
                    }
                }
            }
        }
    }

    /// Hands a CompensationFailed saga to an operator.
    ///
    /// The record is always dead-lettered so the saga stays visible after a
    /// restart. With a queue configured a ticket is raised as well.
    async fn escalate(&mut self, compensation: StepFailure) -> Result<()> {
        let failure = self
            .failure
            .clone()
            .unwrap_or_else(|| StepFailure::new("", "unknown"));
        let reason = format!(
            "compensation of '{}' failed: {} (after failure of '{}': {})",
            compensation.step, compensation.error, failure.step, failure.error
        );

        let mut escalation = Escalation::DeadLettered;
        if let Some(queue) = &self.queue {
            let ticket = InterventionTicket {
                saga_id: self.context.saga_id(),
                saga_type: self.definition.saga_type().to_string(),
                correlation_id: self.context.correlation_id().to_string(),
                failed_step: failure.step.clone(),
                step_error: failure.error.clone(),
                compensation_step: compensation.step.clone(),
                compensation_error: compensation.error.clone(),
                uncompensated_steps: self.pending_compensations(),
                raised_at: chrono::Utc::now(),
            };
            match queue.enqueue(ticket).await {
                Ok(()) => escalation = Escalation::ManualIntervention,
                Err(e) => {
                    tracing::error!(error = %e, "intervention queue rejected ticket, dead-lettering saga");
                }
            }
        }

        if let Err(e) = self.dead_letter(&reason).await {
            if escalation == Escalation::DeadLettered {
                return Err(e);
            }
            tracing::error!(error = %e, "saga not dead-lettered, the intervention ticket is its only record");
        }

        tracing::error!(?escalation, reason = %reason, "saga escalated for operator attention");
        self.record(SagaEvent::saga_escalated(escalation));
        self.escalation = Some(escalation);
        Ok(())
    }

    /// Marks the record dead-lettered, retrying store failures under the
    /// retry policy.
    async fn dead_letter(&self, reason: &str) -> Result<()> {
        let saga_id = self.context.saga_id();
        let mut failed_attempts = 0;
        loop {
            match self.store.mark_dead_lettered(saga_id, reason).await {
                Ok(()) => {
                    metrics::counter!("saga_dead_lettered_total").increment(1);
                    return Ok(());
                }
                Err(e) => {
                    failed_attempts += 1;
                    let Some(delay) = self.retry.backoff(failed_attempts) else {
                        tracing::error!(
                            error = %e,
                            attempts = failed_attempts,
                            reason,
                            "failed to dead-letter saga"
                        );
                        return Err(e.into());
                    };
                    tracing::warn!(error = %e, attempt = failed_attempts, ?delay, "dead-letter write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn verify_completed_prefix(&self) -> Result<()> {
        let declared = self.definition.step_names();
        let is_prefix = self.completed.len() <= declared.len()
            && self
                .completed
                .iter()
                .zip(&declared)
                .all(|(done, step)| done == step);
        if is_prefix {
            Ok(())
        } else {
            Err(SagaError::CorruptRecord {
                saga_id: self.context.saga_id(),
                reason: format!(
                    "completed steps {:?} are not a prefix of {:?}",
                    self.completed, declared
                ),
            })
        }
    }

    fn transition(&mut self, next: SagaState) -> Result<()> {
        self.state = self.state.transition(next)?;
        tracing::info!(state = %self.state, "saga state changed");
        Ok(())
    }

    fn record(&mut self, event: SagaEvent) {
        tracing::debug!(event = event.event_type(), "saga event");
        self.history.push(event);
    }

    /// Durably writes the current progress under the version fence.
    async fn checkpoint(&mut self) -> Result<()> {
        let checkpoint = SagaCheckpoint {
            saga_id: self.context.saga_id(),
            saga_type: self.definition.saga_type().to_string(),
            correlation_id: self.context.correlation_id().to_string(),
            state: self.state,
            completed_steps: self.completed.clone(),
            compensated_steps: self.compensated.clone(),
            context: self.context.to_value()?,
            failure: self.failure.as_ref().map(ToString::to_string),
            compensation_error: self.compensation_failure.as_ref().map(ToString::to_string),
            owner: self.owner.clone(),
            lease: self.lease,
        };

        match self
            .store
            .save(&checkpoint, SaveOptions::expect_version(self.version))
            .await
        {
            Ok(version) => {
                self.version = version;
                Ok(())
            }
            Err(e) if e.is_exclusivity_loss() => {
                tracing::warn!(error = %e, "saga taken over by another orchestrator, stopping");
                Err(SagaError::ExclusivityLost(self.context.saga_id()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn finish(self, started: Instant) -> SagaResult {
        let duration = started.elapsed().as_secs_f64();
        metrics::histogram!("saga_duration_seconds").record(duration);

        match self.state {
            SagaState::Completed => {
                metrics::counter!("saga_completed").increment(1);
                tracing::info!(state = %self.state, duration, "saga completed successfully");
            }
            SagaState::Failed => {
                metrics::counter!("saga_failed").increment(1);
                tracing::warn!(
                    state = %self.state,
                    duration,
                    error = ?self.failure.as_ref().map(ToString::to_string),
                    "saga failed, compensation completed"
                );
            }
            _ => {
                metrics::counter!("saga_compensation_failed").increment(1);
                tracing::error!(
                    state = %self.state,
                    duration,
                    error = ?self.failure.as_ref().map(ToString::to_string),
                    compensation_error = ?self.compensation_failure.as_ref().map(ToString::to_string),
                    "saga compensation failed"
                );
            }
        }

        SagaResult {
            saga_id: self.context.saga_id(),
            saga_type: self.definition.saga_type().to_string(),
            correlation_id: self.context.correlation_id().to_string(),
            state: self.state,
            completed_steps: self.completed,
            compensated_steps: self.compensated,
            context: self.context,
            error: self.failure,
            compensation_error: self.compensation_failure,
            history: self.history,
            escalation: self.escalation,
        }
    }
}
