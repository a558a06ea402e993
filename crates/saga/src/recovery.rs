//! Recovery of sagas left incomplete by a crashed or stopped process.

use std::sync::Arc;
use std::time::Duration;

use common::SagaId;
use saga_store::{SagaPersistence, SagaRecord};
use serde::Serialize;
use tokio::sync::watch;

use crate::definition::SagaCatalog;
use crate::error::{Result, SagaError};
use crate::escalation::InterventionQueue;
use crate::orchestrator::{DEFAULT_LEASE, InFlightSagas, SagaOrchestrator, SagaResult};
use crate::retry::RetryPolicy;

/// Failed recovery attempts after which a saga is dead-lettered.
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Outcome of one recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Sagas resumed to a terminal state by this sweep.
    pub recovered: Vec<SagaId>,
    /// Sagas running in this process or leased by another orchestrator,
    /// or finished by one meanwhile.
    pub skipped: Vec<SagaId>,
    /// Sagas whose recovery failed and will be retried by a later sweep.
    pub failed: Vec<SagaId>,
    /// Sagas moved to the dead-letter holding state by this sweep.
    pub dead_lettered: Vec<SagaId>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.recovered.len() + self.skipped.len() + self.failed.len() + self.dead_lettered.len()
    }
}

/// Finds incomplete sagas and drives each one to a terminal state.
///
/// Each saga is claimed through the store before it is touched, so two
/// services sweeping the same store never resume the same saga, and a live
/// lease is never taken over, not even by its own owner. Sagas registered in
/// the [`InFlightSagas`] of this process are skipped without a claim. A
/// failure while recovering one saga is logged and counted against that saga
/// only.
pub struct SagaRecoveryService<P> {
    store: P,
    catalog: Arc<SagaCatalog>,
    owner: String,
    lease: Duration,
    retry: RetryPolicy,
    max_recovery_attempts: u32,
    queue: Option<Arc<dyn InterventionQueue>>,
    in_flight: InFlightSagas,
}

impl<P: SagaPersistence + Clone> SagaRecoveryService<P> {
    pub fn new(store: P, catalog: Arc<SagaCatalog>, owner: impl Into<String>) -> Self {
        Self {
            store,
            catalog,
            owner: owner.into(),
            lease: DEFAULT_LEASE,
            retry: RetryPolicy::default(),
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            queue: None,
            in_flight: InFlightSagas::new(),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts.max(1);
        self
    }

    pub fn with_intervention_queue(mut self, queue: Arc<dyn InterventionQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Shares the registry of sagas this process is executing.
    pub fn with_in_flight(mut self, in_flight: InFlightSagas) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Runs one sweep over every incomplete saga.
    ///
    /// Only a failure to list incomplete sagas is returned as an error.
    #[tracing::instrument(skip(self), fields(owner = %self.owner))]
    pub async fn recover_all(&self) -> Result<RecoveryReport> {
        let incomplete = self.store.find_incomplete().await?;
        tracing::info!(count = incomplete.len(), "recovery sweep started");

        let mut report = RecoveryReport::default();
        for record in incomplete {
            let saga_id = record.saga_id;
            match self.recover_saga(saga_id).await {
                Ok(Some(result)) => {
                    tracing::info!(%saga_id, state = %result.state, "saga recovered");
                    report.recovered.push(saga_id);
                }
                Ok(None) | Err(SagaError::ExclusivityLost(_)) => report.skipped.push(saga_id),
                Err(e) => {
                    if self.record_failure(saga_id, &e).await {
                        report.dead_lettered.push(saga_id);
                    } else {
                        report.failed.push(saga_id);
                    }
                }
            }
        }

        tracing::info!(
            recovered = report.recovered.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            dead_lettered = report.dead_lettered.len(),
            "recovery sweep finished"
        );
        Ok(report)
    }

    /// Claims and resumes one saga.
    ///
    /// Returns `None` if the saga is running in this process, leased by any
    /// orchestrator, or no longer needs work.
    #[tracing::instrument(skip(self), fields(owner = %self.owner))]
    pub async fn recover_saga(&self, saga_id: SagaId) -> Result<Option<SagaResult>> {
        if self.in_flight.contains(saga_id).await {
            tracing::debug!("saga is executing in this process, skipping");
            return Ok(None);
        }

        let Some(record) = self
            .store
            .try_claim(saga_id, &self.owner, self.lease)
            .await?
        else {
            tracing::debug!("saga claimed elsewhere or already finished, skipping");
            return Ok(None);
        };

        match self.resume(record).await {
            Ok(result) => {
                metrics::counter!("saga_recovered_total").increment(1);
                Ok(Some(result))
            }
            Err(e) => {
                if let Err(release) = self.store.release_claim(saga_id, &self.owner).await {
                    tracing::warn!(error = %release, "failed to release saga claim");
                }
                Err(e)
            }
        }
    }

    async fn resume(&self, record: SagaRecord) -> Result<SagaResult> {
        let definition = self
            .catalog
            .get(&record.saga_type)
            .ok_or_else(|| SagaError::UnknownSagaType(record.saga_type.clone()))?;

        let mut orchestrator = SagaOrchestrator::from_record(definition, record, self.store.clone())?
            .with_owner(self.owner.clone())
            .with_lease(self.lease)
            .with_retry_policy(self.retry);
        if let Some(queue) = &self.queue {
            orchestrator = orchestrator.with_intervention_queue(Arc::clone(queue));
        }
        orchestrator.resume().await
    }

    /// Counts a failed attempt; dead-letters the saga once attempts run out.
    ///
    /// Returns true if the saga was dead-lettered.
    async fn record_failure(&self, saga_id: SagaId, error: &SagaError) -> bool {
        metrics::counter!("saga_recovery_failures_total").increment(1);
        tracing::error!(%saga_id, error = %error, "saga recovery failed");

        let message = error.to_string();
        let attempts = match self.store.record_recovery_failure(saga_id, &message).await {
            Ok(attempts) => attempts,
            Err(e) => {
                tracing::error!(%saga_id, error = %e, "failed to record recovery failure");
                return false;
            }
        };
        if attempts < self.max_recovery_attempts {
            return false;
        }

        let reason = format!("recovery failed {attempts} times, last error: {message}");
        match self.store.mark_dead_lettered(saga_id, &reason).await {
            Ok(()) => {
                metrics::counter!("saga_dead_lettered_total").increment(1);
                tracing::error!(%saga_id, attempts, "saga dead-lettered after repeated recovery failures");
                true
            }
            Err(e) => {
                tracing::error!(%saga_id, error = %e, "failed to dead-letter saga");
                false
            }
        }
    }

    /// Sweeps every `interval`, starting one interval from now, until
    /// `shutdown` turns true.
    pub async fn run_periodic(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.recover_all().await {
                        tracing::error!(error = %e, "recovery sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("recovery loop stopped");
                        return;
                    }
                }
            }
        }
    }
}
