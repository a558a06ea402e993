use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    Result, SagaCheckpoint, SagaId, SagaRecord, SagaStoreError, Version, lease_deadline,
    store::{SagaPersistence, SaveOptions},
};

/// In-memory saga store.
///
/// Provides the same interface and exclusivity rules as the PostgreSQL
/// implementation. Every operation runs under one write lock, so claims and
/// conditional writes are atomic with respect to each other.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    records: Arc<RwLock<HashMap<SagaId, SagaRecord>>>,
    saves: Arc<RwLock<u64>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records stored.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns the number of successful `save` calls.
    pub async fn save_count(&self) -> u64 {
        *self.saves.read().await
    }

    /// Inserts a record as-is, bypassing all checks.
    ///
    /// Used to seed the store with the state a crashed process left behind.
    pub async fn insert_raw(&self, record: SagaRecord) {
        self.records.write().await.insert(record.saga_id, record);
    }

    /// Clears all records.
    pub async fn clear(&self) {
        self.records.write().await.clear();
        *self.saves.write().await = 0;
    }
}

#[async_trait]
impl SagaPersistence for InMemorySagaStore {
    async fn save(&self, checkpoint: &SagaCheckpoint, options: SaveOptions) -> Result<Version> {
        let saga_id = checkpoint.saga_id;
        let now = Utc::now();
        let mut records = self.records.write().await;

        let current_version = records
            .get(&saga_id)
            .map(|r| r.version)
            .unwrap_or(Version::initial());

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            metrics::counter!("saga_store_conflicts_total").increment(1);
            return Err(SagaStoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual: current_version,
            });
        }

        if let Some(existing) = records.get(&saga_id)
            && let Some(owner) = existing.lease_held_by_other(checkpoint.owner.as_deref(), now)
        {
            metrics::counter!("saga_store_conflicts_total").increment(1);
            return Err(SagaStoreError::LeaseHeld {
                saga_id,
                owner: owner.to_string(),
            });
        }

        let (owner, lease_expires_at) = if checkpoint.state.is_terminal() {
            (None, None)
        } else {
            (
                checkpoint.owner.clone(),
                checkpoint
                    .owner
                    .as_ref()
                    .map(|_| lease_deadline(now, checkpoint.lease)),
            )
        };

        let version = current_version.next();
        let previous = records.get(&saga_id);
        let record = SagaRecord {
            saga_id,
            saga_type: checkpoint.saga_type.clone(),
            correlation_id: checkpoint.correlation_id.clone(),
            state: checkpoint.state,
            completed_steps: checkpoint.completed_steps.clone(),
            compensated_steps: checkpoint.compensated_steps.clone(),
            context: checkpoint.context.clone(),
            failure: checkpoint.failure.clone(),
            compensation_error: checkpoint.compensation_error.clone(),
            version,
            owner,
            lease_expires_at,
            recovery_attempts: previous.map_or(0, |r| r.recovery_attempts),
            last_recovery_error: previous.and_then(|r| r.last_recovery_error.clone()),
            dead_lettered_at: previous.and_then(|r| r.dead_lettered_at),
            dead_letter_reason: previous.and_then(|r| r.dead_letter_reason.clone()),
            created_at: previous.map_or(now, |r| r.created_at),
            updated_at: now,
        };
        records.insert(saga_id, record);
        *self.saves.write().await += 1;

        Ok(version)
    }

    async fn find_by_id(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        Ok(self.records.read().await.get(&saga_id).cloned())
    }

    async fn find_incomplete(&self) -> Result<Vec<SagaRecord>> {
        let records = self.records.read().await;
        let mut incomplete: Vec<_> = records
            .values()
            .filter(|r| r.is_incomplete())
            .cloned()
            .collect();
        incomplete.sort_by_key(|r| r.created_at);
        Ok(incomplete)
    }

    async fn find_dead_lettered(&self) -> Result<Vec<SagaRecord>> {
        let records = self.records.read().await;
        let mut dead: Vec<_> = records
            .values()
            .filter(|r| r.is_dead_lettered())
            .cloned()
            .collect();
        dead.sort_by_key(|r| r.created_at);
        Ok(dead)
    }

    async fn mark_dead_lettered(&self, saga_id: SagaId, reason: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&saga_id)
            .ok_or(SagaStoreError::NotFound(saga_id))?;

        let now = Utc::now();
        record.dead_lettered_at = Some(now);
        record.dead_letter_reason = Some(reason.to_string());
        record.owner = None;
        record.lease_expires_at = None;
        record.version = record.version.next();
        record.updated_at = now;
        Ok(())
    }

    async fn try_claim(
        &self,
        saga_id: SagaId,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<SagaRecord>> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&saga_id)
            .ok_or(SagaStoreError::NotFound(saga_id))?;

        let now = Utc::now();
        if !record.is_incomplete() || record.has_live_lease(now) {
            return Ok(None);
        }

        record.owner = Some(owner.to_string());
        record.lease_expires_at = Some(lease_deadline(now, lease));
        record.version = record.version.next();
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn release_claim(&self, saga_id: SagaId, owner: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&saga_id)
            && record.owner.as_deref() == Some(owner)
        {
            record.owner = None;
            record.lease_expires_at = None;
            record.version = record.version.next();
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_recovery_failure(&self, saga_id: SagaId, error: &str) -> Result<u32> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&saga_id)
            .ok_or(SagaStoreError::NotFound(saga_id))?;

        record.recovery_attempts += 1;
        record.last_recovery_error = Some(error.to_string());
        record.version = record.version.next();
        record.updated_at = Utc::now();
        Ok(record.recovery_attempts)
    }
}
