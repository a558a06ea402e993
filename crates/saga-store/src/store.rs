use std::time::Duration;

use async_trait::async_trait;

use crate::{Result, SagaCheckpoint, SagaId, SagaRecord, Version};

/// Options for writing a saga checkpoint.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Expected version of the stored record for optimistic concurrency control.
    /// If None, no version check is performed (use with caution).
    pub expected_version: Option<Version>,
}

impl SaveOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the record to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the record to not exist yet.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// Durable storage of saga progress.
///
/// `save` must be durable before it returns. Implementations also provide
/// the exclusivity that keeps two orchestrators from driving the same saga:
/// version-checked writes plus an ownership lease.
#[async_trait]
pub trait SagaPersistence: Send + Sync {
    /// Writes a checkpoint, creating the record on first write.
    ///
    /// Fails with `ConcurrencyConflict` if `options.expected_version` does not
    /// match, and with `LeaseHeld` if another owner holds a live lease.
    /// A non-terminal save renews the writer's lease; a terminal save clears it.
    ///
    /// Returns the new version of the record.
    async fn save(&self, checkpoint: &SagaCheckpoint, options: SaveOptions) -> Result<Version>;

    /// Loads a record by saga ID.
    async fn find_by_id(&self, saga_id: SagaId) -> Result<Option<SagaRecord>>;

    /// Lists records that are neither terminal nor dead-lettered, oldest first.
    async fn find_incomplete(&self) -> Result<Vec<SagaRecord>>;

    /// Lists dead-lettered records, oldest first.
    async fn find_dead_lettered(&self) -> Result<Vec<SagaRecord>>;

    /// Moves a record to the dead-letter holding state and drops its lease.
    async fn mark_dead_lettered(&self, saga_id: SagaId, reason: &str) -> Result<()>;

    /// Atomically takes ownership of an incomplete record.
    ///
    /// Succeeds only when the record is unowned or its lease expired. A live
    /// lease blocks every claimant, `owner` included, since the holder may be
    /// executing the saga right now. Returns `None` in that case or when the
    /// record no longer needs work.
    async fn try_claim(
        &self,
        saga_id: SagaId,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<SagaRecord>>;

    /// Drops `owner`'s lease on the record. A no-op if someone else owns it.
    async fn release_claim(&self, saga_id: SagaId, owner: &str) -> Result<()>;

    /// Records a failed recovery attempt and returns the new attempt count.
    async fn record_recovery_failure(&self, saga_id: SagaId, error: &str) -> Result<u32>;
}
