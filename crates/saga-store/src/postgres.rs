use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, SagaCheckpoint, SagaId, SagaRecord, SagaState, SagaStoreError, Version,
    lease_deadline,
    store::{SagaPersistence, SaveOptions},
};

const RECORD_COLUMNS: &str = r#"
    saga_id, saga_type, correlation_id, state, completed_steps, compensated_steps,
    context, failure, compensation_error, version, owner, lease_expires_at,
    recovery_attempts, last_recovery_error, dead_lettered_at, dead_letter_reason,
    created_at, updated_at
"#;

/// PostgreSQL-backed saga store.
///
/// Exclusivity is enforced inside the `UPDATE ... WHERE` clauses: a write
/// only lands if the version matches and no other owner holds a live lease.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_record(row: PgRow) -> Result<SagaRecord> {
        let saga_id = SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?);
        let state: String = row.try_get("state")?;
        let state = state
            .parse::<SagaState>()
            .map_err(|reason| SagaStoreError::Corrupt { saga_id, reason })?;
        let attempts: i32 = row.try_get("recovery_attempts")?;

        Ok(SagaRecord {
            saga_id,
            saga_type: row.try_get("saga_type")?,
            correlation_id: row.try_get("correlation_id")?,
            state,
            completed_steps: serde_json::from_value(row.try_get("completed_steps")?)?,
            compensated_steps: serde_json::from_value(row.try_get("compensated_steps")?)?,
            context: row.try_get("context")?,
            failure: row.try_get("failure")?,
            compensation_error: row.try_get("compensation_error")?,
            version: Version::new(row.try_get("version")?),
            owner: row.try_get("owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            recovery_attempts: u32::try_from(attempts).unwrap_or_default(),
            last_recovery_error: row.try_get("last_recovery_error")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            dead_letter_reason: row.try_get("dead_letter_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Works out why a conditional write matched no row.
    async fn rejection(
        &self,
        checkpoint: &SagaCheckpoint,
        expected: Option<Version>,
    ) -> SagaStoreError {
        let saga_id = checkpoint.saga_id;
        let current = match self.find_by_id(saga_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return SagaStoreError::NotFound(saga_id),
            Err(e) => return e,
        };

        if let Some(expected) = expected
            && current.version != expected
        {
            return SagaStoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual: current.version,
            };
        }

        match current.lease_held_by_other(checkpoint.owner.as_deref(), Utc::now()) {
            Some(owner) => SagaStoreError::LeaseHeld {
                saga_id,
                owner: owner.to_string(),
            },
            // Lease expired between the write and this read; report the race as a conflict.
            None => SagaStoreError::ConcurrencyConflict {
                saga_id,
                expected: expected.unwrap_or(current.version),
                actual: current.version,
            },
        }
    }
}

#[async_trait]
impl SagaPersistence for PostgresSagaStore {
    async fn save(&self, checkpoint: &SagaCheckpoint, options: SaveOptions) -> Result<Version> {
        let now = Utc::now();
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
        let completed = serde_json::to_value(&checkpoint.completed_steps)?;
        let compensated = serde_json::to_value(&checkpoint.compensated_steps)?;

        let version: Option<i64> = if options.expected_version == Some(Version::initial()) {
            sqlx::query_scalar(
                r#"
                INSERT INTO sagas (saga_id, saga_type, correlation_id, state, completed_steps,
                                   compensated_steps, context, failure, compensation_error,
                                   version, owner, lease_expires_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 1, $10, $11, $12, $12)
                ON CONFLICT (saga_id) DO NOTHING
                RETURNING version
                "#,
            )
            .bind(checkpoint.saga_id.as_uuid())
            .bind(&checkpoint.saga_type)
            .bind(&checkpoint.correlation_id)
            .bind(checkpoint.state.as_str())
            .bind(&completed)
            .bind(&compensated)
            .bind(&checkpoint.context)
            .bind(&checkpoint.failure)
            .bind(&checkpoint.compensation_error)
            .bind(&owner)
            .bind(lease_expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_scalar(
                r#"
                UPDATE sagas
                SET saga_type = $2, correlation_id = $3, state = $4, completed_steps = $5,
                    compensated_steps = $6, context = $7, failure = $8,
                    compensation_error = $9, owner = $10, lease_expires_at = $11,
                    version = version + 1, updated_at = $12
                WHERE saga_id = $1
                  AND ($13::BIGINT IS NULL OR version = $13)
                  AND (owner IS NULL OR owner IS NOT DISTINCT FROM $14 OR lease_expires_at <= $12)
                RETURNING version
                "#,
            )
            .bind(checkpoint.saga_id.as_uuid())
            .bind(&checkpoint.saga_type)
            .bind(&checkpoint.correlation_id)
            .bind(checkpoint.state.as_str())
            .bind(&completed)
            .bind(&compensated)
            .bind(&checkpoint.context)
            .bind(&checkpoint.failure)
            .bind(&checkpoint.compensation_error)
            .bind(&owner)
            .bind(lease_expires_at)
            .bind(now)
            .bind(options.expected_version.map(|v| v.as_i64()))
            .bind(&checkpoint.owner)
            .fetch_optional(&self.pool)
            .await?
        };

        match version {
            Some(version) => Ok(Version::new(version)),
            None => {
                metrics::counter!("saga_store_conflicts_total").increment(1);
                Err(self.rejection(checkpoint, options.expected_version).await)
            }
        }
    }

    async fn find_by_id(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM sagas WHERE saga_id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn find_incomplete(&self) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM sagas
            WHERE state IN ('Pending', 'Running', 'Compensating') AND dead_lettered_at IS NULL
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn find_dead_lettered(&self) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM sagas
            WHERE dead_lettered_at IS NOT NULL
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn mark_dead_lettered(&self, saga_id: SagaId, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET dead_lettered_at = NOW(), dead_letter_reason = $2, owner = NULL,
                lease_expires_at = NULL, version = version + 1, updated_at = NOW()
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaStoreError::NotFound(saga_id));
        }
        Ok(())
    }

    async fn try_claim(
        &self,
        saga_id: SagaId,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<SagaRecord>> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            UPDATE sagas
            SET owner = $2, lease_expires_at = $3, version = version + 1, updated_at = $4
            WHERE saga_id = $1
              AND state IN ('Pending', 'Running', 'Compensating')
              AND dead_lettered_at IS NULL
              AND (owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= $4)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(saga_id.as_uuid())
        .bind(owner)
        .bind(lease_deadline(now, lease))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_record(row).map(Some),
            None => match self.find_by_id(saga_id).await? {
                Some(_) => Ok(None),
                None => Err(SagaStoreError::NotFound(saga_id)),
            },
        }
    }

    async fn release_claim(&self, saga_id: SagaId, owner: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sagas
            SET owner = NULL, lease_expires_at = NULL, version = version + 1, updated_at = NOW()
            WHERE saga_id = $1 AND owner = $2
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_recovery_failure(&self, saga_id: SagaId, error: &str) -> Result<u32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE sagas
            SET recovery_attempts = recovery_attempts + 1, last_recovery_error = $2,
                version = version + 1, updated_at = NOW()
            WHERE saga_id = $1
            RETURNING recovery_attempts
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        attempts
            .map(|n| u32::try_from(n).unwrap_or_default())
            .ok_or(SagaStoreError::NotFound(saga_id))
    }
}
