use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaId, SagaState};

/// Version number of a saga record, used to fence concurrent writers.
///
/// A record that does not exist yet is at version 0; the first write
/// produces version 1 and every later write increments by 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for a record that was never written.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) for the first write.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// The persisted projection of one saga instance.
///
/// Created on the first write, rewritten after every step transition and
/// never deleted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_id: SagaId,
    pub saga_type: String,
    /// External business key (e.g. order id).
    pub correlation_id: String,
    pub state: SagaState,
    /// Completed forward steps, in completion order.
    pub completed_steps: Vec<String>,
    /// Steps whose compensation succeeded, in compensation order.
    pub compensated_steps: Vec<String>,
    /// The serialized saga context.
    pub context: serde_json::Value,
    /// The error of the forward step that triggered compensation.
    pub failure: Option<String>,
    /// The error of the compensation that could not be completed.
    pub compensation_error: Option<String>,
    pub version: Version,
    pub owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
    pub last_recovery_error: Option<String>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub dead_letter_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Returns true if the saga still needs work and has not been dead-lettered.
    pub fn is_incomplete(&self) -> bool {
        !self.state.is_terminal() && self.dead_lettered_at.is_none()
    }

    /// Returns true if the record was moved to the dead-letter holding state.
    pub fn is_dead_lettered(&self) -> bool {
        self.dead_lettered_at.is_some()
    }

    /// Returns true if any owner, including a caller, holds an unexpired lease.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.owner.is_some() && self.lease_expires_at.is_some_and(|expires| expires > now)
    }

    /// Returns the owner if someone other than `caller` holds a live lease.
    pub fn lease_held_by_other(&self, caller: Option<&str>, now: DateTime<Utc>) -> Option<&str> {
        let owner = self.owner.as_deref()?;
        let live = self.lease_expires_at.is_some_and(|expires| expires > now);
        (live && Some(owner) != caller).then_some(owner)
    }

    /// Steps completed but not yet compensated, most recent first.
    pub fn pending_compensations(&self) -> Vec<String> {
        self.completed_steps
            .iter()
            .rev()
            .filter(|step| !self.compensated_steps.contains(step))
            .cloned()
            .collect()
    }
}

/// Everything the orchestrator writes after a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaCheckpoint {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub correlation_id: String,
    pub state: SagaState,
    pub completed_steps: Vec<String>,
    pub compensated_steps: Vec<String>,
    pub context: serde_json::Value,
    pub failure: Option<String>,
    pub compensation_error: Option<String>,
    /// The writer; a non-terminal save renews this owner's lease.
    pub owner: Option<String>,
    pub lease: Duration,
}

/// Computes when a lease taken at `now` runs out.
pub fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SagaRecord {
        let now = Utc::now();
        SagaRecord {
            saga_id: SagaId::new(),
            saga_type: "OrderFulfillment".to_string(),
            correlation_id: "order-1".to_string(),
            state: SagaState::Running,
            completed_steps: vec![],
            compensated_steps: vec![],
            context: serde_json::json!({}),
            failure: None,
            compensation_error: None,
            version: Version::first(),
            owner: None,
            lease_expires_at: None,
            recovery_attempts: 0,
            last_recovery_error: None,
            dead_lettered_at: None,
            dead_letter_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_version_sequence() {
        assert_eq!(Version::initial().next(), Version::first());
        assert_eq!(Version::first().next().as_i64(), 2);
    }

    #[test]
    fn test_incomplete_excludes_terminal_and_dead_lettered() {
        let mut r = record();
        assert!(r.is_incomplete());

        r.state = SagaState::Failed;
        assert!(!r.is_incomplete());

        r.state = SagaState::Compensating;
        r.dead_lettered_at = Some(Utc::now());
        assert!(!r.is_incomplete());
        assert!(r.is_dead_lettered());
    }

    #[test]
    fn test_lease_held_by_other() {
        let now = Utc::now();
        let mut r = record();
        assert_eq!(r.lease_held_by_other(Some("a"), now), None);

        r.owner = Some("a".to_string());
        r.lease_expires_at = Some(lease_deadline(now, Duration::from_secs(60)));
        assert_eq!(r.lease_held_by_other(Some("a"), now), None);
        assert_eq!(r.lease_held_by_other(Some("b"), now), Some("a"));
        assert_eq!(r.lease_held_by_other(None, now), Some("a"));

        r.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        assert_eq!(r.lease_held_by_other(Some("b"), now), None);
    }

    #[test]
    fn test_has_live_lease_ignores_caller() {
        let now = Utc::now();
        let mut r = record();
        assert!(!r.has_live_lease(now));

        r.owner = Some("a".to_string());
        r.lease_expires_at = Some(lease_deadline(now, Duration::from_secs(60)));
        assert!(r.has_live_lease(now));

        r.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!r.has_live_lease(now));
    }

    #[test]
    fn test_pending_compensations_skip_compensated_steps() {
        let mut r = record();
        r.completed_steps = vec!["a".into(), "b".into(), "c".into()];
        r.compensated_steps = vec!["c".into()];
        assert_eq!(r.pending_compensations(), vec!["b", "a"]);
    }

    #[test]
    fn test_lease_deadline_saturates() {
        let now = Utc::now();
        assert_eq!(lease_deadline(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(lease_deadline(now, Duration::from_secs(1)) > now);
    }
}
