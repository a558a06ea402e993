//! Saga transition events.
//!
//! The orchestrator records one event per transition in the run's history
//! and logs it with the saga's identity attached.

use chrono::{DateTime, Utc};
use common::{SagaId, SagaState};
use serde::{Deserialize, Serialize};

use crate::escalation::Escalation;

/// Events that can occur during saga execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// Saga execution started (Pending -> Running).
    SagaStarted(SagaStartedData),

    /// A persisted saga was picked up again after a restart.
    SagaResumed(SagaResumedData),

    /// A saga step completed successfully.
    StepCompleted(StepData),

    /// A saga step failed or timed out.
    StepFailed(StepFailedData),

    /// Compensation started after a step failure (Running -> Compensating).
    CompensationStarted(CompensationData),

    /// A compensation step completed successfully.
    CompensationStepCompleted(StepData),

    /// A compensation step failed after exhausting its retries.
    CompensationStepFailed(StepFailedData),

    /// Saga completed successfully.
    SagaCompleted(SagaEndedData),

    /// Saga failed after every completed step was compensated.
    SagaFailed(SagaEndedData),

    /// Saga stopped with a compensation that could not be completed.
    SagaCompensationFailed(SagaEndedData),

    /// A CompensationFailed saga was handed to an operator.
    SagaEscalated(EscalationData),
}

impl SagaEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::SagaResumed(_) => "SagaResumed",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaFailed(_) => "SagaFailed",
            SagaEvent::SagaCompensationFailed(_) => "SagaCompensationFailed",
            SagaEvent::SagaEscalated(_) => "SagaEscalated",
        }
    }

    /// Returns the step name for step-level events.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            SagaEvent::StepCompleted(data) | SagaEvent::CompensationStepCompleted(data) => {
                Some(&data.step_name)
            }
            SagaEvent::StepFailed(data) | SagaEvent::CompensationStepFailed(data) => {
                Some(&data.step_name)
            }
            _ => None,
        }
    }
}

/// Data for SagaStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
}

/// Data for SagaResumed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaResumedData {
    /// The state the record was in when it was picked up.
    pub from_state: SagaState,
    /// Steps already completed before the restart.
    pub completed_steps: usize,
    pub resumed_at: DateTime<Utc>,
}

/// Data for step completed events (just the step name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub step_name: String,
}

/// Data for step failure events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_name: String,
    pub error: String,
}

/// Data for CompensationStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationData {
    /// The step whose failure triggered compensation.
    pub from_step: String,
}

/// Data for the terminal events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEndedData {
    pub state: SagaState,
    pub reason: Option<String>,
    pub ended_at: DateTime<Utc>,
}

/// Data for SagaEscalated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationData {
    pub escalation: Escalation,
    pub raised_at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_started(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            saga_id,
            saga_type: saga_type.into(),
            correlation_id: correlation_id.into(),
            started_at: Utc::now(),
        })
    }

    pub fn saga_resumed(from_state: SagaState, completed_steps: usize) -> Self {
        SagaEvent::SagaResumed(SagaResumedData {
            from_state,
            completed_steps,
            resumed_at: Utc::now(),
        })
    }

    pub fn step_completed(step_name: impl Into<String>) -> Self {
        SagaEvent::StepCompleted(StepData {
            step_name: step_name.into(),
        })
    }

    pub fn step_failed(step_name: impl Into<String>, error: impl Into<String>) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step_name: step_name.into(),
            error: error.into(),
        })
    }

    pub fn compensation_started(from_step: impl Into<String>) -> Self {
        SagaEvent::CompensationStarted(CompensationData {
            from_step: from_step.into(),
        })
    }

    pub fn compensation_step_completed(step_name: impl Into<String>) -> Self {
        SagaEvent::CompensationStepCompleted(StepData {
            step_name: step_name.into(),
        })
    }

    pub fn compensation_step_failed(step_name: impl Into<String>, error: impl Into<String>) -> Self {
        SagaEvent::CompensationStepFailed(StepFailedData {
            step_name: step_name.into(),
            error: error.into(),
        })
    }

    /// Builds the terminal event matching `state`.
    pub fn saga_ended(state: SagaState, reason: Option<String>) -> Self {
        let data = SagaEndedData {
            state,
            reason,
            ended_at: Utc::now(),
        };
        match state {
            SagaState::Completed => SagaEvent::SagaCompleted(data),
            SagaState::CompensationFailed => SagaEvent::SagaCompensationFailed(data),
            _ => SagaEvent::SagaFailed(data),
        }
    }

    pub fn saga_escalated(escalation: Escalation) -> Self {
        SagaEvent::SagaEscalated(EscalationData {
            escalation,
            raised_at: Utc::now(),
        })
    }
}
