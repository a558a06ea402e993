//! Saga state machine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► Running ──┬──► Completed
///                       └──► Compensating ──┬──► Failed
///                                           └──► CompensationFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    /// Saga has been assembled but not started.
    #[default]
    Pending,

    /// Forward steps are being executed.
    Running,

    /// A step failed and compensating actions are in progress.
    Compensating,

    /// All steps completed successfully (terminal state).
    Completed,

    /// Every completed step was compensated after a failure (terminal state).
    Failed,

    /// A compensating action itself failed; needs an operator (terminal state).
    CompensationFailed,
}

/// An attempt to move the state machine along an edge it does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid saga transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SagaState,
    pub to: SagaState,
}

impl SagaState {
    /// All states, in lifecycle order.
    pub const ALL: [SagaState; 6] = [
        SagaState::Pending,
        SagaState::Running,
        SagaState::Compensating,
        SagaState::Completed,
        SagaState::Failed,
        SagaState::CompensationFailed,
    ];

    /// Returns true if the transition table has an edge `self -> next`.
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        matches!(
            (self, next),
            (SagaState::Pending, SagaState::Running)
                | (SagaState::Running, SagaState::Completed)
                | (SagaState::Running, SagaState::Compensating)
                | (SagaState::Compensating, SagaState::Failed)
                | (SagaState::Compensating, SagaState::CompensationFailed)
        )
    }

    /// Returns the next state, or an error if the edge is not allowed.
    pub fn transition(self, next: SagaState) -> Result<SagaState, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Failed | SagaState::CompensationFailed
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Pending => "Pending",
            SagaState::Running => "Running",
            SagaState::Compensating => "Compensating",
            SagaState::Completed => "Completed",
            SagaState::Failed => "Failed",
            SagaState::CompensationFailed => "CompensationFailed",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown saga state: {s}"))
    }
}
