//! Step capability and step outcomes.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::SagaContext;

/// Timeout applied to a step that does not declare its own.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Values a successful step hands back for the saga context.
pub type StepOutput = BTreeMap<String, serde_json::Value>;

/// Outcome of one call to a step's `execute` or `compensate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepResult {
    /// The step succeeded; its outputs are merged into the context.
    Success(StepOutput),
    /// The step failed with a human-readable error.
    Failure(String),
}

impl StepResult {
    /// A success with no outputs.
    pub fn success() -> Self {
        StepResult::Success(StepOutput::new())
    }

    /// A success carrying one output value.
    pub fn success_with(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::success().with(key, value)
    }

    /// A failure with the given error text.
    pub fn failure(error: impl Into<String>) -> Self {
        StepResult::Failure(error.into())
    }

    /// Adds an output to a success. Failures are returned unchanged.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if let StepResult::Success(outputs) = &mut self {
            outputs.insert(key.into(), value.into());
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success(_))
    }

    /// Returns the outputs of a success.
    pub fn outputs(&self) -> Option<&StepOutput> {
        match self {
            StepResult::Success(outputs) => Some(outputs),
            StepResult::Failure(_) => None,
        }
    }

    /// Returns the error of a failure.
    pub fn error(&self) -> Option<&str> {
        match self {
            StepResult::Success(_) => None,
            StepResult::Failure(error) => Some(error.as_str()),
        }
    }
}

impl<E: std::fmt::Display> From<Result<StepOutput, E>> for StepResult {
    fn from(result: Result<StepOutput, E>) -> Self {
        match result {
            Ok(outputs) => StepResult::Success(outputs),
            Err(e) => StepResult::Failure(e.to_string()),
        }
    }
}

/// One unit of forward work in a saga together with its semantic undo.
///
/// Every step with an externally observable effect must provide a
/// compensation that reverses it with a new forward action (refund,
/// release, cancel). `compensate` must succeed when the effect was already
/// undone or never happened, because it may run more than once.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Unique name of the step within its saga definition.
    fn name(&self) -> &str;

    /// Performs the forward action.
    ///
    /// If [`SagaStep::is_idempotent`] returns true, calling this twice with the
    /// same context must not repeat the effect; use
    /// [`SagaContext::idempotency_key`] to detect the repeat.
    async fn execute(&self, ctx: &SagaContext) -> StepResult;

    /// Undoes the forward action.
    async fn compensate(&self, ctx: &SagaContext) -> StepResult;

    /// Whether `execute` may safely be retried with the same context.
    fn is_idempotent(&self) -> bool {
        false
    }

    /// Upper bound on one `execute` or `compensate` call.
    fn timeout(&self) -> Duration {
        DEFAULT_STEP_TIMEOUT
    }
}

/// Awaits a step call, turning an elapsed timeout into a failure.
pub(crate) async fn bounded<F>(step: &str, timeout: Duration, call: F) -> StepResult
where
    F: Future<Output = StepResult>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(step, ?timeout, "saga step timed out");
            StepResult::failure(format!("step '{step}' timed out after {timeout:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_builders() {
        let result = StepResult::success_with("payment_id", "PAY-1").with("amount_cents", 100);
        assert!(result.is_success());
        assert_eq!(result.error(), None);
        let outputs = result.outputs().unwrap();
        assert_eq!(outputs["payment_id"], json!("PAY-1"));
        assert_eq!(outputs["amount_cents"], json!(100));
    }

    #[test]
    fn test_failure_ignores_outputs() {
        let result = StepResult::failure("declined").with("payment_id", "PAY-1");
        assert!(!result.is_success());
        assert_eq!(result.error(), Some("declined"));
        assert!(result.outputs().is_none());
    }

    #[test]
    fn test_from_result() {
        let ok: Result<StepOutput, String> = Ok(StepOutput::new());
        assert!(StepResult::from(ok).is_success());

        let err: Result<StepOutput, String> = Err("boom".to_string());
        assert_eq!(StepResult::from(err), StepResult::failure("boom"));
    }

    #[tokio::test]
    async fn test_bounded_passes_through_result() {
        let result = bounded("fast", Duration::from_secs(1), async {
            StepResult::success_with("k", "v")
        })
        .await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result = bounded("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StepResult::success()
        })
        .await;
        assert!(result.error().unwrap().contains("timed out"));
    }
}
