//! A step that fans out to inner steps concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::context::SagaContext;
use crate::step::{SagaStep, StepOutput, StepResult, bounded};

/// Runs its inner steps concurrently and joins all of them.
///
/// To the orchestrator the group is a single step. If any inner step fails,
/// the inner steps that succeeded are compensated before the group reports
/// failure, so a failed group leaves nothing behind. Inner outputs are merged
/// into one output set; two inner steps writing different values under one
/// key fail the group.
pub struct ParallelGroup {
    name: String,
    steps: Vec<Arc<dyn SagaStep>>,
}

impl ParallelGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(self, step: impl SagaStep + 'static) -> Self {
        self.shared_step(Arc::new(step))
    }

    pub fn shared_step(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    /// Compensates `succeeded` in reverse declaration order, returning the
    /// errors of those that failed.
    async fn undo(&self, succeeded: &[&Arc<dyn SagaStep>], ctx: &SagaContext) -> Vec<String> {
        let mut errors = Vec::new();
        for step in succeeded.iter().rev() {
            let result = bounded(step.name(), step.timeout(), step.compensate(ctx)).await;
            if let StepResult::Failure(error) = result {
                tracing::error!(
                    group = %self.name,
                    step = step.name(),
                    error = %error,
                    "parallel inner compensation failed"
                );
                errors.push(format!("compensation of {} failed: {}", step.name(), error));
            }
        }
        errors
    }
}

#[async_trait]
impl SagaStep for ParallelGroup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &SagaContext) -> StepResult {
        let results = join_all(
            self.steps
                .iter()
                .map(|step| bounded(step.name(), step.timeout(), step.execute(ctx))),
        )
        .await;

        let mut scratch = ctx.clone();
        let mut outputs = StepOutput::new();
        let mut succeeded = Vec::new();
        let mut errors = Vec::new();

        for (step, result) in self.steps.iter().zip(results) {
            match result {
                StepResult::Success(inner) => {
                    succeeded.push(step);
                    if let Err(e) = scratch.merge(&inner) {
                        errors.push(format!("{}: {}", step.name(), e));
                        continue;
                    }
                    outputs.extend(inner);
                }
                StepResult::Failure(error) => errors.push(format!("{}: {}", step.name(), error)),
            }
        }

        if errors.is_empty() {
            return StepResult::Success(outputs);
        }

        tracing::warn!(
            group = %self.name,
            succeeded = succeeded.len(),
            failed = errors.len(),
            "parallel group failed, compensating inner steps"
        );
        errors.extend(self.undo(&succeeded, &scratch).await);
        StepResult::failure(errors.join("; "))
    }

    async fn compensate(&self, ctx: &SagaContext) -> StepResult {
        let all: Vec<_> = self.steps.iter().collect();
        let errors = self.undo(&all, ctx).await;
        if errors.is_empty() {
            StepResult::success()
        } else {
            StepResult::failure(errors.join("; "))
        }
    }

    fn is_idempotent(&self) -> bool {
        self.steps.iter().all(|step| step.is_idempotent())
    }

    /// Upper bound for the whole group: the sum of the inner timeouts.
    fn timeout(&self) -> Duration {
        self.steps.iter().map(|step| step.timeout()).sum()
    }
}
